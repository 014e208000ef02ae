use std::env;

fn main() {
    if let Err(err) = emit_git_variables() {
        println!("cargo:warning=vergen: {err}");
    }

    let version = env::var("VERSION").unwrap_or_else(|_| "latest".to_string());
    println!("cargo:rustc-env=IMAGE_VERSION={version}");
    println!("cargo:rerun-if-env-changed=VERSION");
}

fn emit_git_variables() -> anyhow::Result<()> {
    let mut builder = vergen_gitcl::GitclBuilder::default();

    builder.sha(false);
    builder.dirty(false);

    let gitcl = builder.build()?;

    vergen_gitcl::Emitter::default()
        .fail_on_error()
        .add_instructions(&gitcl)?
        .emit()
}
