use std::sync::LazyLock;

use crate::build_info::build_info;

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    let info = build_info();
    format!(
        "{}-{}{}",
        env!("IMAGE_VERSION"),
        info.commit_sha1.map(short_sha).unwrap_or("unknown"),
        if info.git_dirty { "-dirty" } else { "" }
    )
});

fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}
