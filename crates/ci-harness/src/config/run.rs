use std::collections::BTreeMap;

use api_types::EnvFlavor;
use api_types::JobType;
use api_types::RoleSizes;
use api_types::ServerArgs;
use api_types::TestJobSpec;
use clap::Parser;

use crate::config::driver::DriverArgs;

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, help = "Container image with sglang and ci-harness installed")]
    pub image: String,

    #[arg(long, help = "Topology: single, multi-pd-mix or multi-pd-separation")]
    pub kube_job_type: JobType,

    #[arg(long, default_value = "default", help = "Namespace the job runs in")]
    pub kube_name_space: String,

    #[arg(long, default_value = "sglang-ci", help = "Job name prefix; a run-id is appended")]
    pub kube_job_name_prefix: String,

    #[arg(long, default_value = "sglang", help = "sglang checkout inside the image")]
    pub sglang_source_relative_path: String,

    #[arg(long, help = "Test case path relative to the sglang checkout")]
    pub test_case: String,

    #[arg(long, default_value = "ci", help = "debug or ci")]
    pub env: EnvFlavor,

    #[arg(long, help = "Model path inside the image")]
    pub model_path: String,

    #[arg(long, default_value_t = 1, help = "NPUs for a single job")]
    pub npus: u32,

    #[arg(long, default_value_t = 2, help = "Replica count for multi-pd-mix")]
    pub replicas: u32,

    #[arg(long, default_value_t = 1, help = "Prefill pods for multi-pd-separation")]
    pub prefill_size: u32,

    #[arg(long, default_value_t = 1, help = "Decode pods for multi-pd-separation")]
    pub decode_size: u32,

    #[arg(long, default_value_t = 1, help = "Router pods for multi-pd-separation")]
    pub router_size: u32,

    #[arg(long, default_value_t = 16, help = "NPUs per multi-node pod")]
    pub npus_per_pod: u32,

    #[arg(
        long,
        allow_hyphen_values = true,
        value_delimiter = ' ',
        help = "Extra server arguments for every role, space separated"
    )]
    pub server_args: Vec<String>,

    #[arg(long, allow_hyphen_values = true, value_delimiter = ' ')]
    pub prefill_args: Vec<String>,

    #[arg(long, allow_hyphen_values = true, value_delimiter = ' ')]
    pub decode_args: Vec<String>,

    #[arg(
        long = "pass-env",
        value_parser = parse_key_value,
        help = "KEY=VALUE forwarded into every container, repeatable"
    )]
    pub pass_env: Vec<(String, String)>,

    #[command(flatten)]
    pub driver: DriverArgs,
}

impl RunArgs {
    pub fn to_spec(&self) -> TestJobSpec {
        TestJobSpec {
            job_type: self.kube_job_type,
            image: self.image.clone(),
            namespace: self.kube_name_space.clone(),
            job_name_prefix: self.kube_job_name_prefix.clone(),
            model_path: self.model_path.clone(),
            test_case: self.test_case.clone(),
            sglang_source_relative_path: self.sglang_source_relative_path.clone(),
            env: self.env,
            sizes: RoleSizes {
                npus: self.npus,
                replicas: self.replicas,
                prefill: self.prefill_size,
                decode: self.decode_size,
                router: self.router_size,
                npus_per_pod: self.npus_per_pod,
            },
            server_args: ServerArgs {
                extra: non_empty(&self.server_args),
                prefill: non_empty(&self.prefill_args),
                decode: non_empty(&self.decode_args),
            },
            pass_env: self.pass_env.iter().cloned().collect::<BTreeMap<_, _>>(),
        }
    }
}

pub(crate) fn non_empty(args: &[String]) -> Vec<String> {
    args.iter().filter(|arg| !arg.is_empty()).cloned().collect()
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}
