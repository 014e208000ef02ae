use std::path::PathBuf;
use std::time::Duration;

use api_types::JobType;
use api_types::ServerArgs;
use clap::Parser;

use crate::config::run::non_empty;
use crate::launcher::plan::ServerSettings;
use crate::launcher::LaunchContext;
use crate::launcher::TestSettings;

/// Everything is read from the environment the rendered pod template sets.
#[derive(Parser, Debug, Clone)]
pub struct LaunchArgs {
    #[arg(long, env = "KUBECONFIG", value_hint = clap::ValueHint::FilePath)]
    pub kubeconfig: Option<PathBuf>,

    #[arg(long, env = "NAMESPACE")]
    pub namespace: String,

    #[arg(long, env = "KUBE_CONFIG_MAP", help = "Rendezvous ConfigMap of this run")]
    pub config_map: String,

    #[arg(long, env = "KUBE_JOB_TYPE")]
    pub job_type: JobType,

    #[arg(long, env = "KUBE_JOB_NAME")]
    pub job_name: String,

    #[arg(long, env = "HOSTNAME")]
    pub hostname: String,

    #[arg(long, env = "POD_IP")]
    pub pod_ip: String,

    #[arg(long, env = "METRICS_DATA_FILE", value_hint = clap::ValueHint::FilePath)]
    pub metrics_data_file: Option<PathBuf>,

    #[arg(long, env = "MODEL_PATH")]
    pub model_path: String,

    #[arg(long, env = "TEST_CASE")]
    pub test_case: String,

    #[arg(long, env = "SGLANG_SOURCE_PATH", default_value = "sglang")]
    pub sglang_source_path: PathBuf,

    #[arg(long, env = "SINGLE_NPUS", default_value_t = 1)]
    pub npus: u32,

    #[arg(long, env = "MIX_REPLICAS", default_value_t = 2)]
    pub replicas: u32,

    #[arg(long, env = "PREFILL_SIZE", default_value_t = 1)]
    pub prefill_size: usize,

    #[arg(long, env = "DECODE_SIZE", default_value_t = 1)]
    pub decode_size: usize,

    #[arg(long, env = "NPUS_PER_POD", default_value_t = 16)]
    pub npus_per_pod: u32,

    #[arg(long, env = "SERVER_EXTRA_ARGS", allow_hyphen_values = true, value_delimiter = ' ')]
    pub server_args: Vec<String>,

    #[arg(long, env = "PREFILL_ARGS", allow_hyphen_values = true, value_delimiter = ' ')]
    pub prefill_args: Vec<String>,

    #[arg(long, env = "DECODE_ARGS", allow_hyphen_values = true, value_delimiter = ' ')]
    pub decode_args: Vec<String>,

    #[arg(long, default_value_t = 900, help = "Seconds to wait for required peers")]
    pub rendezvous_timeout_secs: u64,

    #[arg(long, default_value_t = 1800, help = "Seconds to wait for /health")]
    pub health_timeout_secs: u64,

    #[arg(long, default_value_t = 1800, help = "Seconds to wait for router upstreams")]
    pub upstream_timeout_secs: u64,

    #[arg(long, default_value_t = 60, help = "Seconds between healthy and the first test request")]
    pub warmup_secs: u64,

    #[arg(long, default_value_t = 7200, help = "Seconds the test case may run")]
    pub test_timeout_secs: u64,
}

impl LaunchArgs {
    pub fn to_context(&self) -> LaunchContext {
        LaunchContext {
            job_type: self.job_type,
            hostname: self.hostname.clone(),
            pod_ip: self.pod_ip.clone(),
            server: ServerSettings {
                model_path: self.model_path.clone(),
                npus: self.npus,
                replicas: self.replicas,
                npus_per_pod: self.npus_per_pod,
                args: ServerArgs {
                    extra: non_empty(&self.server_args),
                    prefill: non_empty(&self.prefill_args),
                    decode: non_empty(&self.decode_args),
                },
            },
            prefill_size: self.prefill_size,
            decode_size: self.decode_size,
            test: TestSettings {
                test_case: self.test_case.clone(),
                source_dir: self.sglang_source_path.clone(),
                metrics_file: self.metrics_data_file.clone(),
                warmup: Duration::from_secs(self.warmup_secs),
                timeout: Duration::from_secs(self.test_timeout_secs),
            },
            rendezvous_timeout: Duration::from_secs(self.rendezvous_timeout_secs),
            health_timeout: Duration::from_secs(self.health_timeout_secs),
            upstream_timeout: Duration::from_secs(self.upstream_timeout_secs),
        }
    }
}
