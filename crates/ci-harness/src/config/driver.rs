use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use utils::logging::LOG_PATH_ENV_VAR;

use crate::orchestrator::OrchestratorConfig;
use crate::orchestrator::DEFAULT_LOG_COMMAND;

/// Settings shared by `run` and `batch`.
#[derive(Args, Debug, Clone)]
pub struct DriverArgs {
    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        default_value = ".",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory the rendered manifests are written to"
    )]
    pub workdir: PathBuf,

    #[arg(
        long,
        default_value_t = 1800,
        help = "Seconds to wait for every pod of a job to be Running and Ready"
    )]
    pub ready_timeout_secs: u64,

    #[arg(
        long,
        help = "Fail the job when pods are not ready in time instead of following the log anyway"
    )]
    pub ready_timeout_fatal: bool,

    #[arg(
        long,
        default_value_t = 7200,
        help = "Seconds to wait for the test summary in the leader pod's log"
    )]
    pub monitor_timeout_secs: u64,

    #[arg(
        long,
        default_value = DEFAULT_LOG_COMMAND,
        help = "Command following the leader pod's log; {namespace} and {pod} are substituted"
    )]
    pub log_command: String,

    #[arg(
        long,
        env = LOG_PATH_ENV_VAR,
        value_hint = clap::ValueHint::DirPath,
        help = "Also write logs to a daily rolling file in this directory"
    )]
    pub log_dir: Option<PathBuf>,
}

impl From<&DriverArgs> for OrchestratorConfig {
    fn from(args: &DriverArgs) -> Self {
        Self {
            workdir: args.workdir.clone(),
            ready_timeout: Duration::from_secs(args.ready_timeout_secs),
            ready_timeout_fatal: args.ready_timeout_fatal,
            monitor_timeout: Duration::from_secs(args.monitor_timeout_secs),
            log_command: args.log_command.clone(),
        }
    }
}
