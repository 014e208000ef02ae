//! In-pod launcher.
//!
//! Each pod of a job runs `ci-harness launch`. The launcher derives its role
//! from the hostname, registers in the rendezvous directory, resolves the
//! peers its role depends on, starts the server and, on the leader pod, runs
//! the test case through the completion monitor.

pub mod health;
pub mod plan;
pub mod role;

use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;
use std::time::Duration;

use api_types::JobType;
use error_stack::ResultExt;
use tokio::process::Child;
use tokio::process::Command;
use tracing::info;

use crate::error::HarnessError;
use crate::error::HarnessResult;
use crate::launcher::health::wait_healthy;
use crate::launcher::health::wait_reachable;
use crate::launcher::health::HEALTH_INTERVAL;
use crate::launcher::health::REACHABILITY_INTERVAL;
use crate::launcher::plan::disaggregated_plan;
use crate::launcher::plan::mix_plan;
use crate::launcher::plan::router_plan;
use crate::launcher::plan::router_upstreams;
use crate::launcher::plan::single_plan;
use crate::launcher::plan::DisaggregatedPeers;
use crate::launcher::plan::LaunchPlan;
use crate::launcher::plan::ServerSettings;
use crate::launcher::role::NodeRole;
use crate::launcher::role::RoleKind;
use crate::monitor;
use crate::monitor::CompletionMonitor;
use crate::monitor::Echo;
use crate::monitor::MonitorOutcome;
use crate::rendezvous::Peer;
use crate::rendezvous::RendezvousDirectory;
use crate::rendezvous::RoleMatcher;

pub const METRICS_FILE_ENV: &str = "METRICS_DATA_FILE";

/// Launcher progress, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    WaitingForDirectory,
    ResolvingAddress,
    Launching,
    Running,
}

/// Test client settings for the leader pod.
#[derive(Debug, Clone)]
pub struct TestSettings {
    /// Test case path relative to `source_dir`
    pub test_case: String,
    pub source_dir: PathBuf,
    pub metrics_file: Option<PathBuf>,
    pub warmup: Duration,
    pub timeout: Duration,
}

/// Everything the current pod knows at start.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub job_type: JobType,
    pub hostname: String,
    pub pod_ip: String,
    pub server: ServerSettings,
    /// Pod counts the router waits for
    pub prefill_size: usize,
    pub decode_size: usize,
    pub test: TestSettings,
    pub rendezvous_timeout: Duration,
    pub health_timeout: Duration,
    pub upstream_timeout: Duration,
}

/// How the pod's part of the job ended.
#[derive(Debug)]
pub enum LaunchOutcome {
    /// Leader pod: verdict of the test client
    Tested(MonitorOutcome),
    /// Any other pod: the server process exited
    ServerExited(ExitStatus),
}

pub struct Launcher {
    directory: RendezvousDirectory,
    ctx: LaunchContext,
    role: NodeRole,
    state: LaunchState,
}

impl Launcher {
    /// # Errors
    ///
    /// - [`HarnessError::InvalidHostname`] if the role cannot be derived from the hostname
    pub fn new(directory: RendezvousDirectory, ctx: LaunchContext) -> HarnessResult<Self> {
        let role = NodeRole::from_hostname(ctx.job_type, &ctx.hostname)?;
        info!(%role, hostname = %ctx.hostname, job_type = %ctx.job_type, "derived node role");
        Ok(Self {
            directory,
            ctx,
            role,
            state: LaunchState::WaitingForDirectory,
        })
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    fn transition(&mut self, next: LaunchState) {
        info!(from = ?self.state, to = ?next, role = %self.role, "launcher state");
        self.state = next;
    }

    /// Run this pod's part of the job to completion.
    #[tracing::instrument(skip(self), fields(role = %self.role))]
    pub async fn run(mut self) -> HarnessResult<LaunchOutcome> {
        let plan = self.prepare().await?;

        self.transition(LaunchState::Launching);
        info!(command = %plan.command_line(), "starting server");
        let mut server = spawn(&plan)?;
        self.transition(LaunchState::Running);

        if !self.role.runs_tests() {
            let status = server
                .wait()
                .await
                .change_context(HarnessError::LaunchFailed {
                    what: plan.program.clone(),
                })?;
            info!(%status, "server exited");
            return Ok(LaunchOutcome::ServerExited(status));
        }

        let result = self.run_tests(&plan).await;
        monitor::terminate(&mut server).await;
        result.map(LaunchOutcome::Tested)
    }

    /// Register, resolve the peers this role needs and derive the launch plan.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::RendezvousTimeout`] if a required peer never registers
    /// - [`HarnessError::UpstreamUnreachable`] if the router's upstreams never open
    pub async fn prepare(&mut self) -> HarnessResult<LaunchPlan> {
        if self.ctx.job_type != JobType::Single {
            self.directory
                .register(&self.ctx.hostname, &self.ctx.pod_ip)
                .await?;
        }
        self.transition(LaunchState::ResolvingAddress);

        let ctx = &self.ctx;
        let plan = match self.role.kind {
            RoleKind::Single => single_plan(&ctx.server),
            RoleKind::Master => mix_plan(&ctx.server, 0, &ctx.pod_ip),
            RoleKind::Worker => {
                let peers = self.resolve(vec![RoleMatcher::leader(RoleKind::Master)]).await?;
                mix_plan(&ctx.server, self.role.ordinal, &peers[0][0].ip)
            }
            kind @ (RoleKind::Prefill | RoleKind::Decode) => {
                let peers = self.resolve(vec![
                    RoleMatcher::leader(kind),
                    RoleMatcher::leader(RoleKind::Prefill),
                ])
                .await?;
                disaggregated_plan(
                    &ctx.server,
                    kind,
                    self.role.ordinal,
                    DisaggregatedPeers {
                        own_ip: &ctx.pod_ip,
                        role_leader_ip: &peers[0][0].ip,
                        prefill_leader_ip: &peers[1][0].ip,
                    },
                )
            }
            RoleKind::Router => {
                let peers = self.resolve(vec![
                    RoleMatcher::all(RoleKind::Prefill, ctx.prefill_size),
                    RoleMatcher::all(RoleKind::Decode, ctx.decode_size),
                ])
                .await?;
                let upstreams = router_upstreams(&ctx.server, &peers[0], &peers[1]);
                wait_reachable(&upstreams, REACHABILITY_INTERVAL, ctx.upstream_timeout).await?;
                router_plan(&ctx.server, &peers[0], &peers[1])
            }
        };
        Ok(plan)
    }

    async fn resolve(&self, matchers: Vec<RoleMatcher>) -> HarnessResult<Vec<Vec<Peer>>> {
        let own_entry = Some((self.ctx.hostname.as_str(), self.ctx.pod_ip.as_str()));
        self.directory
            .resolve(&matchers, own_entry, self.ctx.rendezvous_timeout)
            .await
    }

    async fn run_tests(&self, plan: &LaunchPlan) -> HarnessResult<MonitorOutcome> {
        let url = format!("http://127.0.0.1:{}/health", plan.health_port);
        wait_healthy(&url, HEALTH_INTERVAL, self.ctx.health_timeout).await?;

        info!(warmup = ?self.ctx.test.warmup, "warming up");
        tokio::time::sleep(self.ctx.test.warmup).await;

        CompletionMonitor::new(self.ctx.test.timeout)
            .with_echo(Echo::Raw)
            .run(test_command(&self.ctx.test))
            .await
    }
}

fn spawn(plan: &LaunchPlan) -> HarnessResult<Child> {
    Command::new(&plan.program)
        .args(&plan.args)
        .envs(&plan.env)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .change_context(HarnessError::LaunchFailed {
            what: plan.program.clone(),
        })
        .attach_printable_lazy(|| format!("command: {}", plan.command_line()))
}

/// `python3 {test_case}` inside the source tree, stderr folded into stdout.
pub fn test_command(test: &TestSettings) -> Command {
    let mut command = monitor::shell_command(&format!("exec python3 {} 2>&1", test.test_case));
    command.current_dir(&test.source_dir);
    if let Some(metrics_file) = &test.metrics_file {
        command.env(METRICS_FILE_ENV, metrics_file);
    }
    command
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use api_types::ServerArgs;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::k8s::mock::MockClusterApi;
    use crate::k8s::ResourceManager;

    const DIRECTORY: &str = "ci-ab12-rendezvous";

    fn context(job_type: JobType, hostname: &str, pod_ip: &str) -> LaunchContext {
        LaunchContext {
            job_type,
            hostname: hostname.to_string(),
            pod_ip: pod_ip.to_string(),
            server: ServerSettings {
                model_path: "/models/qwen".to_string(),
                npus: 8,
                replicas: 2,
                npus_per_pod: 16,
                args: ServerArgs::default(),
            },
            prefill_size: 1,
            decode_size: 1,
            test: TestSettings {
                test_case: "test/srt/test_ascend.py".to_string(),
                source_dir: PathBuf::from("sglang"),
                metrics_file: Some(PathBuf::from("/tmp/metrics.txt")),
                warmup: Duration::ZERO,
                timeout: Duration::from_secs(60),
            },
            rendezvous_timeout: Duration::from_secs(60),
            health_timeout: Duration::from_secs(60),
            upstream_timeout: Duration::from_secs(60),
        }
    }

    fn launcher(api: &Arc<MockClusterApi>, ctx: LaunchContext) -> Launcher {
        let directory =
            RendezvousDirectory::new(ResourceManager::new(api.clone()), "ci", DIRECTORY);
        Launcher::new(directory, ctx).unwrap()
    }

    fn arg_after<'a>(plan: &'a LaunchPlan, flag: &str) -> Option<&'a str> {
        let index = plan.args.iter().position(|arg| arg == flag)?;
        plan.args.get(index + 1).map(String::as_str)
    }

    #[test(tokio::test(start_paused = true))]
    async fn single_skips_rendezvous() {
        let api = Arc::new(MockClusterApi::new());
        let mut launcher = launcher(&api, context(JobType::Single, "ci-ab12-x7k2p", "10.0.0.1"));

        let plan = launcher.prepare().await.unwrap();

        assert_eq!(arg_after(&plan, "--tp-size"), Some("8"));
        assert!(api.calls().is_empty());
    }

    #[test(tokio::test(start_paused = true))]
    async fn mix_worker_waits_for_master() {
        let api = Arc::new(MockClusterApi::new());
        api.set_config_map(DIRECTORY, &[]);
        let mut worker = launcher(
            &api,
            context(JobType::MultiPdMix, "ci-ab12-node-1", "10.0.0.2"),
        );

        let master_api = api.clone();
        let master = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(40)).await;
            let mut master = launcher(
                &master_api,
                context(JobType::MultiPdMix, "ci-ab12-node-0", "10.0.0.1"),
            );
            master.prepare().await.unwrap()
        });

        let plan = worker.prepare().await.unwrap();
        let master_plan = master.await.unwrap();

        assert_eq!(arg_after(&plan, "--node-rank"), Some("1"));
        assert_eq!(arg_after(&plan, "--dist-init-addr"), Some("10.0.0.1:5000"));
        assert_eq!(arg_after(&master_plan, "--node-rank"), Some("0"));

        let data = api.config_map(DIRECTORY).unwrap();
        assert_eq!(data.len(), 2);
    }

    #[test(tokio::test(start_paused = true))]
    async fn decode_resolves_leader_and_prefill_store() {
        let api = Arc::new(MockClusterApi::new());
        api.set_config_map(
            DIRECTORY,
            &[("ci-ab12-prefill-0", "10.0.0.1"), ("ci-ab12-decode-0", "10.0.0.5")],
        );
        let mut decode = launcher(
            &api,
            context(JobType::MultiPdSeparation, "ci-ab12-decode-1", "10.0.0.6"),
        );

        let plan = decode.prepare().await.unwrap();

        assert_eq!(arg_after(&plan, "--disaggregation-mode"), Some("decode"));
        // independent instance: leads itself
        assert_eq!(arg_after(&plan, "--dist-init-addr"), Some("10.0.0.6:5000"));
        assert_eq!(
            plan.env.get("ASCEND_MF_STORE_URL").map(String::as_str),
            Some("tcp://10.0.0.1:24666")
        );
    }

    #[test(tokio::test(start_paused = true))]
    async fn missing_prefill_fails_the_pod() {
        let api = Arc::new(MockClusterApi::new());
        let mut decode = launcher(
            &api,
            context(JobType::MultiPdSeparation, "ci-ab12-decode-0", "10.0.0.5"),
        );

        let err = decode.prepare().await.unwrap_err();

        match err.current_context() {
            HarnessError::RendezvousTimeout { missing, .. } => {
                assert_eq!(*missing, vec!["*prefill-0".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_command_exports_metrics_file() {
        let ctx = context(JobType::Single, "ci-ab12-x7k2p", "10.0.0.1");
        let command = test_command(&ctx.test);
        let std = command.as_std();

        let args: Vec<String> = std
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-c".to_string(),
                "exec python3 test/srt/test_ascend.py 2>&1".to_string()
            ]
        );
        let metrics = std
            .get_envs()
            .find(|(key, _)| key.to_str() == Some(METRICS_FILE_ENV))
            .and_then(|(_, value)| value);
        assert_eq!(metrics, Some(std::ffi::OsStr::new("/tmp/metrics.txt")));
    }
}
