//! Driver-side flow of one job: render, apply, wait, follow, tear down.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use kube::ResourceExt;
use tracing::info;
use tracing::warn;

use crate::error::HarnessError;
use crate::error::HarnessResult;
use crate::job::SubmittedJob;
use crate::k8s::read_manifest_file;
use crate::k8s::write_manifest_file;
use crate::k8s::ClusterApi;
use crate::k8s::ManifestDocument;
use crate::k8s::ManifestKind;
use crate::k8s::PodReadinessPoller;
use crate::k8s::ResourceManager;
use crate::monitor::shell_command;
use crate::monitor::CompletionMonitor;
use crate::monitor::MonitorOutcome;
use crate::render::render_job;

pub const DEFAULT_LOG_COMMAND: &str = "kubectl logs -f -n {namespace} {pod}";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Directory the rendered manifest is written to
    pub workdir: PathBuf,
    pub ready_timeout: Duration,
    /// Fail instead of warning when pods are not ready in time
    pub ready_timeout_fatal: bool,
    pub monitor_timeout: Duration,
    /// Command following the leader pod's log; `{namespace}` and `{pod}` are substituted
    pub log_command: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workdir: std::env::temp_dir(),
            ready_timeout: Duration::from_secs(30 * 60),
            ready_timeout_fatal: false,
            monitor_timeout: Duration::from_secs(2 * 60 * 60),
            log_command: DEFAULT_LOG_COMMAND.to_string(),
        }
    }
}

/// Verdict of a job that ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobVerdict {
    Pass,
    Fail,
}

/// Run one job end to end. Teardown runs whatever happens before it.
///
/// # Errors
///
/// Any [`HarnessError`] raised before a verdict, e.g.
/// [`HarnessError::ResourceCreation`], [`HarnessError::ReadinessTimeout`] (only
/// when `ready_timeout_fatal`) or a monitor error.
#[tracing::instrument(skip_all, fields(job = %job.job_name()))]
pub async fn run_job(
    api: Arc<dyn ClusterApi>,
    job: &SubmittedJob,
    config: &OrchestratorConfig,
) -> HarnessResult<JobVerdict> {
    let manager = ResourceManager::new(api.clone());
    let manifest_path = config.workdir.join(format!("{}.yaml", job.job_name()));

    let documents = render_job(job)?;
    write_manifest_file(&manifest_path, &documents).await?;
    info!(path = %manifest_path.display(), "manifest written");

    let result = drive(&api, &manager, job, config, &manifest_path).await;

    teardown(&manager, &documents, &job.spec.namespace, &manifest_path).await;
    match &result {
        Ok(verdict) => info!(?verdict, "job finished"),
        Err(e) => warn!(error = ?e, "job errored"),
    }
    result
}

async fn drive(
    api: &Arc<dyn ClusterApi>,
    manager: &ResourceManager,
    job: &SubmittedJob,
    config: &OrchestratorConfig,
    manifest_path: &Path,
) -> HarnessResult<JobVerdict> {
    let namespace = job.spec.namespace.as_str();
    let job_name = job.job_name();

    info!(phase = "apply", "creating resources");
    let documents = read_manifest_file(manifest_path).await?;
    manager.apply(&documents, namespace).await?;

    info!(phase = "ready", timeout = ?config.ready_timeout, "waiting for pods");
    let poller = PodReadinessPoller::new(api.clone());
    if !poller
        .wait_ready(namespace, &job_name, config.ready_timeout)
        .await
    {
        if config.ready_timeout_fatal {
            return Err(Report::new(HarnessError::ReadinessTimeout {
                prefix: job_name,
                timeout: config.ready_timeout,
            })
            .attach_printable(format!("namespace: {namespace}")));
        }
        warn!("pods not ready, following the leader log anyway");
    }

    let pod = leader_pod(api.as_ref(), job).await?;
    info!(phase = "monitor", %pod, "following leader log");
    let command = config
        .log_command
        .replace("{namespace}", namespace)
        .replace("{pod}", &pod);
    let outcome = CompletionMonitor::new(config.monitor_timeout)
        .run(shell_command(&command))
        .await?;

    Ok(match outcome {
        MonitorOutcome::Success => JobVerdict::Pass,
        _ => JobVerdict::Fail,
    })
}

/// Name of the pod whose log carries the test summary.
async fn leader_pod(api: &dyn ClusterApi, job: &SubmittedJob) -> HarnessResult<String> {
    let job_name = job.job_name();
    let pods = api
        .list_pods(&job.spec.namespace)
        .await
        .change_context_lazy(|| HarnessError::ResourceRead {
            kind: ManifestKind::Pod,
            name: job_name.clone(),
        })?;
    let mut names: Vec<String> = pods
        .iter()
        .map(ResourceExt::name_any)
        .filter(|name| name.starts_with(&job_name))
        .collect();
    names.sort();

    let leader = match job.leader_suffix() {
        Some(suffix) => names.into_iter().find(|name| name.ends_with(suffix)),
        None => names.into_iter().next(),
    };
    // before the pod exists the name is still predictable for multi-node jobs
    leader
        .or_else(|| job.leader_suffix().map(|suffix| format!("{job_name}{suffix}")))
        .ok_or_else(|| Report::new(HarnessError::LeaderPodMissing { job: job_name }))
}

async fn teardown(
    manager: &ResourceManager,
    documents: &[ManifestDocument],
    namespace: &str,
    manifest_path: &Path,
) {
    info!(phase = "teardown", "deleting resources");
    if let Err(e) = manager.delete(documents, namespace).await {
        warn!(error = ?e, "teardown failed, resources may be left behind");
    }
    if let Err(e) = tokio::fs::remove_file(manifest_path).await {
        warn!(path = %manifest_path.display(), error = %e, "failed to remove manifest");
    }
}
