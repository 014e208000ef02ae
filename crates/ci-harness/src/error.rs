use std::time::Duration;

use error_stack::Report;
use thiserror::Error;

use crate::k8s::ManifestKind;

pub type HarnessResult<T> = Result<T, Report<HarnessError>>;

/// Errors that classify why a harness run did not reach a verdict.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[error("Invalid manifest: {message}")]
    ManifestInvalid { message: String },
    #[error("Unsupported resource kind {kind} with apiVersion {api_version}")]
    UnsupportedResourceKind { kind: String, api_version: String },
    #[error("Failed to create {kind} `{name}`")]
    ResourceCreation { kind: ManifestKind, name: String },
    #[error("Failed to delete {kind} `{name}`")]
    ResourceDeletion { kind: ManifestKind, name: String },
    #[error("Failed to read {kind} `{name}`")]
    ResourceRead { kind: ManifestKind, name: String },
    #[error("Pods with prefix `{prefix}` not ready after {timeout:?}")]
    ReadinessTimeout { prefix: String, timeout: Duration },
    #[error("Rendezvous `{config_map}` still missing {missing:?} after {timeout:?}")]
    RendezvousTimeout {
        config_map: String,
        missing: Vec<String>,
        timeout: Duration,
    },
    #[error("No pod of job `{job}` to follow")]
    LeaderPodMissing { job: String },
    #[error("Cannot derive node role from hostname `{hostname}`")]
    InvalidHostname { hostname: String },
    #[error("Upstreams {addresses:?} not reachable after {timeout:?}")]
    UpstreamUnreachable {
        addresses: Vec<String>,
        timeout: Duration,
    },
    #[error("`{url}` did not become healthy within {timeout:?}")]
    HealthTimeout { url: String, timeout: Duration },
    #[error("Failed to launch {what}")]
    LaunchFailed { what: String },
    #[error("Completion pattern not seen within {timeout:?}")]
    MonitorTimeout { timeout: Duration },
    #[error("Parent process {parent_pid} exited while monitoring")]
    OrphanedMonitor { parent_pid: i32 },
    #[error("Output ended without a test completion pattern")]
    PatternNotFound,
    #[error("Monitored subprocess failed: {stderr}")]
    SubprocessFailed { stderr: String },
}

impl HarnessError {
    pub(crate) fn manifest(message: impl Into<String>) -> Report<Self> {
        Report::new(HarnessError::ManifestInvalid {
            message: message.into(),
        })
    }
}
