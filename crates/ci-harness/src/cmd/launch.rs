use std::sync::Arc;

use anyhow::Result;
use utils::version;

use crate::config::LaunchArgs;
use crate::k8s::ClusterClient;
use crate::k8s::ResourceManager;
use crate::launcher::LaunchOutcome;
use crate::launcher::Launcher;
use crate::monitor::MonitorOutcome;
use crate::rendezvous::RendezvousDirectory;

pub async fn run_launch(args: LaunchArgs) -> Result<()> {
    // pod logs are collected from stderr/stdout, no file copy
    utils::logging::init();
    tracing::info!("Starting ci-harness launch {}", &**version::VERSION);

    let client = ClusterClient::connect(args.kubeconfig.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to the cluster: {e:?}"))?;
    let directory = RendezvousDirectory::new(
        ResourceManager::new(Arc::new(client)),
        args.namespace.clone(),
        args.config_map.clone(),
    );
    let directory_name = directory.name().to_string();
    let launcher = Launcher::new(directory, args.to_context())
        .map_err(|e| anyhow::anyhow!("Failed to set up launcher: {e:?}"))?;
    tracing::info!(
        job = %args.job_name,
        directory = %directory_name,
        role = %launcher.role(),
        pod_ip = %args.pod_ip,
        "launching"
    );

    let outcome = launcher
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Launch failed: {e:?}"))?;
    match outcome {
        LaunchOutcome::Tested(MonitorOutcome::Success) => Ok(()),
        LaunchOutcome::Tested(outcome) => Err(anyhow::anyhow!("test case ended with {outcome:?}")),
        LaunchOutcome::ServerExited(status) if status.success() => Ok(()),
        LaunchOutcome::ServerExited(status) => Err(anyhow::anyhow!("server exited with {status}")),
    }
}
