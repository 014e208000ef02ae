use std::sync::Arc;

use anyhow::Result;
use utils::version;

use crate::config::RunArgs;
use crate::job::SubmittedJob;
use crate::k8s::ClusterClient;
use crate::logging;
use crate::orchestrator::run_job;
use crate::orchestrator::JobVerdict;
use crate::orchestrator::OrchestratorConfig;

pub async fn run_single(args: RunArgs) -> Result<()> {
    let _guard = logging::init(args.driver.log_dir.as_deref())?;
    tracing::info!("Starting ci-harness run {}", &**version::VERSION);

    let client = ClusterClient::connect(args.driver.kubeconfig.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to the cluster: {e:?}"))?;
    let job = SubmittedJob::new(args.to_spec());
    let config = OrchestratorConfig::from(&args.driver);
    tracing::info!(
        job = %job.job_name(),
        job_type = %job.spec.job_type,
        namespace = %job.spec.namespace,
        "submitting job"
    );

    let verdict = run_job(Arc::new(client), &job, &config)
        .await
        .map_err(|e| anyhow::anyhow!("Job {} errored: {e:?}", job.job_name()))?;
    match verdict {
        JobVerdict::Pass => {
            tracing::info!(job = %job.job_name(), "PASS");
            Ok(())
        }
        JobVerdict::Fail => Err(anyhow::anyhow!("job {} failed", job.job_name())),
    }
}
