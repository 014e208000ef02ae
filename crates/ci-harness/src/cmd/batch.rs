use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use api_types::TestJobSpec;
use utils::version;

use crate::batch::run_batch;
use crate::batch::BatchSummary;
use crate::config::BatchArgs;
use crate::job::SubmittedJob;
use crate::k8s::ClusterApi;
use crate::k8s::ClusterClient;
use crate::logging;
use crate::orchestrator::run_job;
use crate::orchestrator::OrchestratorConfig;

pub async fn run_batch_command(args: BatchArgs) -> Result<()> {
    let _guard = logging::init(args.driver.log_dir.as_deref())?;
    tracing::info!("Starting ci-harness batch {}", &**version::VERSION);

    let yaml = tokio::fs::read_to_string(&args.jobs)
        .await
        .with_context(|| format!("failed to read job list {}", args.jobs.display()))?;
    let specs: Vec<TestJobSpec> = serde_yaml::from_str(&yaml)
        .with_context(|| format!("invalid job list {}", args.jobs.display()))?;
    let jobs: Vec<SubmittedJob> = specs.into_iter().map(SubmittedJob::new).collect();

    let client = ClusterClient::connect(args.driver.kubeconfig.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to the cluster: {e:?}"))?;
    let api: Arc<dyn ClusterApi> = Arc::new(client);
    let config = OrchestratorConfig::from(&args.driver);

    let reports = run_batch(jobs, args.concurrency, |job| {
        let api = api.clone();
        let config = &config;
        async move { run_job(api, &job, config).await }
    })
    .await;

    let summary = BatchSummary::from_reports(&reports);
    println!("{}", summary.render(&reports));

    if summary.all_passed() {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "{} of {} jobs did not pass: {}",
            summary.not_passed.len(),
            reports.len(),
            summary.not_passed.join(", ")
        ))
    }
}
