//! Bounded worker pool over many jobs.

use std::future::Future;

use api_types::JobReport;
use api_types::JobStatus;
use comfy_table::presets::UTF8_FULL;
use comfy_table::Cell;
use comfy_table::ContentArrangement;
use comfy_table::Table;
use futures::stream;
use futures::StreamExt;
use tracing::info;

use crate::error::HarnessResult;
use crate::job::SubmittedJob;
use crate::orchestrator::JobVerdict;

pub const DEFAULT_CONCURRENCY: usize = 2;

/// Run every job with at most `concurrency` in flight.
///
/// Each job gets exactly one report, in completion order.
pub async fn run_batch<F, Fut>(jobs: Vec<SubmittedJob>, concurrency: usize, run: F) -> Vec<JobReport>
where
    F: Fn(SubmittedJob) -> Fut,
    Fut: Future<Output = HarnessResult<JobVerdict>>,
{
    let total = jobs.len();
    info!(total, concurrency, "starting batch");
    let run = &run;
    stream::iter(jobs)
        .map(|job| async move {
            let job_name = job.job_name();
            let report = match run(job).await {
                Ok(JobVerdict::Pass) => report(job_name, JobStatus::Pass, String::new()),
                Ok(JobVerdict::Fail) => {
                    report(job_name, JobStatus::Fail, "test summary reported failures".to_string())
                }
                // `{:#}` renders every context, outermost first
                Err(e) => report(job_name, JobStatus::Error, format!("{e:#}")),
            };
            info!(job = %report.job_name, status = %report.status, "job done");
            report
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await
}

fn report(job_name: String, status: JobStatus, detail: String) -> JobReport {
    JobReport {
        job_name,
        status,
        detail,
    }
}

/// Pass/Fail/Error counts of a finished batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub pass: usize,
    pub fail: usize,
    pub error: usize,
    /// Jobs that did not pass
    pub not_passed: Vec<String>,
}

impl BatchSummary {
    pub fn from_reports(reports: &[JobReport]) -> Self {
        let mut summary = Self::default();
        for report in reports {
            match report.status {
                JobStatus::Pass => summary.pass += 1,
                JobStatus::Fail => summary.fail += 1,
                JobStatus::Error => summary.error += 1,
            }
            if report.status != JobStatus::Pass {
                summary.not_passed.push(report.job_name.clone());
            }
        }
        summary.not_passed.sort();
        summary
    }

    pub fn all_passed(&self) -> bool {
        self.fail == 0 && self.error == 0
    }

    pub fn render(&self, reports: &[JobReport]) -> String {
        let mut counts = Table::new();
        counts
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["Pass", "Fail", "Error"])
            .add_row(vec![
                Cell::new(self.pass),
                Cell::new(self.fail),
                Cell::new(self.error),
            ]);

        let mut out = counts.to_string();
        if !self.not_passed.is_empty() {
            let mut failures = Table::new();
            failures
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["Job", "Status", "Detail"]);
            for report in reports.iter().filter(|r| r.status != JobStatus::Pass) {
                failures.add_row(vec![
                    Cell::new(&report.job_name),
                    Cell::new(report.status),
                    Cell::new(&report.detail),
                ]);
            }
            out.push('\n');
            out.push_str(&failures.to_string());
        }
        out
    }
}
