use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::k8s::client::ClusterApi;
use crate::util::poll_until;

pub(crate) const READY_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Polls pod status until every pod of a job is Running and Ready.
#[derive(Clone)]
pub struct PodReadinessPoller {
    api: Arc<dyn ClusterApi>,
    interval: Duration,
}

impl PodReadinessPoller {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self {
            api,
            interval: READY_POLL_INTERVAL,
        }
    }

    /// Wait until at least one pod whose name contains `name_prefix` exists and
    /// all of them are ready at the same tick.
    ///
    /// Returns `false` on timeout. A failed list call counts as a non-ready tick.
    #[tracing::instrument(skip(self))]
    pub async fn wait_ready(&self, namespace: &str, name_prefix: &str, timeout: Duration) -> bool {
        let api = &self.api;
        let ready = poll_until(self.interval, timeout, move || async move {
            let pods = match api.list_pods(namespace).await {
                Ok(pods) => pods,
                Err(e) => {
                    warn!(error = %e, "failed to list pods");
                    return None;
                }
            };
            let matching: Vec<&Pod> = pods
                .iter()
                .filter(|pod| pod.name_any().contains(name_prefix))
                .collect();
            let ready_count = matching.iter().filter(|pod| is_pod_ready(pod)).count();
            debug!(matching = matching.len(), ready = ready_count, "readiness tick");

            (!matching.is_empty() && ready_count == matching.len()).then_some(())
        })
        .await
        .is_some();

        if ready {
            info!("all pods ready");
        } else {
            warn!(?timeout, "pods not ready before timeout");
        }
        ready
    }
}

/// Running, and every `Ready` condition is `True`.
pub(crate) fn is_pod_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .iter()
        .flatten()
        .filter(|condition| condition.type_ == "Ready")
        .all(|condition| condition.status == "True")
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::k8s::mock::pod;
    use crate::k8s::mock::MockClusterApi;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn poller(api: &Arc<MockClusterApi>) -> PodReadinessPoller {
        PodReadinessPoller::new(api.clone())
    }

    #[test]
    fn readiness_requires_running_and_ready() {
        assert!(is_pod_ready(&pod("a", "Running", "True")));
        assert!(!is_pod_ready(&pod("a", "Running", "False")));
        assert!(!is_pod_ready(&pod("a", "Pending", "True")));
        assert!(!is_pod_ready(&Pod::default()));
    }

    #[test(tokio::test(start_paused = true))]
    async fn true_once_all_matching_pods_are_ready() {
        let api = Arc::new(MockClusterApi::new());
        api.push_pods(vec![
            pod("ci-ab12-node-0", "Running", "True"),
            pod("ci-ab12-node-1", "Pending", "False"),
        ]);
        api.push_pods(vec![
            pod("ci-ab12-node-0", "Running", "True"),
            pod("ci-ab12-node-1", "Running", "True"),
            pod("unrelated", "Pending", "False"),
        ]);

        assert!(poller(&api).wait_ready("ci", "ci-ab12", TIMEOUT).await);
    }

    #[test(tokio::test(start_paused = true))]
    async fn false_when_no_pod_matches() {
        let api = Arc::new(MockClusterApi::new());
        api.push_pods(vec![pod("other-0", "Running", "True")]);

        assert!(!poller(&api).wait_ready("ci", "ci-ab12", TIMEOUT).await);
    }

    #[test(tokio::test(start_paused = true))]
    async fn false_when_one_pod_stays_unready() {
        let api = Arc::new(MockClusterApi::new());
        api.push_pods(vec![
            pod("ci-ab12-node-0", "Running", "True"),
            pod("ci-ab12-node-1", "Running", "False"),
        ]);

        assert!(!poller(&api).wait_ready("ci", "ci-ab12", TIMEOUT).await);
    }
}
