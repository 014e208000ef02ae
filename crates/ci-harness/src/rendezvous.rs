//! ConfigMap-backed peer directory.
//!
//! Every pod of a run writes its `hostname -> pod IP` entry into one ConfigMap
//! named after the job. Pods start in arbitrary order with no route to each
//! other, so this map is the only channel through which they find their peers.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use error_stack::Report;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::HarnessError;
use crate::error::HarnessResult;
use crate::k8s::ResourceManager;
use crate::launcher::role::parse_ordinal;
use crate::launcher::role::RoleKind;
use crate::util::poll_until;

pub const RESOLVE_INTERVAL: Duration = Duration::from_secs(15);

pub const DIST_INIT_PORT: u16 = 5000;
pub const BOOTSTRAP_PORT_BASE: u16 = 8995;
pub const TRANSFER_STORE_PORT: u16 = 24666;

/// Selects directory keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleMatcher {
    /// Exactly the key ending with the suffix, e.g. `prefill-0`.
    Suffix(String),
    /// Every key carrying the role segment. Resolves once `expected` peers are present.
    Role { kind: RoleKind, expected: usize },
}

impl RoleMatcher {
    pub fn suffix(suffix: impl Into<String>) -> Self {
        RoleMatcher::Suffix(suffix.into())
    }

    /// The ordinal-0 pod of a role.
    pub fn leader(kind: RoleKind) -> Self {
        RoleMatcher::Suffix(format!("{}-0", kind.segment()))
    }

    pub fn all(kind: RoleKind, expected: usize) -> Self {
        RoleMatcher::Role { kind, expected }
    }

    fn matches(&self, key: &str) -> bool {
        match self {
            RoleMatcher::Suffix(suffix) => key.ends_with(suffix.as_str()),
            RoleMatcher::Role { kind, .. } => key.contains(&format!("-{}-", kind.segment())),
        }
    }

    /// Peers selected from `data`, ordered by ordinal; `None` while incomplete.
    fn select(&self, data: &BTreeMap<String, String>) -> Option<Vec<Peer>> {
        let mut peers: Vec<Peer> = data
            .iter()
            .filter(|(key, ip)| self.matches(key) && !ip.is_empty())
            .map(|(key, ip)| Peer {
                hostname: key.clone(),
                ip: ip.clone(),
                ordinal: parse_ordinal(key).unwrap_or_default(),
            })
            .collect();
        peers.sort_by_key(|peer| peer.ordinal);

        let complete = match self {
            RoleMatcher::Suffix(_) => !peers.is_empty(),
            RoleMatcher::Role { expected, .. } => peers.len() >= *expected,
        };
        if !complete {
            return None;
        }
        if let RoleMatcher::Suffix(_) = self {
            peers.truncate(1);
        }
        Some(peers)
    }
}

impl fmt::Display for RoleMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleMatcher::Suffix(suffix) => write!(f, "*{suffix}"),
            RoleMatcher::Role { kind, expected } => write!(f, "{expected}x *-{}-*", kind.segment()),
        }
    }
}

/// A resolved directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub hostname: String,
    pub ip: String,
    pub ordinal: u32,
}

/// Read/write access to one run's directory ConfigMap.
#[derive(Clone)]
pub struct RendezvousDirectory {
    manager: ResourceManager,
    namespace: String,
    name: String,
    interval: Duration,
}

impl RendezvousDirectory {
    pub fn new(manager: ResourceManager, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            manager,
            namespace: namespace.into(),
            name: name.into(),
            interval: RESOLVE_INTERVAL,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Overwrite the whole directory with `data`.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::ResourceCreation`] if the ConfigMap cannot be written
    pub async fn publish(&self, data: BTreeMap<String, String>) -> HarnessResult<()> {
        self.manager
            .upsert_config_map(&self.name, data, &self.namespace)
            .await
    }

    /// Current directory contents; empty when the ConfigMap does not exist yet.
    pub async fn read(&self) -> HarnessResult<BTreeMap<String, String>> {
        self.manager
            .read_config_map(&self.name, &self.namespace)
            .await
            .map(Option::unwrap_or_default)
    }

    /// Add this pod's entry: read, insert, overwrite.
    ///
    /// Two pods registering at the same moment can drop each other's entry;
    /// [`RendezvousDirectory::resolve`] re-registers when it sees its own entry missing.
    #[tracing::instrument(skip(self), fields(directory = %self.name))]
    pub async fn register(&self, hostname: &str, ip: &str) -> HarnessResult<()> {
        let mut data = self.read().await?;
        data.insert(hostname.to_string(), ip.to_string());
        self.publish(data).await?;
        info!("registered in rendezvous directory");
        Ok(())
    }

    /// Wait until every matcher resolves and return the peers, one list per
    /// matcher in the given order.
    ///
    /// `own_entry` is written back whenever it is missing from the directory.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::RendezvousTimeout`] naming the matchers still unresolved
    #[tracing::instrument(skip(self, matchers, own_entry), fields(directory = %self.name))]
    pub async fn resolve(
        &self,
        matchers: &[RoleMatcher],
        own_entry: Option<(&str, &str)>,
        timeout: Duration,
    ) -> HarnessResult<Vec<Vec<Peer>>> {
        let resolved = poll_until(self.interval, timeout, move || async move {
            self.try_resolve(matchers, own_entry).await.ok()
        })
        .await;

        let missing = match resolved {
            Some(peers) => {
                info!(?peers, "rendezvous resolved");
                return Ok(peers);
            }
            None => match self.try_resolve(matchers, None).await {
                Ok(peers) => return Ok(peers),
                Err(missing) => missing,
            },
        };
        Err(Report::new(HarnessError::RendezvousTimeout {
            config_map: self.name.clone(),
            missing,
            timeout,
        }))
    }

    /// One poll: the peers, or the names of the matchers not yet satisfied.
    async fn try_resolve(
        &self,
        matchers: &[RoleMatcher],
        own_entry: Option<(&str, &str)>,
    ) -> Result<Vec<Vec<Peer>>, Vec<String>> {
        let all_missing = || matchers.iter().map(ToString::to_string).collect::<Vec<_>>();
        let data = match self.read().await {
            Ok(data) => data,
            Err(e) => {
                warn!(error = ?e, "failed to read rendezvous directory");
                return Err(all_missing());
            }
        };

        if let Some((hostname, ip)) = own_entry {
            if data.get(hostname).map(String::as_str) != Some(ip) {
                warn!(hostname, "own entry missing from directory, registering again");
                if let Err(e) = self.register(hostname, ip).await {
                    warn!(error = ?e, "failed to re-register");
                }
            }
        }

        if data.is_empty() {
            debug!("rendezvous directory empty");
            return Err(all_missing());
        }

        let mut resolved = Vec::with_capacity(matchers.len());
        let mut missing = Vec::new();
        for matcher in matchers {
            match matcher.select(&data) {
                Some(peers) => resolved.push(peers),
                None => missing.push(matcher.to_string()),
            }
        }
        if missing.is_empty() {
            Ok(resolved)
        } else {
            debug!(?missing, "waiting for peers");
            Err(missing)
        }
    }
}

/// `--dist-init-addr` for a multi-node instance led by `ip`.
pub fn dist_init_addr(ip: &str) -> String {
    format!("{ip}:{DIST_INIT_PORT}")
}

/// KV-cache transfer store rooted at the prefill leader.
pub fn transfer_store_url(prefill_leader_ip: &str) -> String {
    format!("tcp://{prefill_leader_ip}:{TRANSFER_STORE_PORT}")
}

/// A role whose static launch args carry `--node-rank` forms one multi-node
/// instance; otherwise every pod is its own instance.
pub fn is_multi_node(static_args: &[String]) -> bool {
    static_args
        .iter()
        .any(|arg| arg == "--node-rank" || arg.starts_with("--node-rank="))
}

/// Bootstrap port of the instance the pod with `ordinal` belongs to.
pub fn bootstrap_port(static_args: &[String], ordinal: u32) -> u16 {
    if is_multi_node(static_args) {
        BOOTSTRAP_PORT_BASE
    } else {
        BOOTSTRAP_PORT_BASE.saturating_add(u16::try_from(ordinal).unwrap_or(u16::MAX))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::k8s::mock::MockClusterApi;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn directory(api: &Arc<MockClusterApi>) -> RendezvousDirectory {
        RendezvousDirectory::new(ResourceManager::new(api.clone()), "ci", "run-rendezvous")
    }

    fn ips(peers: &[Peer]) -> Vec<&str> {
        peers.iter().map(|peer| peer.ip.as_str()).collect()
    }

    #[test(tokio::test(start_paused = true))]
    async fn resolves_prefill_leader_to_dist_init_addr() {
        let api = Arc::new(MockClusterApi::new());
        api.set_config_map(
            "run-rendezvous",
            &[("run-prefill-0", "10.0.0.1"), ("run-decode-0", "10.0.0.2")],
        );

        let peers = directory(&api)
            .resolve(&[RoleMatcher::suffix("prefill-0")], None, TIMEOUT)
            .await
            .unwrap();

        assert_eq!(dist_init_addr(&peers[0][0].ip), "10.0.0.1:5000");
    }

    #[test(tokio::test(start_paused = true))]
    async fn absent_key_blocks_until_published() {
        let api = Arc::new(MockClusterApi::new());
        api.set_config_map("run-rendezvous", &[("run-prefill-0", "10.0.0.1")]);
        let dir = directory(&api);

        let writer = {
            let api = api.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(20)).await;
                api.set_config_map(
                    "run-rendezvous",
                    &[("run-prefill-0", "10.0.0.1"), ("run-decode-0", "10.0.0.2")],
                );
            })
        };

        let start = tokio::time::Instant::now();
        let peers = dir
            .resolve(&[RoleMatcher::leader(RoleKind::Decode)], None, TIMEOUT)
            .await
            .unwrap();
        writer.await.unwrap();

        assert_eq!(ips(&peers[0]), vec!["10.0.0.2"]);
        // polled at 0s and 15s, found at 30s
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[test(tokio::test(start_paused = true))]
    async fn timeout_names_missing_matchers() {
        let api = Arc::new(MockClusterApi::new());
        api.set_config_map("run-rendezvous", &[("run-prefill-0", "10.0.0.1")]);

        let err = directory(&api)
            .resolve(
                &[
                    RoleMatcher::leader(RoleKind::Prefill),
                    RoleMatcher::leader(RoleKind::Decode),
                ],
                None,
                TIMEOUT,
            )
            .await
            .unwrap_err();

        match err.current_context() {
            HarnessError::RendezvousTimeout { missing, .. } => {
                assert_eq!(*missing, vec!["*decode-0".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test(tokio::test(start_paused = true))]
    async fn missing_config_map_times_out() {
        let api = Arc::new(MockClusterApi::new());

        let err = directory(&api)
            .resolve(&[RoleMatcher::suffix("node-0")], None, TIMEOUT)
            .await
            .unwrap_err();

        assert!(matches!(
            err.current_context(),
            HarnessError::RendezvousTimeout { .. }
        ));
    }

    #[test(tokio::test(start_paused = true))]
    async fn role_matcher_waits_for_expected_count() {
        let api = Arc::new(MockClusterApi::new());
        api.set_config_map(
            "run-rendezvous",
            &[
                ("run-prefill-1", "10.0.0.4"),
                ("run-prefill-0", "10.0.0.3"),
                ("run-decode-0", "10.0.0.5"),
                ("run-router-0", "10.0.0.6"),
            ],
        );
        let dir = directory(&api);

        let peers = dir
            .resolve(&[RoleMatcher::all(RoleKind::Prefill, 2)], None, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(ips(&peers[0]), vec!["10.0.0.3", "10.0.0.4"]);

        let err = dir
            .resolve(&[RoleMatcher::all(RoleKind::Decode, 2)], None, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            HarnessError::RendezvousTimeout { .. }
        ));
    }

    #[test(tokio::test(start_paused = true))]
    async fn register_keeps_other_entries() {
        let api = Arc::new(MockClusterApi::new());
        let dir = directory(&api);

        dir.register("run-prefill-0", "10.0.0.1").await.unwrap();
        dir.register("run-decode-0", "10.0.0.2").await.unwrap();

        let data = api.config_map("run-rendezvous").unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data["run-prefill-0"], "10.0.0.1");
    }

    #[test(tokio::test(start_paused = true))]
    async fn lost_own_entry_is_registered_again() {
        let api = Arc::new(MockClusterApi::new());
        // another pod overwrote the map without our entry
        api.set_config_map("run-rendezvous", &[("run-node-0", "10.0.0.1")]);

        directory(&api)
            .resolve(
                &[RoleMatcher::suffix("node-0")],
                Some(("run-node-1", "10.0.0.9")),
                TIMEOUT,
            )
            .await
            .unwrap();

        let data = api.config_map("run-rendezvous").unwrap();
        assert_eq!(data.get("run-node-1").map(String::as_str), Some("10.0.0.9"));
    }

    #[test]
    fn bootstrap_port_depends_on_node_rank_flag() {
        let args = |list: &[&str]| list.iter().map(ToString::to_string).collect::<Vec<_>>();
        let multi_node = args(&["--nnodes", "2", "--node-rank", "0"]);
        let independent = args(&["--tp-size", "16"]);

        assert_eq!(bootstrap_port(&multi_node, 1), 8995);
        assert_eq!(bootstrap_port(&independent, 0), 8995);
        assert_eq!(bootstrap_port(&independent, 2), 8997);
        assert_eq!(transfer_store_url("10.0.0.1"), "tcp://10.0.0.1:24666");
    }
}
