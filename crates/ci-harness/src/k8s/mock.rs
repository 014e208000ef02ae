//! In-memory [`ClusterApi`] double for unit tests.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Mutex;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodCondition;
use k8s_openapi::api::core::v1::PodStatus;
use k8s_openapi::api::rbac::v1::Role;
use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;

use super::client::ApiResult;
use super::client::ClusterApi;
use super::client::KubeApiError;

#[derive(Default)]
struct State {
    calls: Vec<String>,
    config_maps: HashMap<String, BTreeMap<String, String>>,
    rbac: HashSet<String>,
    pod_snapshots: VecDeque<Vec<Pod>>,
    fail_create_of: Option<String>,
}

/// Records every call and keeps ConfigMaps in memory.
#[derive(Default)]
pub(crate) struct MockClusterApi {
    state: Mutex<State>,
}

impl MockClusterApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue the pod list returned by successive `list_pods` calls. The last
    /// snapshot keeps being returned once the queue is drained.
    pub(crate) fn push_pods(&self, pods: Vec<Pod>) {
        self.state.lock().unwrap().pod_snapshots.push_back(pods);
    }

    pub(crate) fn set_config_map(&self, name: &str, data: &[(&str, &str)]) {
        let data = data
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.state
            .lock()
            .unwrap()
            .config_maps
            .insert(name.to_string(), data);
    }

    pub(crate) fn config_map(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.state.lock().unwrap().config_maps.get(name).cloned()
    }

    /// Make the create call for the named object fail.
    pub(crate) fn fail_create_of(&self, name: &str) {
        self.state.lock().unwrap().fail_create_of = Some(name.to_string());
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, call: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(format!("{call}:{name}"));
    }

    fn check_create(&self, kind: &'static str, name: &str) -> ApiResult<()> {
        if self.state.lock().unwrap().fail_create_of.as_deref() == Some(name) {
            return Err(KubeApiError::Request {
                kind,
                name: name.to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    /// RBAC objects are namespace-wide; a second create of the same name is a conflict.
    fn check_exists(&self, kind: &'static str, name: String) -> ApiResult<()> {
        let key = format!("{kind}/{name}");
        if !self.state.lock().unwrap().rbac.insert(key) {
            return Err(KubeApiError::Conflict { kind, name });
        }
        Ok(())
    }
}

fn name_of(meta: &ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

/// Build a pod with the given phase and `Ready` condition status.
pub(crate) fn pod(name: &str, phase: &str, ready: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: ready.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

#[async_trait::async_trait]
impl ClusterApi for MockClusterApi {
    async fn create_pod(&self, _namespace: &str, pod: &Pod) -> ApiResult<()> {
        let name = name_of(&pod.metadata);
        self.record("create_pod", &name);
        self.check_create("Pod", &name)
    }

    async fn create_job(&self, _namespace: &str, job: &Job) -> ApiResult<()> {
        let name = name_of(&job.metadata);
        self.record("create_job", &name);
        self.check_create("Job", &name)
    }

    async fn create_volcano_job(&self, _namespace: &str, job: &DynamicObject) -> ApiResult<()> {
        let name = name_of(&job.metadata);
        self.record("create_volcano_job", &name);
        self.check_create("VolcanoJob", &name)
    }

    async fn create_config_map(&self, _namespace: &str, config_map: &ConfigMap) -> ApiResult<()> {
        let name = name_of(&config_map.metadata);
        self.record("create_config_map", &name);
        self.check_create("ConfigMap", &name)?;
        let mut state = self.state.lock().unwrap();
        if state.config_maps.contains_key(&name) {
            return Err(KubeApiError::Conflict {
                kind: "ConfigMap",
                name,
            });
        }
        state
            .config_maps
            .insert(name, config_map.data.clone().unwrap_or_default());
        Ok(())
    }

    async fn replace_config_map(&self, _namespace: &str, config_map: &ConfigMap) -> ApiResult<()> {
        let name = name_of(&config_map.metadata);
        self.record("replace_config_map", &name);
        let mut state = self.state.lock().unwrap();
        if !state.config_maps.contains_key(&name) {
            return Err(KubeApiError::NotFound {
                kind: "ConfigMap",
                name,
            });
        }
        state
            .config_maps
            .insert(name, config_map.data.clone().unwrap_or_default());
        Ok(())
    }

    async fn create_role(&self, _namespace: &str, role: &Role) -> ApiResult<()> {
        let name = name_of(&role.metadata);
        self.record("create_role", &name);
        self.check_create("Role", &name)?;
        self.check_exists("Role", name)
    }

    async fn create_role_binding(&self, _namespace: &str, binding: &RoleBinding) -> ApiResult<()> {
        let name = name_of(&binding.metadata);
        self.record("create_role_binding", &name);
        self.check_create("RoleBinding", &name)?;
        self.check_exists("RoleBinding", name)
    }

    async fn delete_job(&self, _namespace: &str, name: &str) -> ApiResult<()> {
        self.record("delete_job", name);
        Ok(())
    }

    async fn delete_volcano_job(&self, _namespace: &str, name: &str) -> ApiResult<()> {
        self.record("delete_volcano_job", name);
        Ok(())
    }

    async fn delete_config_map(&self, _namespace: &str, name: &str) -> ApiResult<()> {
        self.record("delete_config_map", name);
        match self.state.lock().unwrap().config_maps.remove(name) {
            Some(_) => Ok(()),
            None => Err(KubeApiError::NotFound {
                kind: "ConfigMap",
                name: name.to_string(),
            }),
        }
    }

    async fn list_pods(&self, _namespace: &str) -> ApiResult<Vec<Pod>> {
        let mut state = self.state.lock().unwrap();
        let pods = if state.pod_snapshots.len() > 1 {
            state.pod_snapshots.pop_front().unwrap_or_default()
        } else {
            state.pod_snapshots.front().cloned().unwrap_or_default()
        };
        Ok(pods)
    }

    async fn read_config_map_data(
        &self,
        _namespace: &str,
        name: &str,
    ) -> ApiResult<Option<BTreeMap<String, String>>> {
        Ok(self.state.lock().unwrap().config_maps.get(name).cloned())
    }
}
