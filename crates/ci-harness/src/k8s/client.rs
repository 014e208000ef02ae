use std::collections::BTreeMap;
use std::path::PathBuf;

use error_stack::ResultExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::rbac::v1::Role;
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::api::DeleteParams;
use kube::api::DynamicObject;
use kube::api::ListParams;
use kube::api::PostParams;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Api;
use kube::Client;
use kube::Config;
use thiserror::Error;

use crate::error::HarnessError;
use crate::error::HarnessResult;
use crate::k8s::manifest::volcano_job_resource;

/// Failure of a single Kubernetes API call.
#[derive(Debug, Error)]
pub enum KubeApiError {
    #[error("{kind} `{name}` already exists")]
    Conflict { kind: &'static str, name: String },
    #[error("{kind} `{name}` not found")]
    NotFound { kind: &'static str, name: String },
    #[error("{kind} `{name}` request failed: {message}")]
    Request {
        kind: &'static str,
        name: String,
        message: String,
    },
}

impl KubeApiError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, KubeApiError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, KubeApiError::NotFound { .. })
    }
}

pub type ApiResult<T> = Result<T, KubeApiError>;

/// The cluster operations used by the harness.
///
/// Every call maps to exactly one API request. The production implementation is
/// [`ClusterClient`]; tests use an in-memory double.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> ApiResult<()>;

    async fn create_job(&self, namespace: &str, job: &Job) -> ApiResult<()>;

    async fn create_volcano_job(&self, namespace: &str, job: &DynamicObject) -> ApiResult<()>;

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> ApiResult<()>;

    async fn replace_config_map(&self, namespace: &str, config_map: &ConfigMap) -> ApiResult<()>;

    async fn create_role(&self, namespace: &str, role: &Role) -> ApiResult<()>;

    async fn create_role_binding(&self, namespace: &str, binding: &RoleBinding) -> ApiResult<()>;

    async fn delete_job(&self, namespace: &str, name: &str) -> ApiResult<()>;

    async fn delete_volcano_job(&self, namespace: &str, name: &str) -> ApiResult<()>;

    async fn delete_config_map(&self, namespace: &str, name: &str) -> ApiResult<()>;

    async fn list_pods(&self, namespace: &str) -> ApiResult<Vec<Pod>>;

    /// Read a ConfigMap's `data`; `None` when the ConfigMap does not exist.
    async fn read_config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> ApiResult<Option<BTreeMap<String, String>>>;
}

/// Kubernetes client shared read-only by every component of a process.
#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
}

impl ClusterClient {
    /// Build the client from an explicit kubeconfig or the default chain
    /// (in-cluster service account, then `~/.kube/config`).
    ///
    /// # Errors
    ///
    /// - [`HarnessError::ConnectionFailed`] if the configuration cannot be loaded
    pub async fn connect(kubeconfig: Option<PathBuf>) -> HarnessResult<Self> {
        let client = match kubeconfig {
            Some(kubeconfig_path) => {
                let kubeconfig = Kubeconfig::read_from(&kubeconfig_path).change_context(
                    HarnessError::ConnectionFailed {
                        message: format!(
                            "Failed to read kubeconfig file: {}",
                            kubeconfig_path.display()
                        ),
                    },
                )?;

                let config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .change_context(HarnessError::ConnectionFailed {
                            message: format!(
                                "Failed to create config from kubeconfig: {}",
                                kubeconfig_path.display()
                            ),
                        })?;

                Client::try_from(config).change_context(HarnessError::ConnectionFailed {
                    message: "Failed to create Kubernetes client from custom kubeconfig".to_string(),
                })?
            }
            None => Client::try_default()
                .await
                .change_context(HarnessError::ConnectionFailed {
                    message: "Failed to create Kubernetes client".to_string(),
                })?,
        };

        Ok(Self { client })
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn volcano_jobs(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &volcano_job_resource())
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn classify(err: kube::Error, kind: &'static str, name: &str) -> KubeApiError {
    let name = name.to_string();
    match err {
        kube::Error::Api(response) if response.code == 409 => KubeApiError::Conflict { kind, name },
        kube::Error::Api(response) if response.code == 404 => KubeApiError::NotFound { kind, name },
        other => KubeApiError::Request {
            kind,
            name,
            message: other.to_string(),
        },
    }
}

fn object_name(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> &str {
    meta.name.as_deref().unwrap_or_default()
}

#[async_trait::async_trait]
impl ClusterApi for ClusterClient {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> ApiResult<()> {
        self.pods(namespace)
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| classify(e, "Pod", object_name(&pod.metadata)))?;
        Ok(())
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> ApiResult<()> {
        self.jobs(namespace)
            .create(&PostParams::default(), job)
            .await
            .map_err(|e| classify(e, "Job", object_name(&job.metadata)))?;
        Ok(())
    }

    async fn create_volcano_job(&self, namespace: &str, job: &DynamicObject) -> ApiResult<()> {
        self.volcano_jobs(namespace)
            .create(&PostParams::default(), job)
            .await
            .map_err(|e| classify(e, "VolcanoJob", object_name(&job.metadata)))?;
        Ok(())
    }

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> ApiResult<()> {
        self.config_maps(namespace)
            .create(&PostParams::default(), config_map)
            .await
            .map_err(|e| classify(e, "ConfigMap", object_name(&config_map.metadata)))?;
        Ok(())
    }

    async fn replace_config_map(&self, namespace: &str, config_map: &ConfigMap) -> ApiResult<()> {
        let name = object_name(&config_map.metadata);
        self.config_maps(namespace)
            .replace(name, &PostParams::default(), config_map)
            .await
            .map_err(|e| classify(e, "ConfigMap", name))?;
        Ok(())
    }

    async fn create_role(&self, namespace: &str, role: &Role) -> ApiResult<()> {
        Api::<Role>::namespaced(self.client.clone(), namespace)
            .create(&PostParams::default(), role)
            .await
            .map_err(|e| classify(e, "Role", object_name(&role.metadata)))?;
        Ok(())
    }

    async fn create_role_binding(&self, namespace: &str, binding: &RoleBinding) -> ApiResult<()> {
        Api::<RoleBinding>::namespaced(self.client.clone(), namespace)
            .create(&PostParams::default(), binding)
            .await
            .map_err(|e| classify(e, "RoleBinding", object_name(&binding.metadata)))?;
        Ok(())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> ApiResult<()> {
        // background propagation so the job's pods go with it
        self.jobs(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| classify(e, "Job", name))?;
        Ok(())
    }

    async fn delete_volcano_job(&self, namespace: &str, name: &str) -> ApiResult<()> {
        self.volcano_jobs(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| classify(e, "VolcanoJob", name))?;
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> ApiResult<()> {
        self.config_maps(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| classify(e, "ConfigMap", name))?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str) -> ApiResult<Vec<Pod>> {
        let pods = self
            .pods(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| classify(e, "Pod", "*"))?;
        Ok(pods.items)
    }

    async fn read_config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> ApiResult<Option<BTreeMap<String, String>>> {
        let config_map = self
            .config_maps(namespace)
            .get_opt(name)
            .await
            .map_err(|e| classify(e, "ConfigMap", name))?;
        Ok(config_map.map(|cm| cm.data.unwrap_or_default()))
    }
}
