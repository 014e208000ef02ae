use std::collections::BTreeMap;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::info;
use tracing::warn;

use crate::error::HarnessError;
use crate::error::HarnessResult;
use crate::k8s::client::ClusterApi;
use crate::k8s::manifest::ManifestDocument;
use crate::k8s::manifest::ManifestKind;

/// Creates and deletes the harness' resources.
#[derive(Clone)]
pub struct ResourceManager {
    api: Arc<dyn ClusterApi>,
}

impl ResourceManager {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }

    /// Create every document in order.
    ///
    /// Stops at the first failure; resources created before it are left in place
    /// for the caller's teardown. A Role or RoleBinding that already exists is
    /// shared with earlier runs and reused as is.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::ResourceCreation`] naming the document that failed
    #[tracing::instrument(skip(self, documents), fields(count = documents.len()))]
    pub async fn apply(
        &self,
        documents: &[ManifestDocument],
        namespace: &str,
    ) -> HarnessResult<()> {
        for document in documents {
            let kind = document.kind();
            let name = document.name();
            info!(%kind, %name, "creating resource");

            let result = match document {
                ManifestDocument::Pod(pod) => self.api.create_pod(namespace, pod).await,
                ManifestDocument::Job(job) => self.api.create_job(namespace, job).await,
                ManifestDocument::VolcanoJob(job) => {
                    self.api.create_volcano_job(namespace, job).await
                }
                ManifestDocument::ConfigMap(cm) => self.api.create_config_map(namespace, cm).await,
                ManifestDocument::Role(role) => self.api.create_role(namespace, role).await,
                ManifestDocument::RoleBinding(binding) => {
                    self.api.create_role_binding(namespace, binding).await
                }
            };
            match result {
                Err(e)
                    if e.is_conflict()
                        && matches!(kind, ManifestKind::Role | ManifestKind::RoleBinding) =>
                {
                    info!(%kind, %name, "already exists, reusing");
                }
                other => other
                    .change_context(HarnessError::ResourceCreation { kind, name })
                    .attach_printable_lazy(|| format!("namespace: {namespace}"))?,
            }
        }
        Ok(())
    }

    /// Create the ConfigMap, or replace it wholesale if it already exists.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::ResourceCreation`] if neither create nor replace succeed
    pub async fn upsert_config_map(
        &self,
        name: &str,
        data: BTreeMap<String, String>,
        namespace: &str,
    ) -> HarnessResult<()> {
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        let result = match self.api.create_config_map(namespace, &config_map).await {
            Err(e) if e.is_conflict() => self.api.replace_config_map(namespace, &config_map).await,
            other => other,
        };
        result.change_context(HarnessError::ResourceCreation {
            kind: ManifestKind::ConfigMap,
            name: name.to_string(),
        })
    }

    /// Read a ConfigMap's data; `None` when it does not exist.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::ResourceRead`] if the API call fails
    pub async fn read_config_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> HarnessResult<Option<BTreeMap<String, String>>> {
        self.api
            .read_config_map_data(namespace, name)
            .await
            .change_context(HarnessError::ResourceRead {
                kind: ManifestKind::ConfigMap,
                name: name.to_string(),
            })
    }

    /// Delete the deletable documents.
    ///
    /// Only Job, VolcanoJob and ConfigMap are deleted. Pods, Roles and
    /// RoleBindings are left to namespace cleanup; that gap is known and kept.
    /// A document that is already gone counts as deleted.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::ResourceDeletion`] for the first delete that fails
    #[tracing::instrument(skip(self, documents), fields(count = documents.len()))]
    pub async fn delete(
        &self,
        documents: &[ManifestDocument],
        namespace: &str,
    ) -> HarnessResult<()> {
        for document in documents {
            let kind = document.kind();
            let name = document.name();

            let result = match kind {
                ManifestKind::Job => self.api.delete_job(namespace, &name).await,
                ManifestKind::VolcanoJob => self.api.delete_volcano_job(namespace, &name).await,
                ManifestKind::ConfigMap => self.api.delete_config_map(namespace, &name).await,
                ManifestKind::Pod | ManifestKind::Role | ManifestKind::RoleBinding => {
                    info!(%kind, %name, "deletion not supported for kind, leaving in place");
                    continue;
                }
            };

            match result {
                Ok(()) => info!(%kind, %name, "deleted resource"),
                Err(e) if e.is_not_found() => {
                    warn!(%kind, %name, "resource already gone");
                }
                Err(e) => {
                    return Err(Report::new(e).change_context(HarnessError::ResourceDeletion {
                        kind,
                        name,
                    }));
                }
            }
        }
        Ok(())
    }
}
