use std::fmt;
use std::path::Path;

use error_stack::Report;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::rbac::v1::Role;
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use serde::Deserialize;

use crate::error::HarnessError;
use crate::error::HarnessResult;

pub(crate) const VOLCANO_GROUP: &str = "batch.volcano.sh";
pub(crate) const VOLCANO_VERSION: &str = "v1alpha1";

/// The fixed set of resource kinds the harness knows how to manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifestKind {
    Pod,
    Job,
    VolcanoJob,
    ConfigMap,
    Role,
    RoleBinding,
}

impl ManifestKind {
    pub const ALL: [ManifestKind; 6] = [
        ManifestKind::Pod,
        ManifestKind::Job,
        ManifestKind::VolcanoJob,
        ManifestKind::ConfigMap,
        ManifestKind::Role,
        ManifestKind::RoleBinding,
    ];

    /// Resolve a `(kind, apiVersion)` pair.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::UnsupportedResourceKind`] for any pair outside the fixed set
    pub fn from_type_meta(kind: &str, api_version: &str) -> HarnessResult<Self> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.kind() == kind && candidate.api_version() == api_version)
            .ok_or_else(|| {
                Report::new(HarnessError::UnsupportedResourceKind {
                    kind: kind.to_string(),
                    api_version: api_version.to_string(),
                })
            })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ManifestKind::Pod => "Pod",
            ManifestKind::Job | ManifestKind::VolcanoJob => "Job",
            ManifestKind::ConfigMap => "ConfigMap",
            ManifestKind::Role => "Role",
            ManifestKind::RoleBinding => "RoleBinding",
        }
    }

    pub fn api_version(&self) -> &'static str {
        match self {
            ManifestKind::Pod | ManifestKind::ConfigMap => "v1",
            ManifestKind::Job => "batch/v1",
            ManifestKind::VolcanoJob => "batch.volcano.sh/v1alpha1",
            ManifestKind::Role | ManifestKind::RoleBinding => "rbac.authorization.k8s.io/v1",
        }
    }
}

impl fmt::Display for ManifestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.api_version())
    }
}

/// Api resource descriptor for the Volcano `Job` CRD.
pub(crate) fn volcano_job_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        VOLCANO_GROUP,
        VOLCANO_VERSION,
        "Job",
    ))
}

/// A parsed resource body tagged by its kind.
#[derive(Debug, Clone)]
pub enum ManifestDocument {
    Pod(Pod),
    Job(Job),
    VolcanoJob(DynamicObject),
    ConfigMap(ConfigMap),
    Role(Role),
    RoleBinding(RoleBinding),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeHeader {
    kind: Option<String>,
    api_version: Option<String>,
}

impl ManifestDocument {
    pub fn kind(&self) -> ManifestKind {
        match self {
            ManifestDocument::Pod(_) => ManifestKind::Pod,
            ManifestDocument::Job(_) => ManifestKind::Job,
            ManifestDocument::VolcanoJob(_) => ManifestKind::VolcanoJob,
            ManifestDocument::ConfigMap(_) => ManifestKind::ConfigMap,
            ManifestDocument::Role(_) => ManifestKind::Role,
            ManifestDocument::RoleBinding(_) => ManifestKind::RoleBinding,
        }
    }

    pub fn name(&self) -> String {
        match self {
            ManifestDocument::Pod(r) => r.name_any(),
            ManifestDocument::Job(r) => r.name_any(),
            ManifestDocument::VolcanoJob(r) => r.name_any(),
            ManifestDocument::ConfigMap(r) => r.name_any(),
            ManifestDocument::Role(r) => r.name_any(),
            ManifestDocument::RoleBinding(r) => r.name_any(),
        }
    }

    /// Build a typed document from an untyped resource body.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::ManifestInvalid`] if `kind`/`apiVersion` are missing or the body
    ///   does not match the kind's schema
    /// - [`HarnessError::UnsupportedResourceKind`] for kinds outside the fixed set
    pub fn from_value(value: serde_json::Value) -> HarnessResult<Self> {
        let header = TypeHeader::deserialize(&value)
            .map_err(|e| HarnessError::manifest(format!("unreadable type header: {e}")))?;
        let (Some(kind), Some(api_version)) = (header.kind, header.api_version) else {
            return Err(HarnessError::manifest("document without kind or apiVersion"));
        };
        let manifest_kind = ManifestKind::from_type_meta(&kind, &api_version)?;

        let document = match manifest_kind {
            ManifestKind::Pod => serde_json::from_value(value).map(ManifestDocument::Pod),
            ManifestKind::Job => serde_json::from_value(value).map(ManifestDocument::Job),
            ManifestKind::VolcanoJob => {
                serde_json::from_value(value).map(ManifestDocument::VolcanoJob)
            }
            ManifestKind::ConfigMap => {
                serde_json::from_value(value).map(ManifestDocument::ConfigMap)
            }
            ManifestKind::Role => serde_json::from_value(value).map(ManifestDocument::Role),
            ManifestKind::RoleBinding => {
                serde_json::from_value(value).map(ManifestDocument::RoleBinding)
            }
        };
        document.map_err(|e| HarnessError::manifest(format!("malformed {manifest_kind} body: {e}")))
    }

    fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            ManifestDocument::Pod(r) => serde_json::to_value(r),
            ManifestDocument::Job(r) => serde_json::to_value(r),
            ManifestDocument::VolcanoJob(r) => serde_json::to_value(r),
            ManifestDocument::ConfigMap(r) => serde_json::to_value(r),
            ManifestDocument::Role(r) => serde_json::to_value(r),
            ManifestDocument::RoleBinding(r) => serde_json::to_value(r),
        }
    }
}

/// Parse a multi-document YAML stream. Empty documents are skipped.
pub fn parse_documents(yaml: &str) -> HarnessResult<Vec<ManifestDocument>> {
    let mut documents = Vec::new();
    for (index, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let value = serde_json::Value::deserialize(doc)
            .map_err(|e| HarnessError::manifest(format!("document #{index} is not valid YAML: {e}")))?;
        if value.is_null() {
            continue;
        }
        documents.push(ManifestDocument::from_value(value)?);
    }
    Ok(documents)
}

/// Serialize documents as one multi-document YAML stream.
pub fn render_documents(documents: &[ManifestDocument]) -> HarnessResult<String> {
    let mut out = String::new();
    for document in documents {
        let yaml = document
            .to_value()
            .map_err(|e| e.to_string())
            .and_then(|value| serde_yaml::to_string(&value).map_err(|e| e.to_string()))
            .map_err(|e| {
                HarnessError::manifest(format!("cannot serialize {}: {e}", document.kind()))
            })?;
        out.push_str("---\n");
        out.push_str(&yaml);
    }
    Ok(out)
}

pub async fn write_manifest_file(path: &Path, documents: &[ManifestDocument]) -> HarnessResult<()> {
    let yaml = render_documents(documents)?;
    tokio::fs::write(path, yaml)
        .await
        .map_err(|e| HarnessError::manifest(format!("cannot write {}: {e}", path.display())))
}

pub async fn read_manifest_file(path: &Path) -> HarnessResult<Vec<ManifestDocument>> {
    let yaml = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| HarnessError::manifest(format!("cannot read {}: {e}", path.display())))?;
    parse_documents(&yaml)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIXED: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: ci-1234-rendezvous
data: {}
---
apiVersion: batch.volcano.sh/v1alpha1
kind: Job
metadata:
  name: ci-1234
spec:
  minAvailable: 2
  tasks:
    - name: node
      replicas: 2
---
apiVersion: batch/v1
kind: Job
metadata:
  name: ci-5678
spec:
  template:
    spec:
      containers: []
---
apiVersion: rbac.authorization.k8s.io/v1
kind: Role
metadata:
  name: ci-role
"#;

    #[test]
    fn every_supported_pair_resolves_to_one_kind() {
        for kind in ManifestKind::ALL {
            let resolved = ManifestKind::from_type_meta(kind.kind(), kind.api_version()).unwrap();
            assert_eq!(resolved, kind);
        }
    }

    #[test]
    fn unknown_pair_is_rejected() {
        let err = ManifestKind::from_type_meta("Deployment", "apps/v1").unwrap_err();
        assert!(matches!(
            err.current_context(),
            HarnessError::UnsupportedResourceKind { kind, .. } if kind == "Deployment"
        ));

        // same kind, wrong group
        assert!(ManifestKind::from_type_meta("Job", "batch/v2").is_err());
    }

    #[test]
    fn parses_multi_document_stream() {
        let docs = parse_documents(MIXED).unwrap();
        let kinds: Vec<_> = docs.iter().map(ManifestDocument::kind).collect();
        assert_eq!(
            kinds,
            vec![
                ManifestKind::ConfigMap,
                ManifestKind::VolcanoJob,
                ManifestKind::Job,
                ManifestKind::Role,
            ]
        );
        assert_eq!(docs[1].name(), "ci-1234");
        assert_eq!(docs[2].name(), "ci-5678");
    }

    #[test]
    fn stream_with_unknown_kind_fails() {
        let yaml = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: x\n";
        let err = parse_documents(yaml).unwrap_err();
        assert!(matches!(
            err.current_context(),
            HarnessError::UnsupportedResourceKind { .. }
        ));
    }

    #[test]
    fn rendered_stream_parses_back() {
        let docs = parse_documents(MIXED).unwrap();
        let yaml = render_documents(&docs).unwrap();
        let reparsed = parse_documents(&yaml).unwrap();
        assert_eq!(reparsed.len(), docs.len());
        assert_eq!(reparsed[1].kind(), ManifestKind::VolcanoJob);
    }
}
