//! Kubernetes integration module.
//!
//! The main components are:
//! - [`ManifestDocument`]: a parsed resource body tagged by [`ManifestKind`]
//! - [`ClusterApi`]: the cluster operations the harness needs, implemented by [`ClusterClient`]
//! - [`ResourceManager`]: apply, upsert and delete over a [`ClusterApi`]
//! - [`PodReadinessPoller`]: waits until a job's pods are Running and Ready

pub(crate) mod client;
pub(crate) mod lifecycle;
pub(crate) mod manifest;
#[cfg(test)]
pub(crate) mod mock;
pub(crate) mod readiness;

pub use client::ClusterApi;
pub use client::ClusterClient;
pub use client::KubeApiError;
pub use lifecycle::ResourceManager;
pub use manifest::read_manifest_file;
pub use manifest::write_manifest_file;
pub use manifest::ManifestDocument;
pub use manifest::ManifestKind;
pub use readiness::PodReadinessPoller;
