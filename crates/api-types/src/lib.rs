//! Shared API type definitions
//!
//! This crate contains the job description and report types shared between the
//! CI driver, the batch runner and the in-pod launcher. Everything here is plain
//! data with serde derives so job lists can be loaded from YAML.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Cluster topology a test job runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    /// One pod running one server process.
    Single,
    /// Symmetric data-parallel replicas forming one multi-node instance.
    MultiPdMix,
    /// Disjoint prefill, decode and router roles.
    MultiPdSeparation,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Single => "single",
            JobType::MultiPdMix => "multi-pd-mix",
            JobType::MultiPdSeparation => "multi-pd-separation",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(JobType::Single),
            "multi-pd-mix" => Ok(JobType::MultiPdMix),
            "multi-pd-separation" => Ok(JobType::MultiPdSeparation),
            other => Err(format!(
                "unknown job type `{other}`, expected single, multi-pd-mix or multi-pd-separation"
            )),
        }
    }
}

/// Execution flavour forwarded into the launched pods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvFlavor {
    /// Verbose logging inside the pods.
    Debug,
    #[default]
    Ci,
}

impl EnvFlavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvFlavor::Debug => "debug",
            EnvFlavor::Ci => "ci",
        }
    }
}

impl fmt::Display for EnvFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvFlavor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(EnvFlavor::Debug),
            "ci" => Ok(EnvFlavor::Ci),
            other => Err(format!("unknown env `{other}`, expected debug or ci")),
        }
    }
}

/// Per-role pod and device counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleSizes {
    /// NPUs for a `single` job
    pub npus: u32,
    /// Replica count for `multi-pd-mix`
    pub replicas: u32,
    /// Prefill pods for `multi-pd-separation`
    pub prefill: u32,
    /// Decode pods for `multi-pd-separation`
    pub decode: u32,
    /// Router pods for `multi-pd-separation`
    pub router: u32,
    /// NPUs requested by every multi-node pod
    pub npus_per_pod: u32,
}

impl Default for RoleSizes {
    fn default() -> Self {
        Self {
            npus: 1,
            replicas: 2,
            prefill: 1,
            decode: 1,
            router: 1,
            npus_per_pod: 16,
        }
    }
}

/// Static server arguments per role.
///
/// A role whose list carries `--node-rank` forms one multi-node instance; the
/// launcher rewrites the rank per pod.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerArgs {
    /// Appended to every server launch
    pub extra: Vec<String>,
    pub prefill: Vec<String>,
    pub decode: Vec<String>,
}

/// Description of one CI test job.
///
/// A spec is immutable once submitted; every submission gets its own run-id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestJobSpec {
    pub job_type: JobType,
    pub image: String,
    pub namespace: String,
    pub job_name_prefix: String,
    pub model_path: String,
    /// Test case path relative to the sglang source tree
    pub test_case: String,
    /// Location of the sglang checkout inside the image
    #[serde(default = "default_source_path")]
    pub sglang_source_relative_path: String,
    #[serde(default)]
    pub env: EnvFlavor,
    #[serde(default)]
    pub sizes: RoleSizes,
    #[serde(default)]
    pub server_args: ServerArgs,
    /// Extra environment variables forwarded into every launched container
    #[serde(default)]
    pub pass_env: BTreeMap<String, String>,
}

fn default_source_path() -> String {
    "sglang".to_string()
}

/// Final classification of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pass,
    Fail,
    Error,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Result of a single job in a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_name: String,
    pub status: JobStatus,
    /// Failure summary or error chain, empty on pass
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_type_parses_cli_names() {
        assert_eq!("single".parse::<JobType>(), Ok(JobType::Single));
        assert_eq!("multi-pd-mix".parse::<JobType>(), Ok(JobType::MultiPdMix));
        assert_eq!(
            "multi-pd-separation".parse::<JobType>(),
            Ok(JobType::MultiPdSeparation)
        );
        assert!("multi".parse::<JobType>().is_err());
    }

    #[test]
    fn spec_deserializes_with_defaults() {
        let yaml = r#"
job_type: multi-pd-separation
image: registry.local/sglang:latest
namespace: ci
job_name_prefix: sglang-ci
model_path: /models/qwen
test_case: test/srt/test_pd.py
sizes:
  prefill: 2
server_args:
  prefill: [--nnodes, "2", --node-rank, "0"]
"#;
        let spec: TestJobSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.job_type, JobType::MultiPdSeparation);
        assert_eq!(spec.env, EnvFlavor::Ci);
        assert_eq!(spec.sizes.prefill, 2);
        assert_eq!(spec.sizes.decode, 1);
        assert_eq!(spec.sglang_source_relative_path, "sglang");
        assert!(spec.pass_env.is_empty());
        assert_eq!(spec.server_args.prefill.len(), 4);
        assert!(spec.server_args.decode.is_empty());
    }
}
