use api_types::JobType;
use api_types::TestJobSpec;

/// A spec bound to a fresh run-id.
///
/// Concurrent runs are kept apart only by the run-id; two runs sharing one
/// would write into the same rendezvous directory.
#[derive(Debug, Clone)]
pub struct SubmittedJob {
    pub spec: TestJobSpec,
    pub run_id: String,
}

impl SubmittedJob {
    pub fn new(spec: TestJobSpec) -> Self {
        Self::with_run_id(spec, new_run_id())
    }

    pub fn with_run_id(spec: TestJobSpec, run_id: impl Into<String>) -> Self {
        Self {
            spec,
            run_id: run_id.into(),
        }
    }

    /// `{prefix}-{run_id}`; also the prefix of every pod name.
    pub fn job_name(&self) -> String {
        format!("{}-{}", self.spec.job_name_prefix, self.run_id)
    }

    pub fn config_map_name(&self) -> String {
        format!("{}-rendezvous", self.job_name())
    }

    /// Name suffix of the pod whose log carries the test summary; `None`
    /// for a single job, whose only pod has a generated name.
    pub fn leader_suffix(&self) -> Option<&'static str> {
        match self.spec.job_type {
            JobType::Single => None,
            JobType::MultiPdMix => Some("-node-0"),
            JobType::MultiPdSeparation => Some("-router-0"),
        }
    }
}

/// 8 lowercase hex characters from a v4 UUID.
pub fn new_run_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

#[cfg(test)]
pub(crate) mod tests {
    use api_types::EnvFlavor;
    use api_types::RoleSizes;
    use api_types::ServerArgs;
    use similar_asserts::assert_eq;

    use super::*;

    pub(crate) fn spec(job_type: JobType) -> TestJobSpec {
        TestJobSpec {
            job_type,
            image: "registry.local/sglang:ci".to_string(),
            namespace: "ci".to_string(),
            job_name_prefix: "sglang-ci".to_string(),
            model_path: "/models/qwen".to_string(),
            test_case: "test/srt/test_ascend.py".to_string(),
            sglang_source_relative_path: "sglang".to_string(),
            env: EnvFlavor::Ci,
            sizes: RoleSizes::default(),
            server_args: ServerArgs::default(),
            pass_env: Default::default(),
        }
    }

    #[test]
    fn run_id_is_eight_hex_chars() {
        let id = new_run_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(new_run_id() != id);
    }

    #[test]
    fn names_derive_from_prefix_and_run_id() {
        let job = SubmittedJob::with_run_id(spec(JobType::MultiPdMix), "ab12cd34");
        assert_eq!(job.job_name(), "sglang-ci-ab12cd34");
        assert_eq!(job.config_map_name(), "sglang-ci-ab12cd34-rendezvous");
        assert_eq!(job.leader_suffix(), Some("-node-0"));
    }
}
