//! Typed manifests for a submitted job.

use api_types::EnvFlavor;
use api_types::JobType;
use serde_json::json;
use serde_json::Value;

use crate::error::HarnessResult;
use crate::job::SubmittedJob;
use crate::k8s::ManifestDocument;

pub const NPU_RESOURCE: &str = "huawei.com/ascend-1980";
pub const CONTAINER_NAME: &str = "sglang";
const MANAGED_BY: &str = "ci-harness";
/// Role and RoleBinding shared by every run in a namespace. Teardown leaves
/// them in place and the next run's create hits 409 and reuses them.
pub const LAUNCHER_ROLE: &str = "ci-harness-launcher";

/// Role, RoleBinding, rendezvous ConfigMap and workload, in apply order.
///
/// # Errors
///
/// - [`crate::error::HarnessError::ManifestInvalid`] if a rendered body does not
///   match its kind's schema
pub fn render_job(job: &SubmittedJob) -> HarnessResult<Vec<ManifestDocument>> {
    let bodies = [
        role(job),
        role_binding(job),
        rendezvous_config_map(job),
        workload(job),
    ];
    bodies.into_iter().map(ManifestDocument::from_value).collect()
}

fn metadata(job: &SubmittedJob, name: &str) -> Value {
    json!({
        "name": name,
        "namespace": job.spec.namespace,
        "labels": {
            "app.kubernetes.io/managed-by": MANAGED_BY,
            "ci-harness/run-id": job.run_id,
            "ci-harness/job-type": job.spec.job_type.as_str(),
        },
    })
}

fn shared_metadata(job: &SubmittedJob, name: &str) -> Value {
    json!({
        "name": name,
        "namespace": job.spec.namespace,
        "labels": { "app.kubernetes.io/managed-by": MANAGED_BY },
    })
}

/// Lets the launcher read and write the rendezvous ConfigMaps.
fn role(job: &SubmittedJob) -> Value {
    json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "Role",
        "metadata": shared_metadata(job, LAUNCHER_ROLE),
        "rules": [
            {
                "apiGroups": [""],
                "resources": ["configmaps"],
                "verbs": ["get", "list", "create", "update", "patch"],
            },
            {
                "apiGroups": [""],
                "resources": ["pods"],
                "verbs": ["get", "list"],
            },
        ],
    })
}

fn role_binding(job: &SubmittedJob) -> Value {
    json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "RoleBinding",
        "metadata": shared_metadata(job, LAUNCHER_ROLE),
        "subjects": [{
            "kind": "ServiceAccount",
            "name": "default",
            "namespace": job.spec.namespace,
        }],
        "roleRef": {
            "apiGroup": "rbac.authorization.k8s.io",
            "kind": "Role",
            "name": LAUNCHER_ROLE,
        },
    })
}

fn rendezvous_config_map(job: &SubmittedJob) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": metadata(job, &job.config_map_name()),
        "data": {},
    })
}

fn env_var(name: &str, value: impl ToString) -> Value {
    json!({ "name": name, "value": value.to_string() })
}

fn field_ref(name: &str, path: &str) -> Value {
    json!({ "name": name, "valueFrom": { "fieldRef": { "fieldPath": path } } })
}

/// Process-start environment of `ci-harness launch`.
fn launch_env(job: &SubmittedJob) -> Vec<Value> {
    let spec = &job.spec;
    let log_level = match spec.env {
        EnvFlavor::Debug => "debug",
        EnvFlavor::Ci => "info",
    };
    let mut env = vec![
        field_ref("NAMESPACE", "metadata.namespace"),
        field_ref("POD_IP", "status.podIP"),
        env_var("KUBE_CONFIG_MAP", job.config_map_name()),
        env_var("KUBE_JOB_TYPE", spec.job_type),
        env_var("KUBE_JOB_NAME", job.job_name()),
        env_var("METRICS_DATA_FILE", format!("/tmp/{}-metrics.txt", job.job_name())),
        env_var("MODEL_PATH", &spec.model_path),
        env_var("TEST_CASE", &spec.test_case),
        env_var("SGLANG_SOURCE_PATH", &spec.sglang_source_relative_path),
        env_var("SINGLE_NPUS", spec.sizes.npus),
        env_var("MIX_REPLICAS", spec.sizes.replicas),
        env_var("PREFILL_SIZE", spec.sizes.prefill),
        env_var("DECODE_SIZE", spec.sizes.decode),
        env_var("NPUS_PER_POD", spec.sizes.npus_per_pod),
        env_var("SERVER_EXTRA_ARGS", spec.server_args.extra.join(" ")),
        env_var("PREFILL_ARGS", spec.server_args.prefill.join(" ")),
        env_var("DECODE_ARGS", spec.server_args.decode.join(" ")),
        env_var("RUST_LOG", log_level),
    ];
    env.extend(
        spec.pass_env
            .iter()
            .map(|(name, value)| env_var(name, value)),
    );
    env
}

fn pod_spec(job: &SubmittedJob, npus: u32) -> Value {
    let resources = if npus == 0 {
        json!({})
    } else {
        json!({
            "limits": { NPU_RESOURCE: npus.to_string() },
            "requests": { NPU_RESOURCE: npus.to_string() },
        })
    };
    json!({
        "restartPolicy": "Never",
        "containers": [{
            "name": CONTAINER_NAME,
            "image": job.spec.image,
            "imagePullPolicy": "IfNotPresent",
            "command": ["ci-harness", "launch"],
            "env": launch_env(job),
            "resources": resources,
        }],
    })
}

fn volcano_task(job: &SubmittedJob, name: &str, replicas: u32, npus: u32) -> Value {
    json!({
        "name": name,
        "replicas": replicas,
        "template": {
            "metadata": { "labels": { "ci-harness/run-id": job.run_id, "ci-harness/role": name } },
            "spec": pod_spec(job, npus),
        },
    })
}

fn workload(job: &SubmittedJob) -> Value {
    let sizes = &job.spec.sizes;
    let tasks = match job.spec.job_type {
        JobType::Single => {
            return json!({
                "apiVersion": "batch/v1",
                "kind": "Job",
                "metadata": metadata(job, &job.job_name()),
                "spec": {
                    "backoffLimit": 0,
                    "template": {
                        "metadata": { "labels": { "ci-harness/run-id": job.run_id } },
                        "spec": pod_spec(job, sizes.npus),
                    },
                },
            });
        }
        JobType::MultiPdMix => vec![volcano_task(job, "node", sizes.replicas, sizes.npus_per_pod)],
        JobType::MultiPdSeparation => vec![
            volcano_task(job, "prefill", sizes.prefill, sizes.npus_per_pod),
            volcano_task(job, "decode", sizes.decode, sizes.npus_per_pod),
            volcano_task(job, "router", sizes.router, 0),
        ],
    };
    let min_available: u64 = tasks
        .iter()
        .filter_map(|task| task["replicas"].as_u64())
        .sum();

    json!({
        "apiVersion": "batch.volcano.sh/v1alpha1",
        "kind": "Job",
        "metadata": metadata(job, &job.job_name()),
        "spec": {
            "schedulerName": "volcano",
            "minAvailable": min_available,
            "maxRetry": 0,
            // svc gives every pod the stable `{job}-{task}-{index}` hostname
            "plugins": { "svc": [], "env": [] },
            "tasks": tasks,
        },
    })
}
