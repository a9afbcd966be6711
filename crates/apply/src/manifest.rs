//! Initial payloads built from a workload descriptor.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use serde_json::{json, Map, Value as Json};
use skipper_core::{DeploymentDetail, JobDetail, WorkloadKind, WorkloadSpec, FIELD_MANAGER, WORKLOAD_LABEL};
use skipper_reconcile::Workload;

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// A workload the controller can create from a [`WorkloadSpec`].
pub trait Manifest: Workload {
    /// Changes to an existing object are applied by delete-then-create.
    const ALWAYS_RECREATE: bool = false;

    fn manifest(spec: &WorkloadSpec) -> Result<Self>;

    /// Detail reported until the first snapshot arrives.
    fn seed(spec: &WorkloadSpec) -> Self::Detail;
}

impl Manifest for Deployment {
    fn manifest(spec: &WorkloadSpec) -> Result<Self> {
        let WorkloadKind::Deployment { replicas } = spec.kind else {
            return Err(anyhow!("{} is not a deployment", spec.name));
        };
        let labels = labels(spec);
        let v = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": spec.name, "namespace": spec.namespace, "labels": labels },
            "spec": {
                "replicas": replicas,
                "selector": { "matchLabels": { WORKLOAD_LABEL: spec.name } },
                "template": {
                    "metadata": { "labels": labels },
                    "spec": pod_spec(spec, None),
                }
            }
        });
        serde_json::from_value(v).with_context(|| format!("building deployment manifest for {}", spec.name))
    }

    fn seed(spec: &WorkloadSpec) -> DeploymentDetail {
        DeploymentDetail::new(&spec.name, spec.replicas())
    }
}

impl Manifest for Job {
    // The pod template of a Job is immutable.
    const ALWAYS_RECREATE: bool = true;

    fn manifest(spec: &WorkloadSpec) -> Result<Self> {
        let WorkloadKind::Job { backoff_limit, ttl_seconds_after_finished } = spec.kind else {
            return Err(anyhow!("{} is not a job", spec.name));
        };
        let labels = labels(spec);
        let mut job_spec = json!({
            "template": {
                "metadata": { "labels": labels },
                "spec": pod_spec(spec, Some("Never")),
            }
        });
        if let Some(limit) = backoff_limit {
            job_spec["backoffLimit"] = json!(limit);
        }
        if let Some(ttl) = ttl_seconds_after_finished {
            job_spec["ttlSecondsAfterFinished"] = json!(ttl);
        }
        let v = json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": spec.name, "namespace": spec.namespace, "labels": labels },
            "spec": job_spec,
        });
        serde_json::from_value(v).with_context(|| format!("building job manifest for {}", spec.name))
    }

    fn seed(spec: &WorkloadSpec) -> JobDetail {
        JobDetail::new(&spec.name)
    }
}

/// User labels plus the two Skipper labels, which always win.
pub fn labels(spec: &WorkloadSpec) -> BTreeMap<String, String> {
    let mut out = spec.labels.clone();
    out.insert(WORKLOAD_LABEL.to_string(), spec.name.clone());
    out.insert(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string());
    out
}

fn pod_spec(spec: &WorkloadSpec, restart_policy: Option<&str>) -> Json {
    let mut pod = json!({ "containers": [container(spec)] });
    if !spec.image_pull_secrets.is_empty() {
        pod["imagePullSecrets"] = spec.image_pull_secrets.iter().map(|s| json!({ "name": s })).collect();
    }
    if let Some(policy) = restart_policy {
        pod["restartPolicy"] = json!(policy);
    }
    pod
}

fn container(spec: &WorkloadSpec) -> Json {
    let mut c = Map::new();
    c.insert("name".into(), json!(spec.name));
    c.insert("image".into(), json!(spec.image));
    if !spec.command.is_empty() {
        c.insert("command".into(), json!(spec.command));
    }
    if !spec.args.is_empty() {
        c.insert("args".into(), json!(spec.args));
    }
    if !spec.env.is_empty() {
        let env: Vec<Json> = spec.env.iter().map(|(k, v)| json!({ "name": k, "value": v })).collect();
        c.insert("env".into(), Json::Array(env));
    }
    let env_from: Vec<Json> = spec
        .secrets
        .iter()
        .map(|s| json!({ "secretRef": { "name": s } }))
        .chain(spec.config_maps.iter().map(|m| json!({ "configMapRef": { "name": m } })))
        .collect();
    if !env_from.is_empty() {
        c.insert("envFrom".into(), Json::Array(env_from));
    }
    if !spec.limits.is_empty() {
        let mut limits = Map::new();
        if let Some(cpu) = &spec.limits.cpu {
            limits.insert("cpu".into(), json!(cpu));
        }
        if let Some(mem) = &spec.limits.memory {
            limits.insert("memory".into(), json!(mem));
        }
        if let Some(gpu) = spec.limits.gpu {
            limits.insert(GPU_RESOURCE.into(), json!(gpu.to_string()));
        }
        c.insert("resources".into(), json!({ "limits": limits }));
    }
    if !spec.ports.is_empty() {
        let ports: Vec<Json> = spec
            .ports
            .iter()
            .map(|p| {
                let mut port = json!({ "containerPort": p.container_port });
                if let Some(name) = &p.name {
                    port["name"] = json!(name);
                }
                if let Some(proto) = &p.protocol {
                    port["protocol"] = json!(proto);
                }
                port
            })
            .collect();
        c.insert("ports".into(), Json::Array(ports));
    }
    if let (true, Some(first)) = (spec.health_check, spec.ports.first()) {
        let probe = |delay: u32| json!({ "tcpSocket": { "port": first.container_port }, "initialDelaySeconds": delay, "periodSeconds": 10 });
        c.insert("readinessProbe".into(), probe(5));
        c.insert("livenessProbe".into(), probe(15));
    }
    Json::Object(c)
}
