//! Workload descriptor supplied by callers. Read-only to the engine.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static DNS_LABEL: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").ok());

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("invalid name {0:?}: must be a lowercase DNS-1123 label of at most 63 characters")]
    InvalidName(String),
    #[error("image reference must not be empty")]
    MissingImage,
    #[error("replicas must be at least 1 (got {0})")]
    InvalidReplicas(i32),
    #[error("invalid port {0}")]
    InvalidPort(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkloadKind {
    /// Long-running replicas, ready once all are available.
    Deployment {
        #[serde(default = "default_replicas")]
        replicas: i32,
    },
    /// Run-to-completion pods, done once one succeeds.
    Job {
        #[serde(default, rename = "backoffLimit", skip_serializing_if = "Option::is_none")]
        backoff_limit: Option<i32>,
        #[serde(default, rename = "ttlSecondsAfterFinished", skip_serializing_if = "Option::is_none")]
        ttl_seconds_after_finished: Option<i32>,
    },
}

impl Default for WorkloadKind {
    fn default() -> Self {
        WorkloadKind::Deployment { replicas: default_replicas() }
    }
}

fn default_replicas() -> i32 {
    1
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<u32>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none() && self.gpu.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    pub container_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    pub name: String,
    pub image: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub kind: WorkloadKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "ResourceLimits::is_empty")]
    pub limits: ResourceLimits,
    /// Secrets exposed to the container as environment (`envFrom`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    /// ConfigMaps exposed to the container as environment (`envFrom`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_maps: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Adds readiness/liveness probes on the first declared port.
    #[serde(default)]
    pub health_check: bool,
}

impl WorkloadSpec {
    pub fn deployment(name: impl Into<String>, image: impl Into<String>, replicas: i32) -> Self {
        Self::with_kind(name, image, WorkloadKind::Deployment { replicas })
    }

    pub fn job(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self::with_kind(name, image, WorkloadKind::Job { backoff_limit: None, ttl_seconds_after_finished: None })
    }

    fn with_kind(name: impl Into<String>, image: impl Into<String>, kind: WorkloadKind) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            namespace: default_namespace(),
            kind,
            command: Vec::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            limits: ResourceLimits::default(),
            secrets: Vec::new(),
            config_maps: Vec::new(),
            image_pull_secrets: Vec::new(),
            ports: Vec::new(),
            labels: BTreeMap::new(),
            health_check: false,
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn is_job(&self) -> bool {
        matches!(self.kind, WorkloadKind::Job { .. })
    }

    /// Desired replica count; Jobs count as one.
    pub fn replicas(&self) -> i32 {
        match self.kind {
            WorkloadKind::Deployment { replicas } => replicas,
            WorkloadKind::Job { .. } => 1,
        }
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        let name_ok = self.name.len() <= 63 && DNS_LABEL.as_ref().map(|re| re.is_match(&self.name)).unwrap_or(false);
        if !name_ok {
            return Err(SpecError::InvalidName(self.name.clone()));
        }
        if self.image.trim().is_empty() {
            return Err(SpecError::MissingImage);
        }
        if let WorkloadKind::Deployment { replicas } = self.kind {
            if replicas < 1 {
                return Err(SpecError::InvalidReplicas(replicas));
            }
        }
        if let Some(p) = self.ports.iter().find(|p| p.container_port == 0) {
            return Err(SpecError::InvalidPort(p.container_port));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_yaml_with_defaults() {
        let y = "name: web\nimage: reg/web:1\nports:\n  - containerPort: 8080\nhealthCheck: true\n";
        let spec: WorkloadSpec = serde_yaml::from_str(y).unwrap();
        assert_eq!(spec.namespace, "default");
        assert_eq!(spec.kind, WorkloadKind::Deployment { replicas: 1 });
        assert_eq!(spec.ports[0].container_port, 8080);
        assert!(spec.health_check);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn parses_job_kind() {
        let y = "name: migrate\nimage: reg/db:2\nkind:\n  type: job\n  backoffLimit: 0\nsecrets: [db-creds]\nconfigMaps: [db-cfg]\n";
        let spec: WorkloadSpec = serde_yaml::from_str(y).unwrap();
        assert!(spec.is_job());
        assert_eq!(spec.kind, WorkloadKind::Job { backoff_limit: Some(0), ttl_seconds_after_finished: None });
        assert_eq!(spec.secrets, vec!["db-creds"]);
        assert_eq!(spec.config_maps, vec!["db-cfg"]);
        assert_eq!(spec.replicas(), 1);
    }

    #[test]
    fn validate_rejects_bad_input() {
        assert_eq!(
            WorkloadSpec::deployment("Web_App", "img", 1).validate(),
            Err(SpecError::InvalidName("Web_App".into()))
        );
        assert_eq!(WorkloadSpec::deployment("web", " ", 1).validate(), Err(SpecError::MissingImage));
        assert_eq!(WorkloadSpec::deployment("web", "img", 0).validate(), Err(SpecError::InvalidReplicas(0)));
        let mut s = WorkloadSpec::deployment("web", "img", 1);
        s.ports.push(PortSpec { container_port: 0, name: None, protocol: None });
        assert_eq!(s.validate(), Err(SpecError::InvalidPort(0)));
        assert!(WorkloadSpec::deployment(&"a".repeat(64), "img", 1).validate().is_err());
    }
}
