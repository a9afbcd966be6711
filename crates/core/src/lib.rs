//! Skipper core types: progress events shared by every reconciliation and
//! the immutable workload descriptor callers hand to the engine.

#![forbid(unsafe_code)]

pub mod event;
pub mod workload;

pub use event::{
    AnyEvent, BuildDetail, BuildEvent, DeploymentDetail, DeploymentEvent, Event, EventDetail,
    EventError, EventRecord, EventStatus, JobDetail, JobEvent, PodDetail, PodEvent,
};
pub use workload::{PortSpec, ResourceLimits, SpecError, WorkloadKind, WorkloadSpec};

/// Label carried by every pod template Skipper creates; pod watches select on it.
pub const WORKLOAD_LABEL: &str = "app.kubernetes.io/name";

/// Field manager used for server-side apply and recorded in `managed-by`.
pub const FIELD_MANAGER: &str = "skipper";

/// Identifies one reconciliation target inside the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub namespace: String,
    pub name: String,
}

impl Target {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
