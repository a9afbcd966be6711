//! Skipper apply: builds workload manifests, issues create/patch/delete
//! against the control plane and drives the reconciliation that follows.

#![forbid(unsafe_code)]

pub mod api;
pub mod controller;
pub mod manifest;

pub use api::{KubeWorkloadApi, WorkloadApi};
pub use controller::{ControllerConfig, DeployError, Deployed, Rollout, UpgradeStrategy, WorkloadController};
pub use manifest::{labels, Manifest, MANAGED_BY_LABEL};

/// Controller wired to the ambient cluster, configured from the environment.
pub async fn default_controller() -> anyhow::Result<WorkloadController<KubeWorkloadApi>> {
    Ok(WorkloadController::new(KubeWorkloadApi::try_default().await?, ControllerConfig::from_env()))
}
