//! Workload controller: issues the create/patch/delete for a descriptor and
//! hands back the reconciliation that observes it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use metrics::counter;
use skipper_core::{AnyEvent, SpecError, Target, WorkloadKind, WorkloadSpec};
use skipper_reconcile::{ReconcileConfig, ReconcileError, Reconciliation, Workload};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::WorkloadApi;
use crate::manifest::Manifest;

/// Stand-in deadline for timeouts too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpgradeStrategy {
    /// Patch in place and let the cluster roll the change out.
    #[default]
    Rolling,
    /// Delete, wait for the settle delay, create again.
    Recreate,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub reconcile: ReconcileConfig,
    /// Pause between delete and create on `Recreate`.
    pub settle: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { reconcile: ReconcileConfig::default(), settle: Duration::from_secs(5) }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let settle = std::env::var("SKIPPER_RECREATE_SETTLE_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(5));
        Self { reconcile: ReconcileConfig::from_env(), settle }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error(transparent)]
    Spec(#[from] SpecError),
    /// The original control-plane error carried by the terminal event.
    #[error(transparent)]
    ControlPlane(anyhow::Error),
    #[error("{0}")]
    Failed(String),
    #[error("{0}")]
    TimedOut(String),
}

impl From<ReconcileError> for DeployError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::Failed { cause: Some(cause), .. } => {
                DeployError::ControlPlane(Arc::try_unwrap(cause).unwrap_or_else(|shared| anyhow!("{:#}", shared)))
            }
            ReconcileError::Failed { message, cause: None } => DeployError::Failed(message),
            ReconcileError::TimedOut { message } => DeployError::TimedOut(message),
            other @ ReconcileError::Incomplete => DeployError::Failed(other.to_string()),
        }
    }
}

/// Final object of a successful rollout.
#[derive(Debug, Clone)]
pub enum Deployed {
    Deployment(Box<Deployment>),
    Job(Box<Job>),
}

/// Event sequence of one operation, whichever workload type it drives.
pub enum Rollout {
    Deployment(Reconciliation<Deployment>),
    Job(Reconciliation<Job>),
}

impl Rollout {
    pub async fn next(&mut self) -> Option<AnyEvent> {
        match self {
            Rollout::Deployment(r) => r.next().await.map(AnyEvent::from),
            Rollout::Job(r) => r.next().await.map(AnyEvent::from),
        }
    }

    pub async fn wait(self) -> Result<Deployed, ReconcileError> {
        match self {
            Rollout::Deployment(r) => r.wait().await.map(|d| Deployed::Deployment(Box::new(d))),
            Rollout::Job(r) => r.wait().await.map(|j| Deployed::Job(Box::new(j))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Create,
    Patch,
    CreateOrUpgrade(UpgradeStrategy),
}

pub struct WorkloadController<A> {
    api: A,
    config: ControllerConfig,
}

impl<A> WorkloadController<A>
where
    A: WorkloadApi<Deployment> + WorkloadApi<Job>,
{
    pub fn new(api: A, config: ControllerConfig) -> Self {
        Self { api, config }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Create the workload and observe it until `timeout` elapses.
    pub async fn deploy(&self, spec: &WorkloadSpec, timeout: Duration) -> Rollout {
        self.dispatch(spec, timeout, Action::Create).await
    }

    /// Server-side apply the workload in place and observe the rollout.
    pub async fn upgrade(&self, spec: &WorkloadSpec, timeout: Duration) -> Rollout {
        self.dispatch(spec, timeout, Action::Patch).await
    }

    /// Create when absent, otherwise upgrade with `strategy`. Jobs are always recreated.
    pub async fn create_or_upgrade(&self, spec: &WorkloadSpec, timeout: Duration, strategy: UpgradeStrategy) -> Rollout {
        self.dispatch(spec, timeout, Action::CreateOrUpgrade(strategy)).await
    }

    /// [`Self::create_or_upgrade`] without the incremental events.
    pub async fn deploy_and_wait(&self, spec: &WorkloadSpec, timeout: Duration, strategy: UpgradeStrategy) -> Result<Deployed, DeployError> {
        spec.validate()?;
        let rollout = self.create_or_upgrade(spec, timeout, strategy).await;
        Ok(rollout.wait().await?)
    }

    /// Background delete; a missing object is not an error.
    pub async fn delete<W>(&self, namespace: &str, name: &str) -> Result<bool>
    where
        A: WorkloadApi<W>,
        W: Workload,
    {
        let deleted = WorkloadApi::<W>::delete(&self.api, namespace, name).await?;
        if deleted {
            info!(kind = %W::kind(&()), ns = %namespace, name = %name, "deleted");
        } else {
            info!(kind = %W::kind(&()), ns = %namespace, name = %name, "already absent");
        }
        Ok(deleted)
    }

    async fn dispatch(&self, spec: &WorkloadSpec, timeout: Duration, action: Action) -> Rollout {
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE);
        match spec.kind {
            WorkloadKind::Deployment { .. } => Rollout::Deployment(self.drive::<Deployment>(spec, deadline, action).await),
            WorkloadKind::Job { .. } => Rollout::Job(self.drive::<Job>(spec, deadline, action).await),
        }
    }

    async fn drive<W>(&self, spec: &WorkloadSpec, deadline: Instant, action: Action) -> Reconciliation<W>
    where
        A: WorkloadApi<W>,
        W: Manifest,
    {
        counter!("deploy_attempts", 1u64);
        let target = Target::new(&spec.namespace, &spec.name);
        let obj = match spec.validate().map_err(anyhow::Error::from).and_then(|_| W::manifest(spec)) {
            Ok(obj) => obj,
            Err(e) => {
                counter!("deploy_err", 1u64);
                return Reconciliation::failed(target, e);
            }
        };
        match tokio::time::timeout_at(deadline, self.apply(&obj, spec, action)).await {
            Ok(Ok(())) => Reconciliation::start(&self.api, target, deadline, self.config.reconcile.clone()).seeded_with(W::seed(spec)),
            Ok(Err(e)) => {
                counter!("deploy_err", 1u64);
                warn!(target_ns = %target.namespace, name = %target.name, error = %format!("{e:#}"), "control-plane call failed");
                Reconciliation::failed(target, e)
            }
            Err(_) => {
                warn!(target_ns = %target.namespace, name = %target.name, "deadline passed before the rollout could be observed");
                Reconciliation::expired(target).seeded_with(W::seed(spec))
            }
        }
    }

    async fn apply<W>(&self, obj: &W, spec: &WorkloadSpec, action: Action) -> Result<()>
    where
        A: WorkloadApi<W>,
        W: Manifest,
    {
        let (ns, name) = (spec.namespace.as_str(), spec.name.as_str());
        let strategy = match action {
            Action::Create => {
                WorkloadApi::<W>::create(&self.api, obj).await?;
                info!(kind = %W::kind(&()), ns = %ns, name = %name, "created");
                return Ok(());
            }
            Action::Patch => {
                WorkloadApi::<W>::patch(&self.api, obj).await?;
                info!(kind = %W::kind(&()), ns = %ns, name = %name, "patched");
                return Ok(());
            }
            Action::CreateOrUpgrade(_) if W::ALWAYS_RECREATE => UpgradeStrategy::Recreate,
            Action::CreateOrUpgrade(strategy) => strategy,
        };

        if WorkloadApi::<W>::get(&self.api, ns, name).await?.is_none() {
            WorkloadApi::<W>::create(&self.api, obj).await?;
            info!(kind = %W::kind(&()), ns = %ns, name = %name, "created");
            return Ok(());
        }
        match strategy {
            UpgradeStrategy::Rolling => {
                WorkloadApi::<W>::patch(&self.api, obj).await?;
                info!(kind = %W::kind(&()), ns = %ns, name = %name, "patched in place");
            }
            UpgradeStrategy::Recreate => {
                WorkloadApi::<W>::delete(&self.api, ns, name).await?;
                tokio::time::sleep(self.config.settle).await;
                self.await_removal::<W>(ns, name).await?;
                WorkloadApi::<W>::create(&self.api, obj).await?;
                info!(kind = %W::kind(&()), ns = %ns, name = %name, settle_ms = %self.config.settle.as_millis(), "recreated");
            }
        }
        Ok(())
    }

    /// Finalizers can keep a deleted object around; creating over it would fail.
    async fn await_removal<W>(&self, namespace: &str, name: &str) -> Result<()>
    where
        A: WorkloadApi<W>,
        W: Workload,
    {
        while WorkloadApi::<W>::get(&self.api, namespace, name).await?.is_some() {
            debug!(kind = %W::kind(&()), ns = %namespace, name = %name, "previous object still terminating");
            tokio::time::sleep(self.config.reconcile.poll_interval).await;
        }
        Ok(())
    }
}
