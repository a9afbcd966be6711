//! Control-plane access for the controller.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use skipper_core::{PodEvent, FIELD_MANAGER};
use skipper_kubehub::{KubeWatchSource, ResourceChange, WatchSource};
use skipper_reconcile::Workload;
use tracing::debug;

/// Create/patch/delete for one workload type, plus the watches a
/// reconciliation needs.
#[async_trait]
pub trait WorkloadApi<W: Workload>: WatchSource<W> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<W>>;

    async fn create(&self, obj: &W) -> Result<W>;

    /// Server-side apply of the full object.
    async fn patch(&self, obj: &W) -> Result<W>;

    /// Background delete: the object goes at once, its pods are collected
    /// afterwards. `Ok(false)` when the object was already gone.
    async fn delete(&self, namespace: &str, name: &str) -> Result<bool>;
}

#[derive(Clone)]
pub struct KubeWorkloadApi {
    client: Client,
    watch: KubeWatchSource,
}

impl KubeWorkloadApi {
    pub fn new(client: Client) -> Self {
        Self { watch: KubeWatchSource::new(client.clone()), client }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(skipper_kubehub::get_kube_client().await?))
    }

    fn api<W: Workload>(&self, namespace: &str) -> Api<W> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn located<W: Workload>(obj: &W) -> Result<(String, String)> {
    let name = obj.meta().name.clone().ok_or_else(|| anyhow!("{} has no metadata.name", W::kind(&())))?;
    Ok((obj.namespace().unwrap_or_else(|| "default".to_string()), name))
}

impl<W: Workload> WatchSource<W> for KubeWorkloadApi {
    fn pods(&self, namespace: &str, selector: &str, timeout: Duration) -> BoxStream<'static, PodEvent> {
        WatchSource::<W>::pods(&self.watch, namespace, selector, timeout)
    }

    fn resource(&self, namespace: &str, name: &str, timeout: Duration) -> BoxStream<'static, Result<ResourceChange<W>>> {
        WatchSource::<W>::resource(&self.watch, namespace, name, timeout)
    }
}

#[async_trait]
impl<W: Workload> WorkloadApi<W> for KubeWorkloadApi {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<W>> {
        self.api::<W>(namespace)
            .get_opt(name)
            .await
            .with_context(|| format!("reading {} {}/{}", W::kind(&()), namespace, name))
    }

    async fn create(&self, obj: &W) -> Result<W> {
        let (ns, name) = located(obj)?;
        let pp = PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        debug!(kind = %W::kind(&()), ns = %ns, name = %name, "create");
        self.api::<W>(&ns)
            .create(&pp, obj)
            .await
            .with_context(|| format!("creating {} {}/{}", W::kind(&()), ns, name))
    }

    async fn patch(&self, obj: &W) -> Result<W> {
        let (ns, name) = located(obj)?;
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        debug!(kind = %W::kind(&()), ns = %ns, name = %name, "server-side apply");
        self.api::<W>(&ns)
            .patch(&name, &pp, &Patch::Apply(obj))
            .await
            .with_context(|| format!("patching {} {}/{}", W::kind(&()), ns, name))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool> {
        match self.api::<W>(namespace).delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(e).with_context(|| format!("deleting {} {}/{}", W::kind(&()), namespace, name)),
        }
    }
}
