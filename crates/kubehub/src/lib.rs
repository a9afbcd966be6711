//! Skipper kubehub: client wiring and the two watch streams a reconciliation
//! consumes (pods selected by label, one resource selected by name).

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use skipper_core::PodEvent;
use tokio::sync::OnceCell;

pub mod decode;
pub mod pods;
pub mod resource;

pub use decode::{ChangeDecoder, ChangePhase, ResourceChange};
pub use pods::{pod_change_events, pod_events, watch_pods, ARCH_MISMATCH_MESSAGE};
pub use resource::{resource_changes, watch_resource};

/// The API server rejects watch timeouts at or above 295s.
const MAX_WATCH_TIMEOUT_SECS: u64 = 290;

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Shared client built from the ambient kubeconfig / in-cluster config.
pub async fn get_kube_client() -> Result<Client> {
    CLIENT
        .get_or_try_init(|| async { Client::try_default().await.context("building kube client") })
        .await
        .cloned()
}

/// Server-side watch timeout for a remaining deadline.
pub fn server_timeout(remaining: Duration) -> u32 {
    remaining.as_secs().clamp(1, MAX_WATCH_TIMEOUT_SECS) as u32
}

/// Producer side of a reconciliation: where pod and resource changes come from.
pub trait WatchSource<K>: Send + Sync {
    /// Pod events for pods matching `selector`. Ends silently on stream failure.
    fn pods(&self, namespace: &str, selector: &str, timeout: Duration) -> BoxStream<'static, PodEvent>;

    /// Changes of the single resource `name`. A failure is yielded once, then the stream ends.
    fn resource(&self, namespace: &str, name: &str, timeout: Duration) -> BoxStream<'static, Result<ResourceChange<K>>>;
}

/// Watch source backed by the kube runtime watcher.
#[derive(Clone)]
pub struct KubeWatchSource {
    client: Client,
}

impl KubeWatchSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(get_kube_client().await?))
    }
}

impl<K> WatchSource<K> for KubeWatchSource
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn pods(&self, namespace: &str, selector: &str, timeout: Duration) -> BoxStream<'static, PodEvent> {
        watch_pods(self.client.clone(), namespace, selector, timeout).boxed()
    }

    fn resource(&self, namespace: &str, name: &str, timeout: Duration) -> BoxStream<'static, Result<ResourceChange<K>>> {
        watch_resource::<K>(self.client.clone(), namespace, name, timeout).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_timeout_is_clamped() {
        assert_eq!(server_timeout(Duration::from_millis(200)), 1);
        assert_eq!(server_timeout(Duration::from_secs(60)), 60);
        assert_eq!(server_timeout(Duration::from_secs(3600)), 290);
    }
}
