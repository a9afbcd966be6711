//! Resource watcher: raw (phase, snapshot) changes of one named object.
//! Interpretation is left to the consumer so Deployments and Jobs share it.

use std::fmt::Debug;
use std::time::Duration;

use anyhow::Result;
use futures::{future, stream, Stream, StreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::watcher;
use kube::{Api, Client, Resource};
use metrics::counter;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::decode::{ChangeDecoder, ResourceChange};
use crate::server_timeout;

/// Watch the single resource `name` in `namespace`.
pub fn watch_resource<K>(client: Client, namespace: &str, name: &str, timeout: Duration) -> impl Stream<Item = Result<ResourceChange<K>>> + Send + 'static
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let kind = K::kind(&()).to_string();
    let api: Api<K> = Api::namespaced(client, namespace);
    let cfg = watcher::Config::default()
        .fields(&format!("metadata.name={}", name))
        .timeout(server_timeout(timeout));
    info!(kind = %kind, ns = %namespace, name = %name, "resource watcher started");
    let target = format!("{} {}/{}", kind, namespace, name);
    resource_changes(watcher::watcher(api, cfg)).map(move |res| {
        res.map_err(|e| {
            counter!("resource_watch_errors_total", 1u64);
            warn!(resource = %target, error = %e, "resource watch failed");
            anyhow::Error::new(e).context(format!("watching {}", target))
        })
    })
}

/// Decode a resource change stream. The first error is passed through and
/// then the stream ends; the watch is not resumed.
pub fn resource_changes<K, S, E>(changes: S) -> impl Stream<Item = Result<ResourceChange<K>, E>> + Send
where
    K: Resource + Clone + Send,
    S: Stream<Item = Result<watcher::Event<K>, E>> + Send,
    E: Send,
{
    changes
        .scan((ChangeDecoder::<K>::default(), false), |(decoder, failed), res| {
            if *failed {
                return future::ready(None);
            }
            let out: Vec<Result<ResourceChange<K>, E>> = match res {
                Ok(ev) => decoder.decode(ev).into_iter().map(Ok).collect(),
                Err(e) => {
                    *failed = true;
                    vec![Err(e)]
                }
            };
            future::ready(Some(out))
        })
        .flat_map(stream::iter)
}
