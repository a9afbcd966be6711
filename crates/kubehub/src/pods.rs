//! Pod watcher: maps pod and container state transitions to typed pod events.

use std::time::Duration;

use futures::{future, stream, Stream, StreamExt};
use k8s_openapi::api::core::v1::{ContainerState, ContainerStatus, Pod};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use metrics::counter;
use skipper_core::{Event, EventStatus, PodDetail, PodEvent};
use tracing::{debug, info, warn};

use crate::decode::{ChangeDecoder, ChangePhase, ResourceChange};
use crate::server_timeout;

/// Fixed diagnosis for binaries built for another CPU architecture.
pub const ARCH_MISMATCH_MESSAGE: &str = "Container failed to start with \"exec format error\": the image was built for a different CPU architecture than the cluster node. Rebuild the image for the node platform (e.g. --platform linux/amd64).";

const EXEC_FORMAT_ERROR: &str = "exec format error";

/// Waiting reasons that are part of a normal start.
const BENIGN_WAITING: &[&str] = &["ContainerCreating", "PodInitializing"];

/// Waiting reasons that will not resolve without intervention.
const CRASH_WAITING: &[&str] = &[
    "CrashLoopBackOff",
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
    "RunContainerError",
];

/// Watch pods matching `selector` in `namespace`.
pub fn watch_pods(client: Client, namespace: &str, selector: &str, timeout: Duration) -> impl Stream<Item = PodEvent> + Send + 'static {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let cfg = watcher::Config::default().labels(selector).timeout(server_timeout(timeout));
    info!(ns = %namespace, selector = %selector, "pod watcher started");
    pod_events(watcher::watcher(api, cfg))
}

/// Adapt any pod change stream into pod events. The first stream error is
/// logged and ends the sequence.
pub fn pod_events<S, E>(changes: S) -> impl Stream<Item = PodEvent> + Send
where
    S: Stream<Item = Result<watcher::Event<Pod>, E>> + Send,
    E: std::fmt::Display + Send,
{
    changes
        .scan(ChangeDecoder::<Pod>::default(), |decoder, res| {
            let out = match res {
                Ok(ev) => Some(decoder.decode(ev)),
                Err(e) => {
                    counter!("pod_watch_errors_total", 1u64);
                    warn!(error = %e, "pod watch failed; ending pod event stream");
                    None
                }
            };
            future::ready(out)
        })
        .flat_map(|changes| stream::iter(changes.iter().flat_map(pod_change_events).collect::<Vec<_>>()))
}

/// Translate one decoded pod change.
pub fn pod_change_events(change: &ResourceChange<Pod>) -> Vec<PodEvent> {
    let pod = &change.object;
    let name = pod.name_any();
    let statuses: Vec<&ContainerStatus> = pod
        .status
        .iter()
        .flat_map(|s| s.init_container_statuses.iter().flatten().chain(s.container_statuses.iter().flatten()))
        .collect();
    let containers = statuses.iter().filter_map(|cs| container_event(&name, cs));
    match change.phase {
        ChangePhase::Added => std::iter::once(Event::new(EventStatus::Progress, PodDetail::new(&name, "Added")))
            .chain(containers)
            .collect(),
        ChangePhase::Deleted => vec![Event::new(EventStatus::Progress, PodDetail::new(&name, "Deleted"))],
        ChangePhase::Modified if statuses.is_empty() => {
            let phase = pod.status.as_ref().and_then(|s| s.phase.clone()).unwrap_or_else(|| "Pending".to_string());
            vec![Event::new(EventStatus::Progress, PodDetail::new(&name, phase))]
        }
        ChangePhase::Modified => containers.collect(),
    }
}

fn container_event(pod: &str, cs: &ContainerStatus) -> Option<PodEvent> {
    let state = cs.state.as_ref()?;
    let raw = serde_json::to_value(state).ok();
    let detail = |phase: &str| PodDetail::new(pod, phase).with_container(&cs.name, raw.clone());

    if mentions_exec_format_error(state) || cs.last_state.as_ref().map(mentions_exec_format_error).unwrap_or(false) {
        debug!(pod = %pod, container = %cs.name, "exec format error detected");
        return Some(Event::new(EventStatus::Error, detail("ExecFormatError")).with_message(ARCH_MISMATCH_MESSAGE));
    }
    if let Some(w) = &state.waiting {
        let reason = w.reason.as_deref().unwrap_or("Waiting");
        let status = if CRASH_WAITING.contains(&reason) {
            EventStatus::Error
        } else {
            if !BENIGN_WAITING.contains(&reason) {
                debug!(pod = %pod, container = %cs.name, reason = %reason, "unrecognized waiting reason");
            }
            EventStatus::Progress
        };
        return Some(Event::new(status, detail(reason)).with_payload("restarts", cs.restart_count));
    }
    if state.running.is_some() {
        return Some(Event::new(EventStatus::Progress, detail("Running")));
    }
    if let Some(t) = &state.terminated {
        let status = if t.exit_code == 0 { EventStatus::Completed } else { EventStatus::Error };
        return Some(Event::new(status, detail("Terminated")).with_payload("exitCode", t.exit_code));
    }
    None
}

fn mentions_exec_format_error(state: &ContainerState) -> bool {
    let waiting = state.waiting.as_ref().and_then(|w| w.message.as_deref());
    let terminated = state.terminated.as_ref().and_then(|t| t.message.as_deref());
    [waiting, terminated].into_iter().flatten().any(|m| m.contains(EXEC_FORMAT_ERROR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(status: serde_json::Value) -> Pod {
        serde_json::from_value(json!({
            "metadata": { "name": "web-7d9f", "namespace": "ns", "uid": "u1" },
            "status": status,
        }))
        .unwrap()
    }

    fn with_container(state: serde_json::Value) -> Pod {
        pod(json!({
            "phase": "Pending",
            "containerStatuses": [{
                "name": "app", "image": "reg/web:1", "imageID": "", "ready": false,
                "restartCount": 3, "state": state
            }]
        }))
    }

    fn modified(p: Pod) -> Vec<PodEvent> {
        pod_change_events(&ResourceChange::new(ChangePhase::Modified, p))
    }

    #[test]
    fn add_and_remove_are_coarse_progress() {
        let added = pod_change_events(&ResourceChange::new(ChangePhase::Added, pod(json!({"phase": "Pending"}))));
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].status, EventStatus::Progress);
        assert_eq!(added[0].detail.phase, "Added");
        let deleted = pod_change_events(&ResourceChange::new(ChangePhase::Deleted, pod(json!({}))));
        assert_eq!(deleted[0].status, EventStatus::Progress);
        assert_eq!(deleted[0].message(), "Pod web-7d9f: Deleted");
    }

    #[test]
    fn benign_waiting_is_progress() {
        let ev = modified(with_container(json!({"waiting": {"reason": "ContainerCreating"}})));
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].status, EventStatus::Progress);
        assert_eq!(ev[0].message(), "Pod web-7d9f container app: ContainerCreating");
    }

    #[test]
    fn crash_waiting_is_error() {
        let ev = modified(with_container(json!({"waiting": {"reason": "ImagePullBackOff", "message": "Back-off pulling image \"reg/web:1\""}})));
        assert_eq!(ev[0].status, EventStatus::Error);
        assert_eq!(
            ev[0].message(),
            "Pod web-7d9f container app failed: ImagePullBackOff: Back-off pulling image \"reg/web:1\""
        );
        assert_eq!(ev[0].payload["restarts"], 3);
    }

    #[test]
    fn exec_format_error_maps_to_architecture_diagnosis() {
        let ev = modified(with_container(json!({
            "waiting": {"reason": "CrashLoopBackOff", "message": "exec /app/server: exec format error"}
        })));
        assert_eq!(ev[0].status, EventStatus::Error);
        assert_eq!(ev[0].message(), ARCH_MISMATCH_MESSAGE);
    }

    #[test]
    fn exec_format_error_in_last_state_is_detected() {
        let p = pod(json!({
            "containerStatuses": [{
                "name": "app", "image": "i", "imageID": "", "ready": false, "restartCount": 1,
                "state": {"waiting": {"reason": "CrashLoopBackOff", "message": "back-off 10s restarting failed container"}},
                "lastState": {"terminated": {"exitCode": 255, "reason": "Error", "message": "exec format error"}}
            }]
        }));
        assert_eq!(modified(p)[0].message(), ARCH_MISMATCH_MESSAGE);
    }

    #[test]
    fn running_and_terminated() {
        assert_eq!(modified(with_container(json!({"running": {}})))[0].status, EventStatus::Progress);
        let ok = modified(with_container(json!({"terminated": {"exitCode": 0, "reason": "Completed"}})));
        assert_eq!(ok[0].status, EventStatus::Completed);
        let bad = modified(with_container(json!({"terminated": {"exitCode": 137, "reason": "OOMKilled"}})));
        assert_eq!(bad[0].status, EventStatus::Error);
        assert_eq!(bad[0].message(), "Pod web-7d9f container app failed: exited with code 137 (OOMKilled)");
    }

    #[test]
    fn modified_without_containers_reports_pod_phase() {
        let ev = modified(pod(json!({"phase": "Pending"})));
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].detail.phase, "Pending");
        assert!(ev[0].detail.container.is_none());
    }

    #[tokio::test]
    async fn stream_error_ends_sequence_silently() {
        let items: Vec<Result<watcher::Event<Pod>, String>> = vec![
            Ok(watcher::Event::Applied(pod(json!({"phase": "Pending"})))),
            Err("connection reset".to_string()),
            Ok(watcher::Event::Applied(with_container(json!({"running": {}})))),
        ];
        let out: Vec<PodEvent> = pod_events(stream::iter(items)).collect().await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].detail.phase, "Added");
    }
}
