//! Per-resource interpretation of resource snapshots.

use std::fmt::Debug;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::{de::DeserializeOwned, Serialize};
use skipper_core::{DeploymentDetail, Event, EventDetail, EventStatus, JobDetail, WORKLOAD_LABEL};
use skipper_kubehub::{ChangePhase, ResourceChange};

/// What a snapshot means for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// The last event of the interpretation completes the session.
    Ready,
    /// The last event of the interpretation fails the session.
    Failed,
}

#[derive(Debug, Clone)]
pub struct Interpretation<D> {
    pub detail: D,
    pub events: Vec<Event<D>>,
    pub step: Step,
}

/// A cluster resource the manager knows how to drive to a terminal state.
pub trait Workload:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Detail: EventDetail;

    /// Counters read from an object; also seeds a session from a payload.
    fn detail(obj: &Self, name: &str) -> Self::Detail;

    fn initial_detail(name: &str) -> Self::Detail;

    /// Label selector for the pods this resource owns.
    fn pod_selector(name: &str) -> String;

    /// Parent-vocabulary copy of `detail` carrying a pod phase.
    fn with_phase(detail: &Self::Detail, phase: &str) -> Self::Detail;

    fn interpret(change: &ResourceChange<Self>, name: &str) -> Interpretation<Self::Detail>;
}

fn rolled_out(d: &Deployment, desired: i32) -> bool {
    let status = d.status.as_ref();
    let generation_seen = match (d.metadata.generation, status.and_then(|s| s.observed_generation)) {
        (Some(generation), Some(observed)) => observed >= generation,
        _ => true,
    };
    let updated = status.and_then(|s| s.updated_replicas).map(|u| u == desired).unwrap_or(true);
    // Pods of the previous revision still count towards `replicas` until they terminate.
    let no_old_pods = match status.map(|s| (s.replicas, s.updated_replicas)) {
        Some((Some(total), Some(updated))) => total <= updated,
        _ => true,
    };
    generation_seen && updated && no_old_pods
}

impl Workload for Deployment {
    type Detail = DeploymentDetail;

    fn detail(obj: &Self, name: &str) -> DeploymentDetail {
        let desired = obj.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let status = obj.status.as_ref();
        DeploymentDetail {
            name: name.to_string(),
            desired,
            available: status.and_then(|s| s.available_replicas).unwrap_or(0),
            ready: status.and_then(|s| s.ready_replicas).unwrap_or(0),
            phase: None,
        }
    }

    fn initial_detail(name: &str) -> DeploymentDetail {
        DeploymentDetail::new(name, 0)
    }

    fn pod_selector(name: &str) -> String {
        format!("{}={}", WORKLOAD_LABEL, name)
    }

    fn with_phase(detail: &DeploymentDetail, phase: &str) -> DeploymentDetail {
        DeploymentDetail { phase: Some(phase.to_string()), ..detail.clone() }
    }

    fn interpret(change: &ResourceChange<Self>, name: &str) -> Interpretation<DeploymentDetail> {
        let detail = Self::detail(&change.object, name);
        if change.phase == ChangePhase::Deleted {
            let ev = Event::new(EventStatus::Error, detail.clone())
                .with_message(format!("Deployment {} was deleted before becoming ready", name));
            return Interpretation { detail, events: vec![ev], step: Step::Failed };
        }

        let mut events = Vec::new();
        let conditions = change.object.status.as_ref().and_then(|s| s.conditions.as_ref());
        for c in conditions.into_iter().flatten() {
            let why = c.message.as_deref().or(c.reason.as_deref()).unwrap_or("no reason reported");
            let message = match (c.type_.as_str(), c.status.as_str()) {
                ("Progressing", "False") => format!("Deployment {} is not progressing: {}", name, why),
                ("ReplicaFailure", "True") => format!("Deployment {} replica failure: {}", name, why),
                _ => continue,
            };
            let mut ev = Event::new(EventStatus::Error, detail.clone()).with_message(message);
            if let Some(reason) = &c.reason {
                ev = ev.with_payload("reason", reason.as_str());
            }
            events.push(ev);
        }

        let (desired, available, ready) = (detail.desired, detail.available, detail.ready);
        let step = if ready == available && available == desired && rolled_out(&change.object, desired) {
            events.push(Event::new(EventStatus::Completed, detail.clone()));
            Step::Ready
        } else if available == 0 {
            events.push(Event::new(EventStatus::Waiting, detail.clone()));
            Step::Continue
        } else if ready == available && available == desired {
            let waiting = Self::with_phase(&detail, "waiting for the new revision to roll out");
            events.push(Event::new(EventStatus::Progress, waiting));
            Step::Continue
        } else {
            events.push(Event::new(EventStatus::Progress, detail.clone()));
            Step::Continue
        };
        Interpretation { detail, events, step }
    }
}

impl Workload for Job {
    type Detail = JobDetail;

    fn detail(obj: &Self, name: &str) -> JobDetail {
        let status = obj.status.as_ref();
        JobDetail {
            name: name.to_string(),
            active: status.and_then(|s| s.active).unwrap_or(0),
            succeeded: status.and_then(|s| s.succeeded).unwrap_or(0),
            failed: status.and_then(|s| s.failed).unwrap_or(0),
            phase: None,
        }
    }

    fn initial_detail(name: &str) -> JobDetail {
        JobDetail::new(name)
    }

    fn pod_selector(name: &str) -> String {
        format!("job-name={}", name)
    }

    fn with_phase(detail: &JobDetail, phase: &str) -> JobDetail {
        JobDetail { phase: Some(phase.to_string()), ..detail.clone() }
    }

    fn interpret(change: &ResourceChange<Self>, name: &str) -> Interpretation<JobDetail> {
        let detail = Self::detail(&change.object, name);
        let (ev, step) = if change.phase == ChangePhase::Deleted {
            let ev = Event::new(EventStatus::Error, detail.clone())
                .with_message(format!("Job {} was deleted before completing", name));
            (ev, Step::Failed)
        } else if detail.succeeded > 0 {
            (Event::new(EventStatus::Completed, detail.clone()), Step::Ready)
        } else if detail.failed > 0 {
            let failed_condition = change
                .object
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .and_then(|cs| cs.iter().find(|c| c.type_ == "Failed" && c.status == "True"))
                .and_then(|c| c.message.clone().or_else(|| c.reason.clone()));
            let mut ev = Event::new(EventStatus::Error, detail.clone());
            if let Some(why) = failed_condition {
                ev = ev.with_message(format!("Job {} failed: {}", name, why));
            }
            (ev, Step::Failed)
        } else {
            (Event::new(EventStatus::Progress, detail.clone()), Step::Continue)
        };
        Interpretation { detail, events: vec![ev], step }
    }
}
