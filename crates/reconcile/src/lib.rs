//! Skipper reconcile: one session per operation, merging the pod and
//! resource watches of a single target into an ordered event sequence that
//! ends with exactly one terminal event.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::Resource;
use metrics::{counter, histogram};
use skipper_core::{Event, EventStatus, PodEvent, Target};
use skipper_kubehub::{ResourceChange, WatchSource};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub mod workload;

pub use workload::{Interpretation, Step, Workload};

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Upper bound on a single queue wait; also the deadline check granularity.
    pub poll_interval: Duration,
    pub queue_capacity: usize,
    /// Treat every ERROR as terminal.
    pub fail_fast: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(1), queue_capacity: 256, fail_fast: false }
    }
}

impl ReconcileConfig {
    /// Defaults overridden by `SKIPPER_POLL_MS`, `SKIPPER_QUEUE_CAP` and `SKIPPER_FAIL_FAST`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let poll_interval = std::env::var("SKIPPER_POLL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(d.poll_interval);
        let queue_capacity = std::env::var("SKIPPER_QUEUE_CAP")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(d.queue_capacity);
        let fail_fast = std::env::var("SKIPPER_FAIL_FAST")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(d.fail_fast);
        Self { poll_interval, queue_capacity, fail_fast }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    Running,
    Ready,
    Error,
    TimedOut,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("{message}")]
    Failed { message: String, cause: Option<Arc<anyhow::Error>> },
    #[error("{message}")]
    TimedOut { message: String },
    #[error("reconciliation ended without a terminal event")]
    Incomplete,
}

impl ReconcileError {
    /// Control-plane error carried by the terminal event, if any.
    pub fn cause(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            ReconcileError::Failed { cause, .. } => cause.as_ref(),
            _ => None,
        }
    }
}

enum WatchEvent<K> {
    Resource(ResourceChange<K>),
    Pod(PodEvent),
    Error(anyhow::Error),
}

/// A running reconciliation. Drive it with [`Reconciliation::next`] or
/// [`Reconciliation::wait`]; dropping it stops both watchers.
pub struct Reconciliation<W: Workload> {
    target: Target,
    deadline: Instant,
    started_at: Instant,
    config: ReconcileConfig,
    rx: mpsc::Receiver<WatchEvent<W>>,
    watchers: Vec<JoinHandle<()>>,
    state: ReconcileState,
    started: bool,
    queue_closed: bool,
    pending: VecDeque<Event<W::Detail>>,
    detail: W::Detail,
    outcome: Option<W>,
    terminal: Option<Event<W::Detail>>,
}

impl<W: Workload> Reconciliation<W> {
    /// Spawn the pod and resource watchers for `target` and return the session.
    pub fn start<S>(source: &S, target: Target, deadline: Instant, config: ReconcileConfig) -> Self
    where
        S: WatchSource<W> + ?Sized,
    {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let remaining = deadline.saturating_duration_since(Instant::now());
        let selector = W::pod_selector(&target.name);
        info!(target_ns = %target.namespace, name = %target.name, kind = %W::kind(&()), selector = %selector, "reconciliation started");

        let pods = source.pods(&target.namespace, &selector, remaining);
        let resource = source.resource(&target.namespace, &target.name, remaining);
        let pod_tx = tx.clone();
        let pod_task = tokio::spawn(async move {
            let mut pods = pods;
            while let Some(ev) = pods.next().await {
                if pod_tx.send(WatchEvent::Pod(ev)).await.is_err() {
                    break;
                }
            }
            debug!("pod watcher finished");
        });
        let resource_task = tokio::spawn(async move {
            let mut changes = resource;
            while let Some(res) = changes.next().await {
                let msg = match res {
                    Ok(change) => WatchEvent::Resource(change),
                    Err(e) => WatchEvent::Error(e),
                };
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            debug!("resource watcher finished");
        });

        let mut session = Self::idle(target, deadline, config, rx);
        session.watchers = vec![pod_task, resource_task];
        session
    }

    /// A session that could not start: STARTED followed by a terminal ERROR
    /// carrying `error`.
    pub fn failed(target: Target, error: anyhow::Error) -> Self {
        let (_tx, rx) = mpsc::channel(1);
        let mut session = Self::idle(target, Instant::now(), ReconcileConfig::default(), rx);
        session.started = true;
        session.queue_closed = true;
        let started = Event::new(EventStatus::Started, session.detail.clone());
        session.push(started, None);
        let err = Event::new(EventStatus::Error, session.detail.clone()).with_error(error);
        session.push(err, Some(ReconcileState::Error));
        session
    }

    /// A session whose deadline passed before the watches could start:
    /// STARTED followed by TIMEOUT.
    pub fn expired(target: Target) -> Self {
        let (_tx, rx) = mpsc::channel(1);
        let mut session = Self::idle(target, Instant::now(), ReconcileConfig::default(), rx);
        session.queue_closed = true;
        session
    }

    fn idle(target: Target, deadline: Instant, config: ReconcileConfig, rx: mpsc::Receiver<WatchEvent<W>>) -> Self {
        let detail = W::initial_detail(&target.name);
        Self {
            target,
            deadline,
            started_at: Instant::now(),
            config,
            rx,
            watchers: Vec::new(),
            state: ReconcileState::Running,
            started: false,
            queue_closed: false,
            pending: VecDeque::new(),
            detail,
            outcome: None,
            terminal: None,
        }
    }

    /// Replace the detail reported by STARTED and by events emitted before
    /// the first resource snapshot arrives.
    pub fn seeded_with(mut self, detail: W::Detail) -> Self {
        self.detail = detail;
        self
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn state(&self) -> ReconcileState {
        self.state
    }

    /// Final snapshot; set once the session reached READY.
    pub fn outcome(&self) -> Option<&W> {
        self.outcome.as_ref()
    }

    /// Next progress event, or `None` after the terminal one.
    pub async fn next(&mut self) -> Option<Event<W::Detail>> {
        if !self.started {
            self.started = true;
            let ev = Event::new(EventStatus::Started, self.detail.clone());
            self.push(ev, None);
        }
        loop {
            if let Some(ev) = self.pending.pop_front() {
                return Some(ev);
            }
            if self.state != ReconcileState::Running {
                return None;
            }
            let now = Instant::now();
            if now >= self.deadline {
                let ev = Event::new(EventStatus::Timeout, self.detail.clone());
                self.push(ev, Some(ReconcileState::TimedOut));
                continue;
            }
            let wait = self.config.poll_interval.min(self.deadline - now);
            if self.queue_closed {
                tokio::time::sleep(wait).await;
                continue;
            }
            match tokio::time::timeout(wait, self.rx.recv()).await {
                Err(_) => {}
                Ok(None) => {
                    debug!(name = %self.target.name, "both watchers ended; waiting for deadline");
                    self.queue_closed = true;
                }
                Ok(Some(msg)) => self.dispatch(msg),
            }
        }
    }

    /// Drain the sequence and return the final snapshot or the terminal failure.
    pub async fn wait(mut self) -> Result<W, ReconcileError> {
        while self.next().await.is_some() {}
        self.take_result()
    }

    fn take_result(&mut self) -> Result<W, ReconcileError> {
        let message = self.terminal.as_ref().map(|ev| ev.message().into_owned()).unwrap_or_default();
        match self.state {
            ReconcileState::Ready => self.outcome.take().ok_or(ReconcileError::Incomplete),
            ReconcileState::Error => {
                let cause = self.terminal.as_ref().and_then(|ev| ev.error().cloned());
                Err(ReconcileError::Failed { message, cause })
            }
            ReconcileState::TimedOut => Err(ReconcileError::TimedOut { message }),
            ReconcileState::Running => Err(ReconcileError::Incomplete),
        }
    }

    fn dispatch(&mut self, msg: WatchEvent<W>) {
        let fatal = |ev: &Event<W::Detail>, fail_fast: bool| {
            (fail_fast && ev.status == EventStatus::Error).then_some(ReconcileState::Error)
        };
        match msg {
            WatchEvent::Error(e) => {
                warn!(name = %self.target.name, error = %format!("{e:#}"), "watch error");
                let ev = Event::new(EventStatus::Error, self.detail.clone()).with_error(e);
                let terminal = fatal(&ev, self.config.fail_fast);
                self.push(ev, terminal);
            }
            WatchEvent::Pod(pod) => {
                let ev = match pod.status {
                    EventStatus::Error => Event::new(EventStatus::Error, self.detail.clone())
                        .with_message(pod.message().into_owned())
                        .with_payload("pod", pod.detail.pod.as_str()),
                    EventStatus::Progress => {
                        let mut ev = Event::new(EventStatus::Progress, W::with_phase(&self.detail, &pod.detail.phase))
                            .with_payload("pod", pod.detail.pod.as_str());
                        if let Some(c) = &pod.detail.container {
                            ev = ev.with_payload("container", c.as_str());
                        }
                        ev
                    }
                    other => {
                        debug!(pod = %pod.detail.pod, status = %other, "pod event not forwarded");
                        return;
                    }
                };
                let terminal = fatal(&ev, self.config.fail_fast);
                self.push(ev, terminal);
            }
            WatchEvent::Resource(change) => {
                let Interpretation { detail, events, step } = W::interpret(&change, &self.target.name);
                self.detail = detail;
                if step == Step::Ready {
                    self.outcome = Some(change.object);
                }
                let last = events.len().saturating_sub(1);
                for (i, ev) in events.into_iter().enumerate() {
                    let terminal = match step {
                        Step::Ready if i == last => Some(ReconcileState::Ready),
                        Step::Failed if i == last => Some(ReconcileState::Error),
                        _ => fatal(&ev, self.config.fail_fast),
                    };
                    self.push(ev, terminal);
                }
            }
        }
    }

    fn push(&mut self, ev: Event<W::Detail>, terminal: Option<ReconcileState>) {
        if self.terminal.is_some() {
            return;
        }
        counter!("reconcile_events_total", 1u64, "status" => ev.status.as_str());
        if let Some(state) = terminal {
            let took = self.started_at.elapsed();
            self.state = state;
            self.terminal = Some(ev.clone());
            if state != ReconcileState::Ready {
                self.outcome = None;
            }
            self.stop_watchers();
            histogram!("reconcile_duration_ms", took.as_secs_f64() * 1000.0);
            if state == ReconcileState::TimedOut {
                counter!("reconcile_timeouts_total", 1u64);
            }
            info!(name = %self.target.name, state = ?state, took_ms = %took.as_millis(), message = %ev.message(), "reconciliation finished");
        }
        self.pending.push_back(ev);
    }

    fn stop_watchers(&mut self) {
        for task in self.watchers.drain(..) {
            task.abort();
        }
        self.rx.close();
    }
}

impl<W: Workload> Drop for Reconciliation<W> {
    fn drop(&mut self) {
        self.stop_watchers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let c = ReconcileConfig::default();
        assert_eq!(c.poll_interval, Duration::from_secs(1));
        assert_eq!(c.queue_capacity, 256);
        assert!(!c.fail_fast);
    }
}
