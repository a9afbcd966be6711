//! Typed progress events.
//!
//! Every event carries a status, a timestamp, a free-form payload and the
//! family-specific detail fields. The human message is either supplied at
//! construction (and then never recomputed) or derived on read from
//! `(status, detail, error)`.
//!
//! Families are a closed set, so (de)serialization dispatches through
//! [`AnyEvent`] with an exhaustive match instead of a runtime registry.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value as Json};

pub const DEPLOYMENT: &str = "deployment";
pub const JOB: &str = "job";
pub const BUILD: &str = "build";
pub const POD: &str = "pod";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Started,
    Progress,
    Waiting,
    Completed,
    Error,
    Timeout,
}

impl EventStatus {
    /// Statuses that can end a session. ERROR only ends it when the failure is
    /// fatal; follow `Reconciliation::state()` to know whether more events come.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Error | EventStatus::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Started => "STARTED",
            EventStatus::Progress => "PROGRESS",
            EventStatus::Waiting => "WAITING",
            EventStatus::Completed => "COMPLETED",
            EventStatus::Error => "ERROR",
            EventStatus::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
    #[error("event type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: &'static str, found: String },
    #[error("invalid fields for {kind} event: {source}")]
    InvalidFields {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Family-specific fields of an event.
pub trait EventDetail: Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Transport tag written into [`EventRecord::kind`].
    const TYPE: &'static str;

    /// Pure rendering of the message for events built without an explicit one.
    fn format_message(&self, status: EventStatus, error: Option<&anyhow::Error>) -> String;
}

#[derive(Debug, Clone)]
pub struct Event<D> {
    pub status: EventStatus,
    pub timestamp: DateTime<Utc>,
    pub payload: Map<String, Json>,
    pub detail: D,
    error: Option<Arc<anyhow::Error>>,
    message: Option<String>,
}

impl<D: EventDetail> Event<D> {
    pub fn new(status: EventStatus, detail: D) -> Self {
        Self { status, timestamp: Utc::now(), payload: Map::new(), detail, error: None, message: None }
    }

    /// Pin the message; it will be returned verbatim from now on.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(self, error: anyhow::Error) -> Self {
        self.with_shared_error(Arc::new(error))
    }

    pub fn with_shared_error(mut self, error: Arc<anyhow::Error>) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<Json>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn message(&self) -> Cow<'_, str> {
        match &self.message {
            Some(m) => Cow::Borrowed(m.as_str()),
            None => Cow::Owned(self.detail.format_message(self.status, self.error.as_deref())),
        }
    }

    pub fn has_explicit_message(&self) -> bool {
        self.message.is_some()
    }

    pub fn error(&self) -> Option<&Arc<anyhow::Error>> {
        self.error.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Flatten into a transport record. The message is captured here, so a
    /// derived message survives the round trip unchanged.
    pub fn to_record(&self) -> Result<EventRecord, EventError> {
        let fields = match serde_json::to_value(&self.detail) {
            Ok(Json::Object(map)) => map,
            Ok(_) => Map::new(),
            Err(source) => return Err(EventError::InvalidFields { kind: D::TYPE, source }),
        };
        Ok(EventRecord {
            kind: D::TYPE.to_string(),
            status: self.status,
            timestamp: self.timestamp,
            message: self.message().into_owned(),
            payload: self.payload.clone(),
            fields,
        })
    }

    pub fn from_record(record: EventRecord) -> Result<Self, EventError> {
        if record.kind != D::TYPE {
            return Err(EventError::TypeMismatch { expected: D::TYPE, found: record.kind });
        }
        let detail: D = serde_json::from_value(Json::Object(record.fields))
            .map_err(|source| EventError::InvalidFields { kind: D::TYPE, source })?;
        Ok(Self {
            status: record.status,
            timestamp: record.timestamp,
            payload: record.payload,
            detail,
            error: None,
            message: Some(record.message),
        })
    }
}

/// Flat transport form of an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: EventStatus,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default)]
    pub payload: Map<String, Json>,
    #[serde(default)]
    pub fields: Map<String, Json>,
}

// ---- families ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentDetail {
    pub name: String,
    pub desired: i32,
    pub available: i32,
    pub ready: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl DeploymentDetail {
    pub fn new(name: impl Into<String>, desired: i32) -> Self {
        Self { name: name.into(), desired, available: 0, ready: 0, phase: None }
    }
}

impl EventDetail for DeploymentDetail {
    const TYPE: &'static str = DEPLOYMENT;

    fn format_message(&self, status: EventStatus, error: Option<&anyhow::Error>) -> String {
        let n = &self.name;
        let (a, r, d) = (self.available, self.ready, self.desired);
        match status {
            EventStatus::Started if d > 0 => format!("Deploying {n} ({d} desired replicas)"),
            EventStatus::Started => format!("Deploying {n}"),
            EventStatus::Waiting => format!("Waiting for {n}: no replicas available yet (0/{d})"),
            EventStatus::Progress => match &self.phase {
                Some(p) => format!("{n}: {p}"),
                None => format!("{n}: {a}/{d} replicas available, {r}/{d} ready"),
            },
            EventStatus::Completed => format!("{n} is ready: {r}/{d} replicas available"),
            EventStatus::Error => match error {
                Some(e) => format!("{n} failed: {e:#}"),
                None => format!("{n} failed"),
            },
            EventStatus::Timeout => format!("Timed out waiting for {n} ({a}/{d} available, {r}/{d} ready)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDetail {
    pub name: String,
    pub active: i32,
    pub succeeded: i32,
    pub failed: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl JobDetail {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), active: 0, succeeded: 0, failed: 0, phase: None }
    }
}

impl EventDetail for JobDetail {
    const TYPE: &'static str = JOB;

    fn format_message(&self, status: EventStatus, error: Option<&anyhow::Error>) -> String {
        let n = &self.name;
        match status {
            EventStatus::Started => format!("Starting job {n}"),
            EventStatus::Waiting => format!("Waiting for job {n} to be scheduled"),
            EventStatus::Progress => match &self.phase {
                Some(p) => format!("Job {n}: {p}"),
                None if self.active > 0 => format!("Job {n} running ({} active pods)", self.active),
                None => format!("Job {n} is preparing"),
            },
            EventStatus::Completed => format!("Job {n} completed ({} succeeded)", self.succeeded),
            EventStatus::Error => match error {
                Some(e) => format!("Job {n} failed: {e:#}"),
                None => format!("Job {n} failed ({} failed pods)", self.failed),
            },
            EventStatus::Timeout => format!("Timed out waiting for job {n}"),
        }
    }
}

/// Build sub-step vocabulary; builds are produced elsewhere but share the stream shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDetail {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

impl EventDetail for BuildDetail {
    const TYPE: &'static str = BUILD;

    fn format_message(&self, status: EventStatus, error: Option<&anyhow::Error>) -> String {
        let n = &self.name;
        let target = self.image.as_deref().unwrap_or(n);
        match status {
            EventStatus::Started => format!("Building {target}"),
            EventStatus::Waiting => format!("Build {n} queued"),
            EventStatus::Progress => match &self.step {
                Some(s) => format!("Build {n}: {s}"),
                None => format!("Building {target}"),
            },
            EventStatus::Completed => format!("Built {target}"),
            EventStatus::Error => match error {
                Some(e) => format!("Build {n} failed: {e:#}"),
                None => format!("Build {n} failed"),
            },
            EventStatus::Timeout => format!("Timed out building {target}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodDetail {
    pub pod: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// Short label: pod phase, waiting reason, `Running`, `Terminated`...
    pub phase: String,
    /// Raw container state as reported by the kubelet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Json>,
}

impl PodDetail {
    pub fn new(pod: impl Into<String>, phase: impl Into<String>) -> Self {
        Self { pod: pod.into(), container: None, phase: phase.into(), state: None }
    }

    pub fn with_container(mut self, container: impl Into<String>, state: Option<Json>) -> Self {
        self.container = Some(container.into());
        self.state = state;
        self
    }

    fn subject(&self) -> String {
        match &self.container {
            Some(c) => format!("Pod {} container {}", self.pod, c),
            None => format!("Pod {}", self.pod),
        }
    }

    fn state_summary(&self) -> Option<String> {
        let state = self.state.as_ref()?;
        if let Some(w) = state.get("waiting") {
            let reason = w.get("reason").and_then(|v| v.as_str()).unwrap_or("Waiting");
            return Some(match w.get("message").and_then(|v| v.as_str()) {
                Some(m) => format!("{reason}: {m}"),
                None => reason.to_string(),
            });
        }
        if let Some(t) = state.get("terminated") {
            let code = t.get("exitCode").and_then(|v| v.as_i64()).unwrap_or_default();
            return Some(match t.get("reason").and_then(|v| v.as_str()) {
                Some(r) => format!("exited with code {code} ({r})"),
                None => format!("exited with code {code}"),
            });
        }
        None
    }
}

impl EventDetail for PodDetail {
    const TYPE: &'static str = POD;

    fn format_message(&self, status: EventStatus, error: Option<&anyhow::Error>) -> String {
        let subject = self.subject();
        match status {
            EventStatus::Started => format!("{subject} started"),
            EventStatus::Waiting => format!("{subject} waiting"),
            EventStatus::Progress => format!("{subject}: {}", self.phase),
            EventStatus::Completed => format!("{subject} completed"),
            EventStatus::Error => match (error, self.state_summary()) {
                (Some(e), _) => format!("{subject}: {e:#}"),
                (None, Some(s)) => format!("{subject} failed: {s}"),
                (None, None) => format!("{subject} failed: {}", self.phase),
            },
            EventStatus::Timeout => format!("Timed out watching {subject}"),
        }
    }
}

pub type DeploymentEvent = Event<DeploymentDetail>;
pub type JobEvent = Event<JobDetail>;
pub type BuildEvent = Event<BuildDetail>;
pub type PodEvent = Event<PodDetail>;

/// Any event family; the unit of serialization and of mixed build/deploy streams.
#[derive(Debug, Clone)]
pub enum AnyEvent {
    Deployment(DeploymentEvent),
    Job(JobEvent),
    Build(BuildEvent),
    Pod(PodEvent),
}

macro_rules! each {
    ($self:expr, $e:ident => $body:expr) => {
        match $self {
            AnyEvent::Deployment($e) => $body,
            AnyEvent::Job($e) => $body,
            AnyEvent::Build($e) => $body,
            AnyEvent::Pod($e) => $body,
        }
    };
}

impl AnyEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AnyEvent::Deployment(_) => DEPLOYMENT,
            AnyEvent::Job(_) => JOB,
            AnyEvent::Build(_) => BUILD,
            AnyEvent::Pod(_) => POD,
        }
    }

    pub fn status(&self) -> EventStatus {
        each!(self, e => e.status)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        each!(self, e => e.timestamp)
    }

    pub fn payload(&self) -> &Map<String, Json> {
        each!(self, e => &e.payload)
    }

    pub fn message(&self) -> Cow<'_, str> {
        each!(self, e => e.message())
    }

    pub fn error(&self) -> Option<&Arc<anyhow::Error>> {
        each!(self, e => e.error())
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn serialize(&self) -> Result<EventRecord, EventError> {
        each!(self, e => e.to_record())
    }

    pub fn deserialize(record: EventRecord) -> Result<Self, EventError> {
        match record.kind.as_str() {
            DEPLOYMENT => Event::from_record(record).map(AnyEvent::Deployment),
            JOB => Event::from_record(record).map(AnyEvent::Job),
            BUILD => Event::from_record(record).map(AnyEvent::Build),
            POD => Event::from_record(record).map(AnyEvent::Pod),
            _ => Err(EventError::UnknownEventType(record.kind)),
        }
    }
}

impl From<DeploymentEvent> for AnyEvent {
    fn from(e: DeploymentEvent) -> Self {
        AnyEvent::Deployment(e)
    }
}

impl From<JobEvent> for AnyEvent {
    fn from(e: JobEvent) -> Self {
        AnyEvent::Job(e)
    }
}

impl From<BuildEvent> for AnyEvent {
    fn from(e: BuildEvent) -> Self {
        AnyEvent::Build(e)
    }
}

impl From<PodEvent> for AnyEvent {
    fn from(e: PodEvent) -> Self {
        AnyEvent::Pod(e)
    }
}
