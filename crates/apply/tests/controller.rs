use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use serde_json::{json, Value as Json};
use skipper_apply::{ControllerConfig, DeployError, Deployed, Rollout, UpgradeStrategy, WorkloadApi, WorkloadController};
use skipper_core::{AnyEvent, EventStatus, PodEvent, SpecError, WorkloadKind, WorkloadSpec};
use skipper_kubehub::{ChangePhase, ResourceChange, WatchSource};
use skipper_reconcile::{ReconcileConfig, Workload};

type Key = (String, String, String);

/// In-memory control plane. Stored objects get a status that is either
/// fully ready or empty. With `linger` set, a deleted object stays visible
/// for that many reads, the way a finalizer holds it on a real server.
#[derive(Default)]
struct MemoryCluster {
    objects: Mutex<HashMap<Key, Json>>,
    terminating: Mutex<HashMap<Key, usize>>,
    linger: AtomicUsize,
    calls: Mutex<Vec<String>>,
    never_ready: AtomicBool,
    fail_create: Mutex<Option<String>>,
    uids: AtomicUsize,
}

impl MemoryCluster {
    fn key<W: Workload>(ns: &str, name: &str) -> Key {
        (W::kind(&()).to_string(), ns.to_string(), name.to_string())
    }

    fn record<W: Workload>(&self, verb: &str, ns: &str, name: &str) {
        self.calls.lock().unwrap().push(format!("{} {} {}/{}", verb, W::kind(&()), ns, name));
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn lookup<W: Workload>(&self, ns: &str, name: &str) -> Option<W> {
        let objects = self.objects.lock().unwrap();
        objects.get(&Self::key::<W>(ns, name)).map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    fn store<W: Workload>(&self, obj: &W) -> W {
        let mut v = serde_json::to_value(obj).unwrap();
        let replicas = v["spec"]["replicas"].as_i64().unwrap_or(1);
        let ready = !self.never_ready.load(Ordering::SeqCst);
        v["status"] = match (W::kind(&()).as_ref(), ready) {
            ("Deployment", true) => json!({
                "replicas": replicas, "availableReplicas": replicas, "readyReplicas": replicas, "updatedReplicas": replicas
            }),
            ("Job", true) => json!({ "succeeded": 1 }),
            _ => json!({}),
        };
        v["metadata"]["uid"] = json!(format!("uid-{}", self.uids.fetch_add(1, Ordering::SeqCst)));
        let ns = obj.meta().namespace.clone().unwrap_or_default();
        let name = obj.meta().name.clone().unwrap_or_default();
        self.objects.lock().unwrap().insert(Self::key::<W>(&ns, &name), v.clone());
        serde_json::from_value(v).unwrap()
    }
}

impl<W: Workload> WatchSource<W> for MemoryCluster {
    fn pods(&self, _namespace: &str, _selector: &str, _timeout: Duration) -> BoxStream<'static, PodEvent> {
        stream::empty().boxed()
    }

    fn resource(&self, namespace: &str, name: &str, _timeout: Duration) -> BoxStream<'static, Result<ResourceChange<W>>> {
        let current: Vec<Result<ResourceChange<W>>> = self
            .lookup::<W>(namespace, name)
            .map(|obj| Ok(ResourceChange::new(ChangePhase::Modified, obj)))
            .into_iter()
            .collect();
        stream::iter(current).chain(stream::pending()).boxed()
    }
}

#[async_trait]
impl<W: Workload> WorkloadApi<W> for MemoryCluster {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<W>> {
        self.record::<W>("get", namespace, name);
        let key = Self::key::<W>(namespace, name);
        let mut terminating = self.terminating.lock().unwrap();
        match terminating.get_mut(&key) {
            Some(0) => {
                terminating.remove(&key);
                self.objects.lock().unwrap().remove(&key);
            }
            Some(reads) => *reads -= 1,
            None => {}
        }
        Ok(self.lookup(namespace, name))
    }

    async fn create(&self, obj: &W) -> Result<W> {
        let ns = obj.meta().namespace.clone().unwrap_or_default();
        let name = obj.meta().name.clone().unwrap_or_default();
        self.record::<W>("create", &ns, &name);
        if let Some(msg) = self.fail_create.lock().unwrap().clone() {
            return Err(anyhow!(msg));
        }
        if self.lookup::<W>(&ns, &name).is_some() {
            return Err(anyhow!("{} {} already exists", W::kind(&()), name));
        }
        Ok(self.store(obj))
    }

    async fn patch(&self, obj: &W) -> Result<W> {
        let ns = obj.meta().namespace.clone().unwrap_or_default();
        let name = obj.meta().name.clone().unwrap_or_default();
        self.record::<W>("patch", &ns, &name);
        Ok(self.store(obj))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool> {
        self.record::<W>("delete", namespace, name);
        let key = Self::key::<W>(namespace, name);
        let linger = self.linger.load(Ordering::SeqCst);
        let mut objects = self.objects.lock().unwrap();
        if linger == 0 || !objects.contains_key(&key) {
            return Ok(objects.remove(&key).is_some());
        }
        if let Some(obj) = objects.get_mut(&key) {
            obj["metadata"]["deletionTimestamp"] = json!("2026-01-01T00:00:00Z");
        }
        self.terminating.lock().unwrap().insert(key, linger);
        Ok(true)
    }
}

fn config(settle: Duration) -> ControllerConfig {
    ControllerConfig {
        reconcile: ReconcileConfig { poll_interval: Duration::from_millis(20), ..Default::default() },
        settle,
    }
}

fn controller() -> WorkloadController<MemoryCluster> {
    WorkloadController::new(MemoryCluster::default(), config(Duration::from_millis(10)))
}

fn web() -> WorkloadSpec {
    WorkloadSpec::deployment("web", "reg/web:1", 2).in_namespace("apps")
}

fn migrate() -> WorkloadSpec {
    WorkloadSpec::job("migrate", "reg/db:2").in_namespace("apps")
}

async fn drain(mut rollout: Rollout) -> Vec<AnyEvent> {
    let mut out = Vec::new();
    while let Some(ev) = rollout.next().await {
        out.push(ev);
    }
    out
}

fn statuses(events: &[AnyEvent]) -> Vec<EventStatus> {
    events.iter().map(|e| e.status()).collect()
}

const TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn deploy_creates_then_reconciles_to_ready() {
    let c = controller();
    let events = drain(c.deploy(&web(), TIMEOUT).await).await;
    assert_eq!(statuses(&events), vec![EventStatus::Started, EventStatus::Completed]);
    assert_eq!(events[0].message(), "Deploying web (2 desired replicas)");
    assert_eq!(events[1].message(), "web is ready: 2/2 replicas available");
    assert_eq!(c.api().calls(), vec!["create Deployment apps/web"]);
}

#[tokio::test]
async fn create_or_upgrade_twice_converges_without_errors() {
    let c = controller();
    for _ in 0..2 {
        let events = drain(c.create_or_upgrade(&web(), TIMEOUT, UpgradeStrategy::Rolling).await).await;
        assert!(!statuses(&events).contains(&EventStatus::Error));
        assert_eq!(events.last().map(|e| e.status()), Some(EventStatus::Completed));
    }
    assert_eq!(
        c.api().calls(),
        vec!["get Deployment apps/web", "create Deployment apps/web", "get Deployment apps/web", "patch Deployment apps/web"]
    );
}

#[tokio::test]
async fn recreate_deletes_before_creating() {
    let c = controller();
    c.deploy_and_wait(&web(), TIMEOUT, UpgradeStrategy::Rolling).await.unwrap();
    let done = c.deploy_and_wait(&web(), TIMEOUT, UpgradeStrategy::Recreate).await.unwrap();
    assert!(matches!(done, Deployed::Deployment(_)));
    assert_eq!(
        c.api().calls()[2..],
        ["get Deployment apps/web", "delete Deployment apps/web", "get Deployment apps/web", "create Deployment apps/web"]
    );
}

#[tokio::test]
async fn jobs_are_always_recreated() {
    let c = controller();
    let first = drain(c.deploy(&migrate(), TIMEOUT).await).await;
    assert_eq!(first.last().map(|e| e.message().into_owned()), Some("Job migrate completed (1 succeeded)".to_string()));

    let mut spec = migrate();
    spec.kind = WorkloadKind::Job { backoff_limit: Some(1), ttl_seconds_after_finished: None };
    let done = c.deploy_and_wait(&spec, TIMEOUT, UpgradeStrategy::Rolling).await.unwrap();
    match done {
        Deployed::Job(job) => assert_eq!(job.spec.and_then(|s| s.backoff_limit), Some(1)),
        other => panic!("expected a job, got {:?}", other),
    }
    assert_eq!(
        c.api().calls(),
        vec!["create Job apps/migrate", "get Job apps/migrate", "delete Job apps/migrate", "get Job apps/migrate", "create Job apps/migrate"]
    );
}

#[tokio::test]
async fn upgrade_patches_in_place() {
    let c = controller();
    c.deploy_and_wait(&web(), TIMEOUT, UpgradeStrategy::Rolling).await.unwrap();
    let events = drain(c.upgrade(&web(), TIMEOUT).await).await;
    assert_eq!(statuses(&events), vec![EventStatus::Started, EventStatus::Completed]);
    assert_eq!(c.api().calls().last().map(String::as_str), Some("patch Deployment apps/web"));
}

#[tokio::test]
async fn failed_create_surfaces_the_original_error() {
    let c = controller();
    let denied = "admission webhook \"policy.example\" denied the request";
    *c.api().fail_create.lock().unwrap() = Some(denied.to_string());

    let events = drain(c.deploy(&web(), TIMEOUT).await).await;
    assert_eq!(statuses(&events), vec![EventStatus::Started, EventStatus::Error]);
    assert_eq!(events[1].message(), format!("web failed: {}", denied));
    assert!(events[1].error().is_some());

    match c.deploy_and_wait(&web(), TIMEOUT, UpgradeStrategy::Rolling).await {
        Err(DeployError::ControlPlane(e)) => assert_eq!(e.to_string(), denied),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn invalid_spec_is_rejected_before_any_call() {
    let c = controller();
    let spec = WorkloadSpec::deployment("Web_1", "reg/web:1", 1);
    match c.deploy_and_wait(&spec, TIMEOUT, UpgradeStrategy::Rolling).await {
        Err(DeployError::Spec(SpecError::InvalidName(name))) => assert_eq!(name, "Web_1"),
        other => panic!("unexpected result: {:?}", other),
    }
    let events = drain(c.deploy(&spec, TIMEOUT).await).await;
    assert_eq!(statuses(&events), vec![EventStatus::Started, EventStatus::Error]);
    assert!(c.api().calls().is_empty());
}

#[tokio::test]
async fn one_deadline_covers_the_settle_delay() {
    let c = WorkloadController::new(MemoryCluster::default(), config(Duration::from_secs(5)));
    c.deploy_and_wait(&web(), TIMEOUT, UpgradeStrategy::Rolling).await.unwrap();

    let begun = std::time::Instant::now();
    let events = drain(c.create_or_upgrade(&web(), Duration::from_millis(100), UpgradeStrategy::Recreate).await).await;
    assert_eq!(statuses(&events), vec![EventStatus::Started, EventStatus::Timeout]);
    assert!(begun.elapsed() < Duration::from_secs(2));
    assert_eq!(c.api().calls().last().map(String::as_str), Some("delete Deployment apps/web"));
}

#[tokio::test]
async fn rollout_that_never_becomes_ready_times_out() {
    let c = controller();
    c.api().never_ready.store(true, Ordering::SeqCst);
    match c.deploy_and_wait(&web(), Duration::from_millis(150), UpgradeStrategy::Rolling).await {
        Err(DeployError::TimedOut(message)) => assert_eq!(message, "Timed out waiting for web (0/2 available, 0/2 ready)"),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn delete_tolerates_missing_objects() {
    let c = controller();
    c.deploy_and_wait(&web(), TIMEOUT, UpgradeStrategy::Rolling).await.unwrap();
    assert!(c.delete::<Deployment>("apps", "web").await.unwrap());
    assert!(!c.delete::<Deployment>("apps", "web").await.unwrap());
}

#[tokio::test]
async fn recreate_waits_for_a_terminating_object() {
    let c = controller();
    c.deploy_and_wait(&web(), TIMEOUT, UpgradeStrategy::Rolling).await.unwrap();
    c.api().linger.store(2, Ordering::SeqCst);

    let events = drain(c.create_or_upgrade(&web(), TIMEOUT, UpgradeStrategy::Recreate).await).await;
    assert_eq!(statuses(&events), vec![EventStatus::Started, EventStatus::Completed]);
    assert_eq!(
        c.api().calls()[2..],
        [
            "get Deployment apps/web",
            "delete Deployment apps/web",
            "get Deployment apps/web",
            "get Deployment apps/web",
            "get Deployment apps/web",
            "create Deployment apps/web"
        ]
    );
}

#[tokio::test]
async fn redeploying_a_job_held_by_finalizers_converges() {
    let c = controller();
    drain(c.deploy(&migrate(), TIMEOUT).await).await;
    c.api().linger.store(3, Ordering::SeqCst);
    let done = c.deploy_and_wait(&migrate(), TIMEOUT, UpgradeStrategy::Rolling).await.unwrap();
    assert!(matches!(done, Deployed::Job(_)));
    assert_eq!(c.api().calls().last().map(String::as_str), Some("create Job apps/migrate"));
}

#[tokio::test]
async fn object_that_never_goes_away_times_out_instead_of_failing() {
    let c = controller();
    c.deploy_and_wait(&web(), TIMEOUT, UpgradeStrategy::Rolling).await.unwrap();
    c.api().linger.store(usize::MAX, Ordering::SeqCst);
    let events = drain(c.create_or_upgrade(&web(), Duration::from_millis(200), UpgradeStrategy::Recreate).await).await;
    assert_eq!(statuses(&events), vec![EventStatus::Started, EventStatus::Timeout]);
    assert_eq!(c.api().calls().iter().filter(|c| c.starts_with("create")).count(), 1);
}

#[tokio::test]
async fn huge_timeouts_do_not_overflow_the_deadline() {
    let c = controller();
    let events = drain(c.deploy(&web(), Duration::MAX).await).await;
    assert_eq!(statuses(&events), vec![EventStatus::Started, EventStatus::Completed]);
}
