//! End-to-end replay scenarios driven through the service surface with an
//! in-memory catalog, an in-memory replay store, and a scripted scheduler.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use optimus_core::{
    DependencyMod, DependencyType, GenerateDependenciesRequest, GenerateDependenciesResponse,
    InMemoryPluginRegistry, InMemoryProjectJobStore, JobBehavior, JobConfig, JobSchedule, JobSpec,
    JobSpecDependency, JobTask, NamespaceSpec, PluginError, ProgressEvent, ProjectSpec,
    RecordingObserver, SystemClock, TaskPlugin, Window,
};
use optimus_replay::{
    InMemoryReplayStore, ReplayCommand, ReplayError, ReplayExecutor, ReplayExecutorConfig,
    ReplayService, ReplayStatus, ReplayStore, RetryBackoff, Scheduler, SchedulerError,
    TaskRunState,
};

fn job(name: &str) -> JobSpec {
    JobSpec {
        name: name.to_string(),
        owner: "owner@example.com".to_string(),
        description: String::new(),
        labels: BTreeMap::new(),
        schedule: JobSchedule {
            interval: "0 2 * * *".to_string(),
            start_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end_date: None,
        },
        behavior: JobBehavior::default(),
        task: JobTask {
            unit: "bq2bq".to_string(),
            config: JobConfig::new(),
            window: Window::default(),
        },
        assets: BTreeMap::new(),
        dependencies: BTreeMap::new(),
        hooks: Vec::new(),
    }
}

fn job_depending_on(name: &str, upstreams: &[&str]) -> JobSpec {
    let mut spec = job(name);
    for upstream in upstreams {
        spec.dependencies.insert(
            upstream.to_string(),
            JobSpecDependency::declared(DependencyType::Intra),
        );
    }
    spec
}

fn run_at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, 2, 0, 0).unwrap()
}

fn command(job: &str, start: &str, end: &str, allowed: &[&str]) -> ReplayCommand {
    ReplayCommand {
        project: "p1".to_string(),
        namespace: "ns1".to_string(),
        job: job.to_string(),
        start_date: start.to_string(),
        end_date: end.to_string(),
        force: false,
        allowed_downstream_namespaces: allowed.iter().map(|ns| ns.to_string()).collect(),
    }
}

/// Scheduler fake recording call order. While `hold` is set, polled runs
/// stay running.
struct ScriptedScheduler {
    events: Mutex<Vec<String>>,
    hold: AtomicBool,
}

impl ScriptedScheduler {
    fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            hold: AtomicBool::new(false),
        }
    }

    fn holding() -> Self {
        let scheduler = Self::new();
        scheduler.hold.store(true, Ordering::SeqCst);
        scheduler
    }

    fn release(&self) {
        self.hold.store(false, Ordering::SeqCst);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().expect("events lock").clone()
    }

    fn record(&self, entry: String) {
        self.events.lock().expect("events lock").push(entry);
    }

    fn tag(job: &str, run: DateTime<Utc>) -> String {
        format!("{}@{}", job, run.format("%d"))
    }
}

#[async_trait]
impl Scheduler for ScriptedScheduler {
    async fn clear(
        &self,
        _project: &str,
        job: &str,
        run: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        self.record(format!("clear:{}", Self::tag(job, run)));
        Ok(())
    }

    async fn trigger(
        &self,
        _project: &str,
        job: &str,
        run: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        self.record(format!("trigger:{}", Self::tag(job, run)));
        Ok(())
    }

    async fn run_status(
        &self,
        _project: &str,
        job: &str,
        run: DateTime<Utc>,
    ) -> Result<TaskRunState, SchedulerError> {
        if self.hold.load(Ordering::SeqCst) {
            return Ok(TaskRunState::Running);
        }
        self.record(format!("status:success:{}", Self::tag(job, run)));
        Ok(TaskRunState::Success)
    }
}

struct Harness {
    catalog: Arc<InMemoryProjectJobStore>,
    replay_store: Arc<InMemoryReplayStore>,
    scheduler: Arc<ScriptedScheduler>,
    service: ReplayService,
}

fn harness(scheduler: ScriptedScheduler) -> Harness {
    let catalog = Arc::new(InMemoryProjectJobStore::new());
    catalog.add_project(ProjectSpec::new("p1")).unwrap();
    catalog
        .add_namespace(NamespaceSpec::new("ns1", "p1"))
        .unwrap();
    catalog
        .add_namespace(NamespaceSpec::new("ns2", "p1"))
        .unwrap();

    let replay_store = Arc::new(InMemoryReplayStore::new());
    let scheduler = Arc::new(scheduler);
    let executor = Arc::new(ReplayExecutor::with_config(
        replay_store.clone(),
        scheduler.clone(),
        ReplayExecutorConfig {
            backoff: RetryBackoff {
                initial: Duration::from_millis(1),
                factor: 2,
                max_retries: 3,
            },
            poll_initial: Duration::from_millis(2),
            poll_max: Duration::from_millis(10),
            drain_timeout: Duration::from_secs(1),
        },
    ));
    let service = ReplayService::new(
        catalog.clone(),
        replay_store.clone(),
        executor,
        Arc::new(SystemClock),
    );
    Harness {
        catalog,
        replay_store,
        scheduler,
        service,
    }
}

#[tokio::test]
async fn single_job_in_range_replay() {
    let h = harness(ScriptedScheduler::new());
    h.catalog.add_job("p1", "ns1", job("a"), None).unwrap();

    let plan = h
        .service
        .dry_run(
            &CancellationToken::new(),
            &command("a", "2024-01-01", "2024-01-03", &["ns1"]),
        )
        .await
        .unwrap();

    assert_eq!(plan.tree.len(), 1);
    assert!(plan.ignored.is_empty());
    let root = plan.tree.root().unwrap();
    assert_eq!(
        root.runs,
        [run_at(1), run_at(2), run_at(3)].into_iter().collect()
    );
    // Dry run never touches the scheduler or the store.
    assert!(h.scheduler.events().is_empty());
    assert!(h.replay_store.list("p1").await.unwrap().is_empty());
}

#[tokio::test]
async fn linear_downstream_replay_orders_child_instants_after_parents() {
    let h = harness(ScriptedScheduler::new());
    h.catalog.add_job("p1", "ns1", job("a"), None).unwrap();
    h.catalog
        .add_job("p1", "ns1", job_depending_on("b", &["a"]), None)
        .unwrap();
    h.catalog
        .add_job("p1", "ns1", job_depending_on("c", &["b"]), None)
        .unwrap();

    let id = h
        .service
        .start_replay(
            &CancellationToken::new(),
            &command("a", "2024-01-01", "2024-01-02", &["ns1"]),
        )
        .await
        .unwrap();
    h.service.wait_for(id).await;

    let finished = h.service.get_replay(id).await.unwrap();
    assert_eq!(finished.status, ReplayStatus::Success);
    let tree = finished.execution_tree.expect("persisted tree");
    assert_eq!(tree.len(), 3);

    let events = h.scheduler.events();
    let position = |needle: &str| {
        events
            .iter()
            .position(|e| e == needle)
            .unwrap_or_else(|| panic!("event '{}' missing in {:?}", needle, events))
    };
    for (parent, child) in [("a", "b"), ("b", "c")] {
        for day in ["01", "02"] {
            assert!(
                position(&format!("trigger:{}@{}", child, day))
                    > position(&format!("status:success:{}@{}", parent, day))
            );
        }
    }
    assert!(position("trigger:a@02") > position("status:success:a@01"));
}

#[tokio::test]
async fn diamond_dependents_deduplicate_and_wait_for_both_parents() {
    let h = harness(ScriptedScheduler::new());
    h.catalog.add_job("p1", "ns1", job("a"), None).unwrap();
    h.catalog
        .add_job("p1", "ns1", job_depending_on("b", &["a"]), None)
        .unwrap();
    h.catalog
        .add_job("p1", "ns1", job_depending_on("c", &["a"]), None)
        .unwrap();
    h.catalog
        .add_job("p1", "ns1", job_depending_on("d", &["b", "c"]), None)
        .unwrap();

    let id = h
        .service
        .start_replay(
            &CancellationToken::new(),
            &command("a", "2024-01-01", "2024-01-01", &["ns1"]),
        )
        .await
        .unwrap();
    h.service.wait_for(id).await;

    let finished = h.service.get_replay(id).await.unwrap();
    assert_eq!(finished.status, ReplayStatus::Success);
    let tree = finished.execution_tree.expect("persisted tree");
    assert_eq!(tree.len(), 4);
    assert_eq!(
        tree.node("p1/d").unwrap().runs,
        [run_at(1)].into_iter().collect()
    );

    let events = h.scheduler.events();
    assert_eq!(events.iter().filter(|e| *e == "trigger:d@01").count(), 1);
    let position = |needle: &str| events.iter().position(|e| e == needle).unwrap();
    assert!(position("trigger:d@01") > position("status:success:b@01"));
    assert!(position("trigger:d@01") > position("status:success:c@01"));
}

#[tokio::test]
async fn cross_namespace_dependents_are_filtered_unless_wildcarded() {
    let h = harness(ScriptedScheduler::new());
    h.catalog.add_job("p1", "ns1", job("a"), None).unwrap();
    h.catalog
        .add_job("p1", "ns2", job_depending_on("b", &["a"]), None)
        .unwrap();

    let token = CancellationToken::new();
    let filtered = h
        .service
        .dry_run(&token, &command("a", "2024-01-01", "2024-01-01", &["ns1"]))
        .await
        .unwrap();
    assert_eq!(filtered.tree.len(), 1);
    assert_eq!(filtered.ignored, vec!["p1/b".to_string()]);

    let wildcard = h
        .service
        .dry_run(&token, &command("a", "2024-01-01", "2024-01-01", &["*"]))
        .await
        .unwrap();
    assert_eq!(wildcard.tree.len(), 2);
    assert!(wildcard.ignored.is_empty());
    assert!(wildcard.tree.contains("p1/b"));
}

#[tokio::test]
async fn unknown_inferred_dependency_resolves_with_event() {
    struct LonelyDependencyMod;

    #[async_trait]
    impl DependencyMod for LonelyDependencyMod {
        async fn generate_dependencies(
            &self,
            _request: GenerateDependenciesRequest,
        ) -> Result<GenerateDependenciesResponse, PluginError> {
            Ok(GenerateDependenciesResponse {
                destinations: vec!["bigquery://p:d.x".to_string()],
            })
        }
    }

    struct Bq2Bq;

    impl TaskPlugin for Bq2Bq {
        fn name(&self) -> &str {
            "bq2bq"
        }

        fn dependency_mod(&self) -> Option<Arc<dyn DependencyMod>> {
            Some(Arc::new(LonelyDependencyMod))
        }
    }

    let registry = Arc::new(InMemoryPluginRegistry::new());
    registry.register_task(Arc::new(Bq2Bq)).unwrap();
    let catalog = Arc::new(InMemoryProjectJobStore::new());
    catalog.add_project(ProjectSpec::new("p1")).unwrap();
    catalog
        .add_namespace(NamespaceSpec::new("ns1", "p1"))
        .unwrap();

    let resolver = optimus_core::DependencyResolver::new(registry, catalog);
    let observer = RecordingObserver::new();
    let resolved = resolver
        .resolve(
            &CancellationToken::new(),
            &ProjectSpec::new("p1"),
            job("a"),
            Some(&observer),
        )
        .await
        .unwrap();

    assert!(resolved.dependencies.is_empty());
    let unknown: Vec<ProgressEvent> = observer
        .events()
        .into_iter()
        .filter(|e| matches!(e, ProgressEvent::UnknownDependencyUsed { .. }))
        .collect();
    assert_eq!(
        unknown,
        vec![ProgressEvent::UnknownDependencyUsed {
            job: "a".to_string(),
            dependency: "bigquery://p:d.x".to_string(),
        }]
    );
}

#[tokio::test]
async fn force_replay_cancels_in_progress_predecessor() {
    let h = harness(ScriptedScheduler::holding());
    h.catalog.add_job("p1", "ns1", job("a"), None).unwrap();

    let token = CancellationToken::new();
    let first = h
        .service
        .start_replay(&token, &command("a", "2024-01-01", "2024-01-01", &["ns1"]))
        .await
        .unwrap();
    // Let the first replay reach its polling loop against the held runs.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        h.service.get_replay(first).await.unwrap().status,
        ReplayStatus::InProgress
    );

    let rejected = h
        .service
        .start_replay(&token, &command("a", "2024-01-01", "2024-01-01", &["ns1"]))
        .await;
    assert!(matches!(rejected, Err(ReplayError::AlreadyInProgress { .. })));

    let mut forced = command("a", "2024-01-01", "2024-01-01", &["ns1"]);
    forced.force = true;
    let second = h.service.start_replay(&token, &forced).await.unwrap();
    assert_ne!(first, second);

    h.service.wait_for(first).await;
    assert_eq!(
        h.service.get_replay(first).await.unwrap().status,
        ReplayStatus::Cancelled
    );

    h.scheduler.release();
    h.service.wait_for(second).await;
    assert_eq!(
        h.service.get_replay(second).await.unwrap().status,
        ReplayStatus::Success
    );
}

#[tokio::test]
async fn replay_snapshot_round_trips_through_serialization() {
    let h = harness(ScriptedScheduler::new());
    h.catalog.add_job("p1", "ns1", job("a"), None).unwrap();
    h.catalog
        .add_job("p1", "ns1", job_depending_on("b", &["a"]), None)
        .unwrap();

    let id = h
        .service
        .start_replay(
            &CancellationToken::new(),
            &command("a", "2024-01-01", "2024-01-02", &["ns1"]),
        )
        .await
        .unwrap();
    h.service.wait_for(id).await;

    let stored = h.service.get_replay(id).await.unwrap();
    let encoded = serde_json::to_string(&stored).unwrap();
    let decoded: optimus_replay::ReplayRequest = serde_json::from_str(&encoded).unwrap();
    assert_eq!(stored, decoded);
    assert_eq!(stored.execution_tree, decoded.execution_tree);
}
