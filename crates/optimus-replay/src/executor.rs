//! Replay executor: persists a replay request and drives the scheduler to
//! re-run the planned instants.
//!
//! Execution is decomposed into (job, instant) units. A unit starts only
//! after the same instant of every tree parent reported terminal success
//! and after the same job's previous instant; independent subtrees run in
//! parallel. At most one replay per (project, root job) is active at a
//! time, enforced through a serialized accept section over the store.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use optimus_core::{notify, ProgressEvent, ProgressObserver};

use crate::models::{ReplayError, ReplayRequest, ReplayStatus};
use crate::scheduler::{with_retry, RetryBackoff, Scheduler, TaskRunState};
use crate::store::{ReplayStore, ReplayStoreError};
use crate::tree::ExecutionTree;

const STATUS_CONFLICT_RETRIES: u32 = 3;

/// One run instant of one tree node: (node key, instant).
type Unit = (String, DateTime<Utc>);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UnitState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// Executor tuning knobs.
#[derive(Clone, Debug)]
pub struct ReplayExecutorConfig {
    /// Retry discipline for scheduler RPCs.
    pub backoff: RetryBackoff,
    /// First status-poll delay after a trigger.
    pub poll_initial: Duration,
    /// Cap on the exponentially growing poll interval.
    pub poll_max: Duration,
    /// How long cancellation waits for in-flight pollers to settle.
    pub drain_timeout: Duration,
}

impl Default for ReplayExecutorConfig {
    fn default() -> Self {
        Self {
            backoff: RetryBackoff::default(),
            poll_initial: Duration::from_millis(500),
            poll_max: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

pub struct ReplayExecutor {
    store: Arc<dyn ReplayStore>,
    scheduler: Arc<dyn Scheduler>,
    observer: Option<Arc<dyn ProgressObserver>>,
    config: ReplayExecutorConfig,
    /// Serializes the accept path so the at-most-one check and the insert
    /// are not interleaved by concurrent starts.
    accept_gate: tokio::sync::Mutex<()>,
    active: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    workers: tokio::sync::Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl ReplayExecutor {
    pub fn new(store: Arc<dyn ReplayStore>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::with_config(store, scheduler, ReplayExecutorConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn ReplayStore>,
        scheduler: Arc<dyn Scheduler>,
        config: ReplayExecutorConfig,
    ) -> Self {
        Self {
            store,
            scheduler,
            observer: None,
            config,
            accept_gate: tokio::sync::Mutex::new(()),
            active: Arc::new(Mutex::new(HashMap::new())),
            workers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Accepts a planned replay and begins executing it in the background.
    ///
    /// A non-terminal replay on the same (project, root job) rejects the
    /// request unless `force` is set, in which case the prior replay is
    /// cancelled before this one is accepted.
    pub async fn start(&self, request: ReplayRequest) -> Result<Uuid, ReplayError> {
        let tree = request.execution_tree.clone().ok_or_else(|| {
            ReplayError::InvalidRequest("execution tree missing; plan the replay first".to_string())
        })?;

        let _gate = self.accept_gate.lock().await;
        let prior = self
            .store
            .get_in_progress(&request.project, &request.job)
            .await
            .map_err(store_error)?;
        for existing in prior {
            if !request.force {
                return Err(ReplayError::AlreadyInProgress {
                    project: request.project.clone(),
                    job: request.job.clone(),
                });
            }
            info!(
                replay_id = %existing.id,
                project = %request.project,
                job = %request.job,
                "force run: cancelling in-progress replay"
            );
            if let Some(token) = self.active_token(existing.id)? {
                token.cancel();
            }
            match update_status_with_retry(self.store.as_ref(), existing.id, ReplayStatus::Cancelled)
                .await
            {
                // A worker may have reached terminal state concurrently.
                Ok(_) | Err(ReplayStoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(store_error(e)),
            }
        }

        self.store.insert(&request).await.map_err(store_error)?;
        info!(
            replay_id = %request.id,
            project = %request.project,
            job = %request.job,
            nodes = tree.len(),
            "replay accepted"
        );

        let token = CancellationToken::new();
        self.active
            .lock()
            .map_err(|e| ReplayError::Store(e.to_string()))?
            .insert(request.id, token.clone());

        let worker = ReplayWorker {
            store: self.store.clone(),
            scheduler: self.scheduler.clone(),
            observer: self.observer.clone(),
            config: self.config.clone(),
        };
        let replay_id = request.id;
        let active = self.active.clone();
        let handle = tokio::spawn(async move {
            worker.run(request, tree, token).await;
            if let Ok(mut map) = active.lock() {
                map.remove(&replay_id);
            }
        });
        self.workers.lock().await.insert(replay_id, handle);
        Ok(replay_id)
    }

    /// Requests cancellation. An in-process worker stops issuing triggers
    /// and records `Cancelled` after draining; a replay without a live
    /// worker is cancelled directly in the store.
    pub async fn cancel(&self, id: Uuid) -> Result<(), ReplayError> {
        if let Some(token) = self.active_token(id)? {
            info!(replay_id = %id, "cancelling replay");
            token.cancel();
            return Ok(());
        }
        let current = self.store.get(id).await.map_err(store_error)?;
        if current.status.is_terminal() {
            return Ok(());
        }
        match update_status_with_retry(self.store.as_ref(), id, ReplayStatus::Cancelled).await {
            Ok(_) | Err(ReplayStoreError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(store_error(e)),
        }
    }

    /// Waits for the background worker of `id` to finish, if one exists.
    pub async fn wait(&self, id: Uuid) {
        let handle = self.workers.lock().await.remove(&id);
        if let Some(handle) = handle {
            if handle.await.is_err() {
                warn!(replay_id = %id, "replay worker panicked");
            }
        }
    }

    fn active_token(&self, id: Uuid) -> Result<Option<CancellationToken>, ReplayError> {
        Ok(self
            .active
            .lock()
            .map_err(|e| ReplayError::Store(e.to_string()))?
            .get(&id)
            .cloned())
    }
}

pub(crate) fn store_error(e: ReplayStoreError) -> ReplayError {
    match e {
        ReplayStoreError::NotFound(id) => ReplayError::NotFound(id),
        ReplayStoreError::Conflict { id, .. } => ReplayError::PersistenceConflict(id),
        other => ReplayError::Store(other.to_string()),
    }
}

/// Re-reads the current version and applies the status write, absorbing up
/// to [STATUS_CONFLICT_RETRIES] optimistic-lock conflicts.
async fn update_status_with_retry(
    store: &dyn ReplayStore,
    id: Uuid,
    status: ReplayStatus,
) -> Result<ReplayRequest, ReplayStoreError> {
    let mut attempt = 0;
    loop {
        let current = store.get(id).await?;
        match store.update_status(id, status, current.version).await {
            Ok(updated) => return Ok(updated),
            Err(ReplayStoreError::Conflict { .. }) if attempt < STATUS_CONFLICT_RETRIES => {
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

enum DriveOutcome {
    Completed {
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
    Cancelled,
}

struct ReplayWorker {
    store: Arc<dyn ReplayStore>,
    scheduler: Arc<dyn Scheduler>,
    observer: Option<Arc<dyn ProgressObserver>>,
    config: ReplayExecutorConfig,
}

impl ReplayWorker {
    async fn run(&self, request: ReplayRequest, tree: ExecutionTree, token: CancellationToken) {
        let replay_id = request.id;
        for status in [ReplayStatus::Planned, ReplayStatus::InProgress] {
            match update_status_with_retry(self.store.as_ref(), replay_id, status).await {
                Ok(_) => {}
                Err(ReplayStoreError::InvalidTransition { .. }) => {
                    warn!(replay_id = %replay_id, "replay cancelled before execution started");
                    return;
                }
                Err(e) => {
                    warn!(replay_id = %replay_id, error = %e, "failed to persist replay status");
                    return;
                }
            }
        }

        let outcome = self.drive(replay_id, &tree, &token).await;
        let final_status = match outcome {
            DriveOutcome::Cancelled => ReplayStatus::Cancelled,
            DriveOutcome::Completed {
                succeeded,
                failed,
                skipped,
            } => {
                info!(
                    replay_id = %replay_id,
                    succeeded,
                    failed,
                    skipped,
                    "replay run units settled"
                );
                if failed + skipped == 0 {
                    ReplayStatus::Success
                } else if succeeded == 0 {
                    ReplayStatus::Failed
                } else {
                    ReplayStatus::PartialFailed
                }
            }
        };
        match update_status_with_retry(self.store.as_ref(), replay_id, final_status).await {
            Ok(_) => info!(replay_id = %replay_id, status = ?final_status, "replay finished"),
            Err(ReplayStoreError::InvalidTransition { .. }) => {
                warn!(replay_id = %replay_id, "replay was cancelled externally")
            }
            Err(e) => warn!(replay_id = %replay_id, error = %e, "failed to persist final status"),
        }
    }

    async fn drive(
        &self,
        replay_id: Uuid,
        tree: &ExecutionTree,
        token: &CancellationToken,
    ) -> DriveOutcome {
        let (mut states, prereqs, dependents) = build_units(tree);
        let seq = Arc::new(AtomicU64::new(0));
        let mut join_set: JoinSet<(Unit, Result<TaskRunState, ReplayError>)> = JoinSet::new();
        let mut cancelled = token.is_cancelled();

        while !cancelled {
            let ready: Vec<Unit> = states
                .iter()
                .filter(|(unit, state)| {
                    **state == UnitState::Pending
                        && prereqs
                            .get(*unit)
                            .map(|required| {
                                required
                                    .iter()
                                    .all(|p| states.get(p) == Some(&UnitState::Succeeded))
                            })
                            .unwrap_or(true)
                })
                .map(|(unit, _)| unit.clone())
                .collect();
            for unit in ready {
                states.insert(unit.clone(), UnitState::Running);
                let ctx = UnitContext {
                    scheduler: self.scheduler.clone(),
                    observer: self.observer.clone(),
                    config: self.config.clone(),
                    seq: seq.clone(),
                    replay_id,
                    token: token.clone(),
                };
                let (node_key, run) = unit;
                join_set.spawn(async move {
                    let result = execute_unit(ctx, node_key.clone(), run).await;
                    ((node_key, run), result)
                });
            }

            if join_set.is_empty() {
                break;
            }
            tokio::select! {
                _ = token.cancelled() => {
                    cancelled = true;
                }
                joined = join_set.join_next() => {
                    match joined {
                        Some(Ok((unit, result))) => {
                            settle(replay_id, &mut states, &dependents, unit, result);
                        }
                        Some(Err(join_error)) => {
                            warn!(replay_id = %replay_id, error = %join_error, "replay unit task aborted");
                        }
                        None => break,
                    }
                }
            }
        }

        if cancelled {
            let drained = tokio::time::timeout(self.config.drain_timeout, async {
                while join_set.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(replay_id = %replay_id, "in-flight pollers did not settle before drain timeout");
                join_set.abort_all();
            }
            return DriveOutcome::Cancelled;
        }

        let mut counts = (0usize, 0usize, 0usize);
        for (unit, state) in states.iter_mut() {
            if matches!(state, UnitState::Pending | UnitState::Running) {
                warn!(replay_id = %replay_id, job = %unit.0, "run unit never settled; marking skipped");
                *state = UnitState::Skipped;
            }
            match state {
                UnitState::Succeeded => counts.0 += 1,
                UnitState::Failed => counts.1 += 1,
                UnitState::Skipped => counts.2 += 1,
                UnitState::Pending | UnitState::Running => {}
            }
        }
        DriveOutcome::Completed {
            succeeded: counts.0,
            failed: counts.1,
            skipped: counts.2,
        }
    }
}

fn settle(
    replay_id: Uuid,
    states: &mut BTreeMap<Unit, UnitState>,
    dependents: &BTreeMap<Unit, Vec<Unit>>,
    unit: Unit,
    result: Result<TaskRunState, ReplayError>,
) {
    match result {
        Ok(TaskRunState::Success) => {
            states.insert(unit, UnitState::Succeeded);
        }
        Ok(state) => {
            warn!(replay_id = %replay_id, job = %unit.0, run = %unit.1, state = state.as_str(), "run terminated unsuccessfully");
            fail_and_skip_subtree(states, dependents, unit);
        }
        Err(e) => {
            warn!(replay_id = %replay_id, job = %unit.0, run = %unit.1, error = %e, "run unit failed");
            fail_and_skip_subtree(states, dependents, unit);
        }
    }
}

/// Marks the unit failed and every transitively dependent pending unit
/// skipped, so a dead subtree stops consuming scheduler calls.
fn fail_and_skip_subtree(
    states: &mut BTreeMap<Unit, UnitState>,
    dependents: &BTreeMap<Unit, Vec<Unit>>,
    unit: Unit,
) {
    states.insert(unit.clone(), UnitState::Failed);
    let mut queue = VecDeque::from([unit]);
    while let Some(current) = queue.pop_front() {
        for dependent in dependents.get(&current).into_iter().flatten() {
            if states.get(dependent) == Some(&UnitState::Pending) {
                states.insert(dependent.clone(), UnitState::Skipped);
                queue.push_back(dependent.clone());
            }
        }
    }
}

/// Expands the tree into run units with their prerequisites: the same
/// instant of every parent, plus the same job's previous instant.
fn build_units(
    tree: &ExecutionTree,
) -> (
    BTreeMap<Unit, UnitState>,
    BTreeMap<Unit, Vec<Unit>>,
    BTreeMap<Unit, Vec<Unit>>,
) {
    let mut states: BTreeMap<Unit, UnitState> = BTreeMap::new();
    let mut prereqs: BTreeMap<Unit, Vec<Unit>> = BTreeMap::new();
    for node in tree.nodes() {
        let key = node.key();
        let mut previous: Option<DateTime<Utc>> = None;
        for run in &node.runs {
            let unit = (key.clone(), *run);
            states.insert(unit.clone(), UnitState::Pending);
            let required = prereqs.entry(unit).or_default();
            if let Some(prev) = previous {
                required.push((key.clone(), prev));
            }
            previous = Some(*run);
        }
        for child_key in &node.dependents {
            if let Some(child) = tree.node(child_key) {
                for run in node.runs.intersection(&child.runs) {
                    prereqs
                        .entry((child_key.clone(), *run))
                        .or_default()
                        .push((key.clone(), *run));
                }
            }
        }
    }
    let mut dependents: BTreeMap<Unit, Vec<Unit>> = BTreeMap::new();
    for (unit, required) in &prereqs {
        for prerequisite in required {
            dependents
                .entry(prerequisite.clone())
                .or_default()
                .push(unit.clone());
        }
    }
    (states, prereqs, dependents)
}

#[derive(Clone)]
struct UnitContext {
    scheduler: Arc<dyn Scheduler>,
    observer: Option<Arc<dyn ProgressObserver>>,
    config: ReplayExecutorConfig,
    seq: Arc<AtomicU64>,
    replay_id: Uuid,
    token: CancellationToken,
}

/// Clears and re-triggers one run instant, then polls until the scheduler
/// reports a terminal state. Poll intervals grow exponentially up to the
/// configured cap.
async fn execute_unit(
    ctx: UnitContext,
    node_key: String,
    run: DateTime<Utc>,
) -> Result<TaskRunState, ReplayError> {
    let (project, job) = match node_key.split_once('/') {
        Some((project, job)) => (project.to_string(), job.to_string()),
        None => (String::new(), node_key.clone()),
    };
    if ctx.token.is_cancelled() {
        return Err(ReplayError::Cancelled);
    }

    with_retry(&ctx.config.backoff, &ctx.token, || {
        ctx.scheduler.clear(&project, &job, run)
    })
    .await?;
    with_retry(&ctx.config.backoff, &ctx.token, || {
        ctx.scheduler.trigger(&project, &job, run)
    })
    .await?;
    let seq = ctx.seq.fetch_add(1, Ordering::SeqCst);
    info!(replay_id = %ctx.replay_id, job = %node_key, run = %run, "run re-triggered");
    notify(
        ctx.observer.as_deref(),
        ProgressEvent::ReplayRunTriggered {
            replay_id: ctx.replay_id,
            project: project.clone(),
            job: job.clone(),
            run,
            seq,
        },
    );

    let mut interval = ctx.config.poll_initial;
    loop {
        tokio::select! {
            _ = ctx.token.cancelled() => return Err(ReplayError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
        let state = with_retry(&ctx.config.backoff, &ctx.token, || {
            ctx.scheduler.run_status(&project, &job, run)
        })
        .await?;
        if state.is_terminal() {
            let seq = ctx.seq.fetch_add(1, Ordering::SeqCst);
            notify(
                ctx.observer.as_deref(),
                ProgressEvent::ReplayRunTerminal {
                    replay_id: ctx.replay_id,
                    project,
                    job,
                    run,
                    state: state.as_str().to_string(),
                    seq,
                },
            );
            return Ok(state);
        }
        interval = (interval * 2).min(ctx.config.poll_max);
    }
}
