//! Replay service: the surface callers drive replays through.
//!
//! Dry-run planning, replay start, status lookup, listing, and
//! cancellation. Date ranges arrive in `YYYY-MM-DD` form and are widened
//! to whole days in UTC.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use optimus_core::{Clock, ProgressObserver, ProjectJobSpecStore, StoreError};

use crate::executor::{store_error, ReplayExecutor};
use crate::models::{parse_date_range, ReplayError, ReplayRequest};
use crate::planner::{ReplayPlan, ReplayPlanner};
use crate::store::ReplayStore;

/// Parameters of a replay, as received at the request boundary.
#[derive(Clone, Debug)]
pub struct ReplayCommand {
    pub project: String,
    pub namespace: String,
    pub job: String,
    /// Inclusive, `YYYY-MM-DD`.
    pub start_date: String,
    /// Inclusive, `YYYY-MM-DD`.
    pub end_date: String,
    pub force: bool,
    pub allowed_downstream_namespaces: BTreeSet<String>,
}

pub struct ReplayService {
    catalog: Arc<dyn ProjectJobSpecStore>,
    store: Arc<dyn ReplayStore>,
    executor: Arc<ReplayExecutor>,
    planner: ReplayPlanner,
    clock: Arc<dyn Clock>,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl ReplayService {
    pub fn new(
        catalog: Arc<dyn ProjectJobSpecStore>,
        store: Arc<dyn ReplayStore>,
        executor: Arc<ReplayExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            planner: ReplayPlanner::new(catalog.clone()),
            catalog,
            store,
            executor,
            clock,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Plans the replay without persisting anything or touching the
    /// scheduler; returns the tree and the ignored dependents for display.
    pub async fn dry_run(
        &self,
        token: &CancellationToken,
        command: &ReplayCommand,
    ) -> Result<ReplayPlan, ReplayError> {
        let (start, end) = parse_date_range(&command.start_date, &command.end_date)?;
        let pair = self.root_job(command).await?;
        self.planner
            .plan(
                token,
                &pair.project,
                &pair.job,
                start,
                end,
                &command.allowed_downstream_namespaces,
                self.observer.as_deref(),
            )
            .await
    }

    /// Plans and starts the replay; returns the persisted request id.
    pub async fn start_replay(
        &self,
        token: &CancellationToken,
        command: &ReplayCommand,
    ) -> Result<Uuid, ReplayError> {
        let (start, end) = parse_date_range(&command.start_date, &command.end_date)?;
        let pair = self.root_job(command).await?;
        let plan = self
            .planner
            .plan(
                token,
                &pair.project,
                &pair.job,
                start,
                end,
                &command.allowed_downstream_namespaces,
                self.observer.as_deref(),
            )
            .await?;
        let request = ReplayRequest::new(
            command.project.clone(),
            command.namespace.clone(),
            command.job.clone(),
            start,
            end,
            command.force,
            command.allowed_downstream_namespaces.clone(),
            self.clock.now(),
        )
        .with_tree(plan.tree);
        self.executor.start(request).await
    }

    pub async fn get_replay(&self, id: Uuid) -> Result<ReplayRequest, ReplayError> {
        self.store.get(id).await.map_err(store_error)
    }

    pub async fn list_replays(&self, project_name: &str) -> Result<Vec<ReplayRequest>, ReplayError> {
        self.store.list(project_name).await.map_err(store_error)
    }

    pub async fn cancel_replay(&self, id: Uuid) -> Result<(), ReplayError> {
        self.executor.cancel(id).await
    }

    /// Waits for the background worker of a started replay, mainly for
    /// shutdown paths and tests.
    pub async fn wait_for(&self, id: Uuid) {
        self.executor.wait(id).await;
    }

    async fn root_job(
        &self,
        command: &ReplayCommand,
    ) -> Result<optimus_core::ProjectJobPair, ReplayError> {
        self.catalog
            .get_by_name(&command.project, &command.job)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(what) => {
                    ReplayError::InvalidRequest(format!("unknown replay target: {what}"))
                }
                other => ReplayError::Catalog(other.to_string()),
            })
    }
}
