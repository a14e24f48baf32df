//! Replay domain model: requests, status state machine, and errors.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use optimus_core::ScheduleError;

use crate::tree::ExecutionTree;

/// Lifecycle of a replay request. Transitions only move forward; terminal
/// states are sticky.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplayStatus {
    Accepted,
    Planned,
    InProgress,
    Success,
    Failed,
    PartialFailed,
    Cancelled,
}

impl ReplayStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReplayStatus::Success
                | ReplayStatus::Failed
                | ReplayStatus::PartialFailed
                | ReplayStatus::Cancelled
        )
    }

    /// Allowed forward edges of the state machine.
    pub fn can_transition(&self, next: ReplayStatus) -> bool {
        use ReplayStatus::*;
        matches!(
            (self, next),
            (Accepted, Planned)
                | (Accepted, Cancelled)
                | (Planned, InProgress)
                | (Planned, Cancelled)
                | (InProgress, Success)
                | (InProgress, Failed)
                | (InProgress, PartialFailed)
                | (InProgress, Cancelled)
        )
    }
}

/// A request to re-execute a job and its allowed downstream dependents over
/// an inclusive date range. Persisted with its planned tree before the
/// scheduler is touched, so a crash leaves the replay recoverable.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayRequest {
    pub id: Uuid,
    pub project: String,
    pub namespace: String,
    pub job: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub force: bool,
    /// Namespaces downstream dependents may come from; `"*"` allows all.
    pub allowed_downstream_namespaces: BTreeSet<String>,
    pub status: ReplayStatus,
    pub execution_tree: Option<ExecutionTree>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl ReplayRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project: impl Into<String>,
        namespace: impl Into<String>,
        job: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        force: bool,
        allowed_downstream_namespaces: BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project: project.into(),
            namespace: namespace.into(),
            job: job.into(),
            start,
            end,
            force,
            allowed_downstream_namespaces,
            status: ReplayStatus::Accepted,
            execution_tree: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    pub fn with_tree(mut self, tree: ExecutionTree) -> Self {
        self.execution_tree = Some(tree);
        self
    }
}

/// Errors of the replay subsystem, distinguishable so callers can render
/// specific messages.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("cycle detected in dependency graph at '{0}'")]
    CycleDetected(String),
    #[error("a replay for job '{project}/{job}' is already in progress")]
    AlreadyInProgress { project: String, job: String },
    #[error("scheduler unavailable after retries: {0}")]
    SchedulerUnavailable(String),
    #[error("scheduler rejected request: {0}")]
    SchedulerFatal(String),
    #[error("persistence conflict on replay {0} after retries")]
    PersistenceConflict(Uuid),
    #[error("replay not found: {0}")]
    NotFound(Uuid),
    #[error("replay store failure: {0}")]
    Store(String),
    #[error("job catalog lookup failed: {0}")]
    Catalog(String),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("invalid replay request: {0}")]
    InvalidRequest(String),
    #[error("replay cancelled")]
    Cancelled,
}

/// Parses the boundary date-range form (`YYYY-MM-DD`, both inclusive) into
/// UTC instants spanning the whole of each day.
pub fn parse_date_range(
    start_date: &str,
    end_date: &str,
) -> Result<(DateTime<Utc>, DateTime<Utc>), ReplayError> {
    let start = parse_date(start_date)?;
    let end = parse_date(end_date)?;
    let start = start
        .and_hms_opt(0, 0, 0)
        .map(|n| n.and_utc())
        .ok_or_else(|| ReplayError::InvalidRequest(format!("invalid start date '{start_date}'")))?;
    let end = end
        .and_hms_opt(23, 59, 59)
        .map(|n| n.and_utc())
        .ok_or_else(|| ReplayError::InvalidRequest(format!("invalid end date '{end_date}'")))?;
    if start > end {
        return Err(ReplayError::InvalidRequest(format!(
            "start date '{start_date}' is after end date '{end_date}'"
        )));
    }
    Ok((start, end))
}

fn parse_date(s: &str) -> Result<NaiveDate, ReplayError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| ReplayError::InvalidRequest(format!("date '{s}' is not YYYY-MM-DD: {e}")))
}
