//! Replay request persistence contract.
//!
//! Status writes use optimistic concurrency: callers pass the version they
//! read, and a mismatch is a conflict rather than a silent clobber. The
//! store also enforces the status state machine so no implementation can
//! move a request backwards.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use optimus_core::{Clock, SystemClock};

use crate::models::{ReplayRequest, ReplayStatus};

#[derive(Debug, thiserror::Error)]
pub enum ReplayStoreError {
    #[error("replay not found: {0}")]
    NotFound(Uuid),
    #[error("version conflict on replay {id}: expected {expected}, found {actual}")]
    Conflict {
        id: Uuid,
        expected: u64,
        actual: u64,
    },
    #[error("illegal status transition {from:?} -> {to:?} on replay {id}")]
    InvalidTransition {
        id: Uuid,
        from: ReplayStatus,
        to: ReplayStatus,
    },
    #[error("replay store failure: {0}")]
    Internal(String),
}

/// Persistence contract for replay requests.
#[async_trait]
pub trait ReplayStore: Send + Sync {
    async fn insert(&self, request: &ReplayRequest) -> Result<(), ReplayStoreError>;

    /// Moves the request to `status` iff the stored version matches
    /// `expected_version` and the transition is legal. Returns the updated
    /// request (version bumped).
    async fn update_status(
        &self,
        id: Uuid,
        status: ReplayStatus,
        expected_version: u64,
    ) -> Result<ReplayRequest, ReplayStoreError>;

    async fn get(&self, id: Uuid) -> Result<ReplayRequest, ReplayStoreError>;

    /// Non-terminal requests for the given (project, root job).
    async fn get_in_progress(
        &self,
        project_name: &str,
        job_name: &str,
    ) -> Result<Vec<ReplayRequest>, ReplayStoreError>;

    async fn list(&self, project_name: &str) -> Result<Vec<ReplayRequest>, ReplayStoreError>;
}

/// In-process store for wiring and tests.
pub struct InMemoryReplayStore {
    requests: RwLock<HashMap<Uuid, ReplayRequest>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryReplayStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl InMemoryReplayStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl ReplayStore for InMemoryReplayStore {
    async fn insert(&self, request: &ReplayRequest) -> Result<(), ReplayStoreError> {
        let mut requests = self
            .requests
            .write()
            .map_err(|e| ReplayStoreError::Internal(e.to_string()))?;
        requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ReplayStatus,
        expected_version: u64,
    ) -> Result<ReplayRequest, ReplayStoreError> {
        let mut requests = self
            .requests
            .write()
            .map_err(|e| ReplayStoreError::Internal(e.to_string()))?;
        let request = requests.get_mut(&id).ok_or(ReplayStoreError::NotFound(id))?;
        if request.version != expected_version {
            return Err(ReplayStoreError::Conflict {
                id,
                expected: expected_version,
                actual: request.version,
            });
        }
        if !request.status.can_transition(status) {
            return Err(ReplayStoreError::InvalidTransition {
                id,
                from: request.status,
                to: status,
            });
        }
        request.status = status;
        request.version += 1;
        request.updated_at = self.clock.now();
        Ok(request.clone())
    }

    async fn get(&self, id: Uuid) -> Result<ReplayRequest, ReplayStoreError> {
        self.requests
            .read()
            .map_err(|e| ReplayStoreError::Internal(e.to_string()))?
            .get(&id)
            .cloned()
            .ok_or(ReplayStoreError::NotFound(id))
    }

    async fn get_in_progress(
        &self,
        project_name: &str,
        job_name: &str,
    ) -> Result<Vec<ReplayRequest>, ReplayStoreError> {
        let requests = self
            .requests
            .read()
            .map_err(|e| ReplayStoreError::Internal(e.to_string()))?;
        let mut active: Vec<ReplayRequest> = requests
            .values()
            .filter(|r| {
                r.project == project_name && r.job == job_name && !r.status.is_terminal()
            })
            .cloned()
            .collect();
        active.sort_by_key(|r| (r.created_at, r.id));
        Ok(active)
    }

    async fn list(&self, project_name: &str) -> Result<Vec<ReplayRequest>, ReplayStoreError> {
        let requests = self
            .requests
            .read()
            .map_err(|e| ReplayStoreError::Internal(e.to_string()))?;
        let mut all: Vec<ReplayRequest> = requests
            .values()
            .filter(|r| r.project == project_name)
            .cloned()
            .collect();
        all.sort_by_key(|r| (r.created_at, r.id));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use optimus_core::FixedClock;
    use std::collections::BTreeSet;

    fn request(project: &str, job: &str) -> ReplayRequest {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        ReplayRequest::new(
            project,
            "ns1",
            job,
            now,
            now + chrono::Duration::days(2),
            false,
            BTreeSet::from(["ns1".to_string()]),
            now,
        )
    }

    fn store() -> InMemoryReplayStore {
        InMemoryReplayStore::with_clock(Arc::new(FixedClock(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        )))
    }

    #[tokio::test]
    async fn update_status_bumps_version() {
        let store = store();
        let request = request("p1", "a");
        store.insert(&request).await.unwrap();

        let updated = store
            .update_status(request.id, ReplayStatus::Planned, 1)
            .await
            .unwrap();
        assert_eq!(updated.status, ReplayStatus::Planned);
        assert_eq!(updated.version, 2);
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let store = store();
        let request = request("p1", "a");
        store.insert(&request).await.unwrap();
        store
            .update_status(request.id, ReplayStatus::Planned, 1)
            .await
            .unwrap();

        assert!(matches!(
            store
                .update_status(request.id, ReplayStatus::InProgress, 1)
                .await,
            Err(ReplayStoreError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn illegal_transition_rejected() {
        let store = store();
        let request = request("p1", "a");
        store.insert(&request).await.unwrap();

        assert!(matches!(
            store
                .update_status(request.id, ReplayStatus::Success, 1)
                .await,
            Err(ReplayStoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn in_progress_excludes_terminal_requests() {
        let store = store();
        let first = request("p1", "a");
        store.insert(&first).await.unwrap();
        store
            .update_status(first.id, ReplayStatus::Cancelled, 1)
            .await
            .unwrap();

        let second = request("p1", "a");
        store.insert(&second).await.unwrap();
        let other_job = request("p1", "b");
        store.insert(&other_job).await.unwrap();

        let active = store.get_in_progress("p1", "a").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);
    }
}
