//! Scheduler contract and the retry discipline for calls across it.
//!
//! The scheduler is an external, eventually-consistent system. Transient
//! failures are retried with exponential backoff; fatal refusals are not.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::models::ReplayError;

/// State of a single scheduled run as the scheduler reports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskRunState {
    Pending,
    Running,
    Success,
    Failed,
}

impl TaskRunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskRunState::Success | TaskRunState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskRunState::Pending => "pending",
            TaskRunState::Running => "running",
            TaskRunState::Success => "success",
            TaskRunState::Failed => "failed",
        }
    }
}

/// Errors crossing the scheduler boundary. Transient covers timeouts and
/// 5xx-shaped failures; Fatal covers 4xx-shaped refusals.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("transient scheduler failure: {0}")]
    Transient(String),
    #[error("scheduler refused request: {0}")]
    Fatal(String),
}

/// Contract against the external DAG runner.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Clears the state of a past run so it can be re-executed.
    async fn clear(
        &self,
        project_name: &str,
        job_name: &str,
        run: DateTime<Utc>,
    ) -> Result<(), SchedulerError>;

    /// Requests re-execution of a cleared run.
    async fn trigger(
        &self,
        project_name: &str,
        job_name: &str,
        run: DateTime<Utc>,
    ) -> Result<(), SchedulerError>;

    /// Current state of the run instant.
    async fn run_status(
        &self,
        project_name: &str,
        job_name: &str,
        run: DateTime<Utc>,
    ) -> Result<TaskRunState, SchedulerError>;
}

/// Exponential backoff for transient scheduler failures.
#[derive(Clone, Copy, Debug)]
pub struct RetryBackoff {
    pub initial: Duration,
    pub factor: u32,
    pub max_retries: u32,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            factor: 2,
            max_retries: 3,
        }
    }
}

impl RetryBackoff {
    /// Delay before retry number `attempt` (0-based): `initial * factor^attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.initial * self.factor.saturating_pow(attempt)
    }
}

/// Runs `op`, retrying transient failures per `backoff`. Exhausted retries
/// classify as [ReplayError::SchedulerUnavailable]; fatal errors surface
/// immediately and are never retried.
pub async fn with_retry<T, F, Fut>(
    backoff: &RetryBackoff,
    token: &CancellationToken,
    mut op: F,
) -> Result<T, ReplayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SchedulerError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(SchedulerError::Fatal(reason)) => return Err(ReplayError::SchedulerFatal(reason)),
            Err(SchedulerError::Transient(reason)) => {
                if attempt >= backoff.max_retries {
                    return Err(ReplayError::SchedulerUnavailable(reason));
                }
                let delay = backoff.delay(attempt);
                attempt += 1;
                tokio::select! {
                    _ = token.cancelled() => return Err(ReplayError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
