//! Optimus replay: bounded, windowed re-execution of a job and its
//! downstream dependents.
//!
//! The planner expands a resolved job and its allowed dependents into an
//! execution tree of per-job run instants; the executor persists the
//! request, serializes replays per (project, root job), and drives the
//! external scheduler run by run, honoring parent-before-child ordering at
//! each instant.

pub mod executor;
pub mod models;
pub mod planner;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod tree;

pub use executor::{ReplayExecutor, ReplayExecutorConfig};
pub use models::{parse_date_range, ReplayError, ReplayRequest, ReplayStatus};
pub use planner::{ReplayPlan, ReplayPlanner, ALL_NAMESPACES};
pub use scheduler::{with_retry, RetryBackoff, Scheduler, SchedulerError, TaskRunState};
pub use service::{ReplayCommand, ReplayService};
pub use store::{InMemoryReplayStore, ReplayStore, ReplayStoreError};
pub use tree::{node_key, ExecutionTree, ExecutionTreeNode};
