//! Optimus core: spec model, plugin/store contracts, and the dependency
//! resolver.
//!
//! Jobs declare a scheduled task plus hooks, assets, and dependencies;
//! the resolver hydrates the full upstream graph (plugin-inferred plus
//! static plus hook ordering) against a cross-project catalog. Replay
//! planning and execution build on this crate.

pub mod models;
pub mod plugin;
pub mod progress;
pub mod resolver;
pub mod schedule;
pub mod store;
pub mod window;

pub use models::{
    DependencySource, DependencyType, JobBehavior, JobConfig, JobConfigItem, JobEvent,
    JobNotifier, JobRetry, JobSchedule, JobSpec, JobSpecDependency, JobSpecHook, JobTask,
    NamespaceSpec, ProjectSpec, SpecError,
};
pub use plugin::{
    DependencyMod, GenerateDependenciesRequest, GenerateDependenciesResponse, HookPlugin,
    InMemoryPluginRegistry, PluginError, PluginRegistry, TaskPlugin,
};
pub use progress::{notify, ProgressEvent, ProgressObserver, RecordingObserver};
pub use resolver::{DependencyResolver, ResolveError};
pub use schedule::{enumerate_runs, parse_cron, Clock, FixedClock, ScheduleError, SystemClock};
pub use store::{InMemoryProjectJobStore, ProjectJobPair, ProjectJobSpecStore, StoreError};
pub use window::{TruncateUnit, Window};
