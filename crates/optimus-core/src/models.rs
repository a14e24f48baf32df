//! Spec model: jobs, projects, namespaces, dependencies, hooks.
//!
//! These are immutable value types. The resolver produces derived copies;
//! nothing in this module talks to a store or a plugin.

use std::collections::BTreeMap;
use std::time::Duration;

use uuid::Uuid;

use crate::window::Window;

/// A project groups jobs and namespaces under one configuration scope.
/// Config keys are upper-cased on construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectSpec {
    pub id: Uuid,
    pub name: String,
    pub config: BTreeMap<String, String>,
}

impl ProjectSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            config: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, config: BTreeMap<String, String>) -> Self {
        self.config = config
            .into_iter()
            .map(|(k, v)| (k.to_uppercase(), v))
            .collect();
        self
    }
}

/// A namespace scopes jobs within a project; replay uses it for downstream
/// filtering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceSpec {
    pub id: Uuid,
    pub name: String,
    pub config: BTreeMap<String, String>,
    pub project_name: String,
}

impl NamespaceSpec {
    pub fn new(name: impl Into<String>, project_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            config: BTreeMap::new(),
            project_name: project_name.into(),
        }
    }
}

/// Cron schedule of a job. `start_date` is required; `end_date` stops the
/// schedule when set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSchedule {
    /// Cron expression, standard five-field crontab form.
    pub interval: String,
    pub start_date: chrono::DateTime<chrono::Utc>,
    pub end_date: Option<chrono::DateTime<chrono::Utc>>,
}

/// Retry directive passed through to the scheduler.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobRetry {
    pub count: u32,
    pub delay: Duration,
    pub exponential_backoff: bool,
}

/// Job event categories a notifier can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobEvent {
    Failure,
    SlaMiss,
}

/// Notification routing for a job event category.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobNotifier {
    pub on: JobEvent,
    pub channels: Vec<String>,
}

/// Runtime behavior knobs of a job.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobBehavior {
    pub depends_on_past: bool,
    pub catch_up: bool,
    pub retry: JobRetry,
    pub notifiers: Vec<JobNotifier>,
}

/// One configuration entry. Names are upper-cased by [JobConfig::set].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobConfigItem {
    pub name: String,
    pub value: String,
}

/// Ordered name/value configuration list. Insertion order is preserved;
/// setting an existing name replaces its value in place.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobConfig {
    items: Vec<JobConfigItem>,
}

impl JobConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into().to_uppercase();
        let value = value.into();
        if let Some(item) = self.items.iter_mut().find(|i| i.name == name) {
            item.value = value;
            return;
        }
        self.items.push(JobConfigItem { name, value });
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_uppercase();
        self.items
            .iter()
            .find(|i| i.name == name)
            .map(|i| i.value.as_str())
    }

    pub fn items(&self) -> &[JobConfigItem] {
        &self.items
    }
}

/// The primary transformation unit of a job, provided by a plugin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobTask {
    /// Task plugin name, looked up via the plugin registry.
    pub unit: String,
    pub config: JobConfig,
    pub window: Window,
}

/// How a dependency relates to the resolving project.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DependencyType {
    /// Same project; dependency name is the upstream job name.
    Intra,
    /// Cross-project; dependency name is `project/job`.
    Inter,
    /// Outside any Optimus project; never hydrated from the store.
    Extra,
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyType::Intra => write!(f, "intra"),
            DependencyType::Inter => write!(f, "inter"),
            DependencyType::Extra => write!(f, "extra"),
        }
    }
}

/// Whether the dependency was declared by the user or discovered by the
/// task plugin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DependencySource {
    Static,
    Inferred,
}

/// An upstream dependency of a job. `job`/`project` are populated by the
/// resolver; they stay `None` on a freshly declared static dependency.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSpecDependency {
    pub job: Option<Box<JobSpec>>,
    pub project: Option<ProjectSpec>,
    pub dep_type: DependencyType,
    pub source: DependencySource,
}

impl JobSpecDependency {
    /// A user-declared dependency awaiting hydration.
    pub fn declared(dep_type: DependencyType) -> Self {
        Self {
            job: None,
            project: None,
            dep_type,
            source: DependencySource::Static,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.job.is_some()
    }
}

/// A pre/post runnable bound to a job. `depends_on` is transient: it is
/// cleared and re-derived from the hook plugin on every resolve.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSpecHook {
    /// Hook plugin name, looked up via the plugin registry.
    pub unit: String,
    pub config: JobConfig,
    pub depends_on: Vec<String>,
}

impl JobSpecHook {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            config: JobConfig::new(),
            depends_on: Vec::new(),
        }
    }
}

/// A scheduled transformation: one task, optional hooks, declared and
/// inferred upstream dependencies.
///
/// Dependencies are keyed by the upstream job name (or `project/job` for
/// cross-project static declarations). The map is ordered so repeated
/// resolution yields identical output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub owner: String,
    pub description: String,
    pub labels: BTreeMap<String, String>,
    pub schedule: JobSchedule,
    pub behavior: JobBehavior,
    pub task: JobTask,
    pub assets: BTreeMap<String, String>,
    pub dependencies: BTreeMap<String, JobSpecDependency>,
    pub hooks: Vec<JobSpecHook>,
}

impl JobSpec {
    pub fn hook_by_name(&self, name: &str) -> Option<&JobSpecHook> {
        self.hooks.iter().find(|h| h.unit == name)
    }

    /// Structural checks applied when a spec enters a store: non-empty name
    /// and unique hook names.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.name.is_empty() {
            return Err(SpecError::EmptyJobName);
        }
        let mut seen = std::collections::BTreeSet::new();
        for hook in &self.hooks {
            if !seen.insert(hook.unit.as_str()) {
                return Err(SpecError::DuplicateHook {
                    job: self.name.clone(),
                    hook: hook.unit.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Structural spec violations caught at load time.
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("job name must not be empty")]
    EmptyJobName,
    #[error("duplicate hook '{hook}' in job '{job}'")]
    DuplicateHook { job: String, hook: String },
    #[error("window size must be positive")]
    NonPositiveWindowSize,
    #[error("unsupported window truncate unit: '{0}'")]
    UnsupportedTruncateUnit(String),
    #[error("malformed duration: '{0}'")]
    MalformedDuration(String),
}
