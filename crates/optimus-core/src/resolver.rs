//! Dependency resolver: hydrates a job spec with inferred, static, and
//! hook dependencies.
//!
//! Resolution runs in three strict phases. Inferred dependencies come from
//! the task plugin's destination URNs matched against the catalog; static
//! dependencies are user declarations hydrated by name; hook ordering is
//! re-derived from hook plugins on every resolve. The resolver is pure with
//! respect to its inputs: resolving the same spec against the same catalog
//! twice yields identical output.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::{
    DependencySource, DependencyType, JobSpec, JobSpecDependency, ProjectSpec,
};
use crate::plugin::{GenerateDependenciesRequest, PluginError, PluginRegistry};
use crate::progress::{notify, ProgressEvent, ProgressObserver};
use crate::store::{ProjectJobPair, ProjectJobSpecStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("plugin unavailable: {0}")]
    PluginUnavailable(String),
    #[error("dependency generation failed for job '{job}': {reason}")]
    DependencyGeneration { job: String, reason: String },
    #[error("unknown local dependency '{dependency}' for job '{job}'")]
    UnknownLocalDependency { job: String, dependency: String },
    #[error("unknown cross project dependency '{dependency}' for job '{job}'")]
    UnknownCrossProjectDependency { job: String, dependency: String },
    #[error("inter dependency should be in 'project_name/job_name' format: '{0}'")]
    MalformedCrossProjectName(String),
    #[error("unsupported dependency type '{dep_type}' on '{dependency}'")]
    UnsupportedDependencyType { dependency: String, dep_type: String },
    #[error("hook dependency cycle in job '{job}' involving hook '{hook}'")]
    HookCycle { job: String, hook: String },
    #[error("store lookup failed: {0}")]
    Store(String),
    #[error("resolution cancelled")]
    Cancelled,
}

/// Resolves inferred, static, and hook dependencies of job specs against
/// the plugin registry and the cross-project job catalog.
pub struct DependencyResolver {
    plugins: Arc<dyn PluginRegistry>,
    store: Arc<dyn ProjectJobSpecStore>,
}

impl DependencyResolver {
    pub fn new(plugins: Arc<dyn PluginRegistry>, store: Arc<dyn ProjectJobSpecStore>) -> Self {
        Self { plugins, store }
    }

    /// Hydrates `job`: inferred dependencies populated, static dependencies
    /// resolved to their (project, job) pair, hook ordering re-derived.
    pub async fn resolve(
        &self,
        token: &CancellationToken,
        project: &ProjectSpec,
        job: JobSpec,
        observer: Option<&dyn ProgressObserver>,
    ) -> Result<JobSpec, ResolveError> {
        if token.is_cancelled() {
            return Err(ResolveError::Cancelled);
        }
        let job = self.resolve_inferred(project, job, observer).await?;

        if token.is_cancelled() {
            return Err(ResolveError::Cancelled);
        }
        let job = self.resolve_static(project, job).await?;

        if token.is_cancelled() {
            return Err(ResolveError::Cancelled);
        }
        let job = self.resolve_hooks(job)?;

        notify(
            observer,
            ProgressEvent::JobResolved {
                project: project.name.clone(),
                job: job.name.clone(),
            },
        );
        Ok(job)
    }

    /// Phase one: destinations inferred by the task plugin, matched against
    /// the catalog. An unmatched destination is reported, not fatal: the
    /// upstream may be registered outside Optimus.
    async fn resolve_inferred(
        &self,
        project: &ProjectSpec,
        mut job: JobSpec,
        observer: Option<&dyn ProgressObserver>,
    ) -> Result<JobSpec, ResolveError> {
        let task = self
            .plugins
            .get_task(&job.task.unit)
            .map_err(plugin_unavailable)?;
        let dependency_mod = match task.dependency_mod() {
            Some(dependency_mod) => dependency_mod,
            None => return Ok(job),
        };

        let response = dependency_mod
            .generate_dependencies(GenerateDependenciesRequest {
                config: job.task.config.clone(),
                assets: job.assets.clone(),
                project: project.clone(),
            })
            .await
            .map_err(|e| ResolveError::DependencyGeneration {
                job: job.name.clone(),
                reason: e.to_string(),
            })?;
        debug!(
            job = %job.name,
            destinations = response.destinations.len(),
            "inferred upstream destinations"
        );

        for destination in &response.destinations {
            let pairs = match self.store.get_by_destination(destination).await {
                Ok(pairs) => pairs,
                Err(StoreError::NotFound(_)) => Vec::new(),
                Err(e) => return Err(ResolveError::Store(e.to_string())),
            };
            if pairs.is_empty() {
                notify(
                    observer,
                    ProgressEvent::UnknownDependencyUsed {
                        job: job.name.clone(),
                        dependency: destination.clone(),
                    },
                );
                continue;
            }
            let dep = extract_dependency(pairs, project);
            let key = dep
                .job
                .as_ref()
                .map(|j| j.name.clone())
                .unwrap_or_default();
            // Static declarations under the same key take precedence.
            job.dependencies.entry(key).or_insert(dep);
        }
        Ok(job)
    }

    /// Phase two: hydrate user-declared dependencies that are still
    /// unresolved. A miss here is fatal, unlike inferred matching.
    async fn resolve_static(
        &self,
        project: &ProjectSpec,
        mut job: JobSpec,
    ) -> Result<JobSpec, ResolveError> {
        let unresolved: Vec<String> = job
            .dependencies
            .iter()
            .filter(|(_, dep)| !dep.is_resolved())
            .map(|(name, _)| name.clone())
            .collect();

        for dep_name in unresolved {
            let dep_type = match job.dependencies.get(&dep_name) {
                Some(dep) => dep.dep_type,
                None => continue,
            };
            let pair = match dep_type {
                DependencyType::Intra => self
                    .store
                    .get_by_name(&project.name, &dep_name)
                    .await
                    .map_err(|e| match e {
                        StoreError::NotFound(_) => ResolveError::UnknownLocalDependency {
                            job: job.name.clone(),
                            dependency: dep_name.clone(),
                        },
                        other => ResolveError::Store(other.to_string()),
                    })?,
                DependencyType::Inter => {
                    let (project_name, job_name) = dep_name
                        .split_once('/')
                        .ok_or_else(|| ResolveError::MalformedCrossProjectName(dep_name.clone()))?;
                    self.store
                        .get_by_name(project_name, job_name)
                        .await
                        .map_err(|e| match e {
                            StoreError::NotFound(_) => ResolveError::UnknownCrossProjectDependency {
                                job: job.name.clone(),
                                dependency: dep_name.clone(),
                            },
                            other => ResolveError::Store(other.to_string()),
                        })?
                }
                DependencyType::Extra => {
                    return Err(ResolveError::UnsupportedDependencyType {
                        dependency: dep_name.clone(),
                        dep_type: dep_type.to_string(),
                    })
                }
            };
            if let Some(dep) = job.dependencies.get_mut(&dep_name) {
                dep.job = Some(Box::new(pair.job));
                dep.project = Some(pair.project);
            }
        }
        Ok(job)
    }

    /// Phase three: clear and re-derive hook ordering from the hook
    /// plugins. References to hooks absent from this job are skipped; the
    /// derived ordering must form a DAG.
    fn resolve_hooks(&self, mut job: JobSpec) -> Result<JobSpec, ResolveError> {
        let present: BTreeSet<String> = job.hooks.iter().map(|h| h.unit.clone()).collect();
        for hook in job.hooks.iter_mut() {
            hook.depends_on.clear();
            let plugin = self
                .plugins
                .get_hook(&hook.unit)
                .map_err(plugin_unavailable)?;
            for wanted in plugin.depends_on() {
                if present.contains(&wanted) {
                    hook.depends_on.push(wanted);
                }
            }
        }
        verify_hook_ordering(&job)?;
        Ok(job)
    }
}

/// Depth-first check that the derived hook ordering has no cycle.
fn verify_hook_ordering(job: &JobSpec) -> Result<(), ResolveError> {
    fn visit<'a>(
        job: &'a JobSpec,
        name: &'a str,
        in_path: &mut Vec<&'a str>,
        done: &mut BTreeSet<&'a str>,
    ) -> Result<(), ResolveError> {
        if done.contains(name) {
            return Ok(());
        }
        if in_path.contains(&name) {
            return Err(ResolveError::HookCycle {
                job: job.name.clone(),
                hook: name.to_string(),
            });
        }
        in_path.push(name);
        if let Some(hook) = job.hook_by_name(name) {
            for upstream in &hook.depends_on {
                visit(job, upstream, in_path, done)?;
            }
        }
        in_path.pop();
        done.insert(name);
        Ok(())
    }

    let mut done = BTreeSet::new();
    for hook in &job.hooks {
        visit(job, &hook.unit, &mut Vec::new(), &mut done)?;
    }
    Ok(())
}

fn plugin_unavailable(e: PluginError) -> ResolveError {
    ResolveError::PluginUnavailable(e.to_string())
}

/// Picks the upstream pair for a destination with one or more matches.
/// Pairs are ordered lexicographically by (project, job) first so repeated
/// resolves give identical graphs; the resolving project wins when present.
fn extract_dependency(mut pairs: Vec<ProjectJobPair>, project: &ProjectSpec) -> JobSpecDependency {
    pairs.sort_by(|a, b| {
        (a.project.name.as_str(), a.job.name.as_str())
            .cmp(&(b.project.name.as_str(), b.job.name.as_str()))
    });
    let position = pairs
        .iter()
        .position(|pair| pair.project.name == project.name)
        .unwrap_or(0);
    let dep_type = if pairs[position].project.name == project.name {
        DependencyType::Intra
    } else {
        DependencyType::Inter
    };
    let pair = pairs.swap_remove(position);
    JobSpecDependency {
        job: Some(Box::new(pair.job)),
        project: Some(pair.project),
        dep_type,
        source: DependencySource::Inferred,
    }
}
