//! Project job store: resolves names and destinations to (project, job)
//! pairs across projects.
//!
//! The production store is relational; the contract here is what the
//! resolver and planner consume. `get_by_destination` and `get_dependents`
//! must return pairs in a stable order so resolution stays deterministic.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::models::{JobSpec, NamespaceSpec, ProjectSpec, SpecError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("invalid spec: {0}")]
    InvalidSpec(#[from] SpecError),
    #[error("store failure: {0}")]
    Internal(String),
}

/// A job together with the project and namespace that own it.
#[derive(Clone, Debug)]
pub struct ProjectJobPair {
    pub project: ProjectSpec,
    pub namespace: NamespaceSpec,
    pub job: JobSpec,
}

/// Read contract over the job catalog, spanning every project visible to
/// the caller.
#[async_trait]
pub trait ProjectJobSpecStore: Send + Sync {
    /// The named job within the named project.
    async fn get_by_name(
        &self,
        project_name: &str,
        job_name: &str,
    ) -> Result<ProjectJobPair, StoreError>;

    /// Every job whose task declares the given destination URN, across all
    /// projects, ordered by (project, job) name.
    async fn get_by_destination(
        &self,
        destination: &str,
    ) -> Result<Vec<ProjectJobPair>, StoreError>;

    /// Every job that depends on the given job (the reverse edge of the
    /// dependency graph), ordered by (project, job) name.
    async fn get_dependents(
        &self,
        project_name: &str,
        job_name: &str,
    ) -> Result<Vec<ProjectJobPair>, StoreError>;
}

struct StoredJob {
    job: JobSpec,
    namespace_name: String,
    destination: Option<String>,
}

#[derive(Default)]
struct StoreInner {
    projects: BTreeMap<String, ProjectSpec>,
    namespaces: BTreeMap<(String, String), NamespaceSpec>,
    jobs: BTreeMap<(String, String), StoredJob>,
}

/// In-process catalog used for wiring and tests. Jobs are registered with
/// their namespace and (optionally) the destination URN their task writes
/// to; dependent lookups are derived from registered dependencies.
#[derive(Default)]
pub struct InMemoryProjectJobStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryProjectJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_project(&self, project: ProjectSpec) -> Result<(), StoreError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        inner.projects.insert(project.name.clone(), project);
        Ok(())
    }

    pub fn add_namespace(&self, namespace: NamespaceSpec) -> Result<(), StoreError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        if !inner.projects.contains_key(&namespace.project_name) {
            return Err(StoreError::NotFound(format!(
                "project '{}'",
                namespace.project_name
            )));
        }
        inner.namespaces.insert(
            (namespace.project_name.clone(), namespace.name.clone()),
            namespace,
        );
        Ok(())
    }

    pub fn add_job(
        &self,
        project_name: &str,
        namespace_name: &str,
        job: JobSpec,
        destination: Option<&str>,
    ) -> Result<(), StoreError> {
        job.validate()?;
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        if !inner.projects.contains_key(project_name) {
            return Err(StoreError::NotFound(format!("project '{}'", project_name)));
        }
        if !inner
            .namespaces
            .contains_key(&(project_name.to_string(), namespace_name.to_string()))
        {
            return Err(StoreError::NotFound(format!(
                "namespace '{}/{}'",
                project_name, namespace_name
            )));
        }
        inner.jobs.insert(
            (project_name.to_string(), job.name.clone()),
            StoredJob {
                job,
                namespace_name: namespace_name.to_string(),
                destination: destination.map(str::to_string),
            },
        );
        Ok(())
    }
}

impl StoreInner {
    fn pair(&self, project_name: &str, stored: &StoredJob) -> Result<ProjectJobPair, StoreError> {
        let project = self
            .projects
            .get(project_name)
            .ok_or_else(|| StoreError::NotFound(format!("project '{}'", project_name)))?;
        let namespace = self
            .namespaces
            .get(&(project_name.to_string(), stored.namespace_name.clone()))
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "namespace '{}/{}'",
                    project_name, stored.namespace_name
                ))
            })?;
        Ok(ProjectJobPair {
            project: project.clone(),
            namespace: namespace.clone(),
            job: stored.job.clone(),
        })
    }

    /// Whether `stored` (owned by `owner_project`) depends on
    /// (`project_name`, `job_name`), either through a hydrated pair or a
    /// still-unresolved static declaration.
    fn depends_on(
        &self,
        owner_project: &str,
        stored: &StoredJob,
        project_name: &str,
        job_name: &str,
    ) -> bool {
        stored.job.dependencies.iter().any(|(dep_name, dep)| {
            if let (Some(job), Some(project)) = (&dep.job, &dep.project) {
                return job.name == job_name && project.name == project_name;
            }
            match dep.dep_type {
                crate::models::DependencyType::Intra => {
                    owner_project == project_name && dep_name == job_name
                }
                crate::models::DependencyType::Inter => {
                    dep_name == &format!("{}/{}", project_name, job_name)
                }
                crate::models::DependencyType::Extra => false,
            }
        })
    }
}

#[async_trait]
impl ProjectJobSpecStore for InMemoryProjectJobStore {
    async fn get_by_name(
        &self,
        project_name: &str,
        job_name: &str,
    ) -> Result<ProjectJobPair, StoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let stored = inner
            .jobs
            .get(&(project_name.to_string(), job_name.to_string()))
            .ok_or_else(|| StoreError::NotFound(format!("job '{}/{}'", project_name, job_name)))?;
        inner.pair(project_name, stored)
    }

    async fn get_by_destination(
        &self,
        destination: &str,
    ) -> Result<Vec<ProjectJobPair>, StoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let mut pairs = Vec::new();
        for ((project_name, _), stored) in &inner.jobs {
            if stored.destination.as_deref() == Some(destination) {
                pairs.push(inner.pair(project_name, stored)?);
            }
        }
        Ok(pairs)
    }

    async fn get_dependents(
        &self,
        project_name: &str,
        job_name: &str,
    ) -> Result<Vec<ProjectJobPair>, StoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let mut pairs = Vec::new();
        for ((owner_project, _), stored) in &inner.jobs {
            if inner.depends_on(owner_project, stored, project_name, job_name) {
                pairs.push(inner.pair(owner_project, stored)?);
            }
        }
        Ok(pairs)
    }
}
