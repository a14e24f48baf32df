//! Plugin contracts: task units, hook units, and the registry.
//!
//! Plugins live out of process in production; here they are traits the
//! resolver calls across an RPC-shaped boundary. The only capabilities the
//! core needs are upstream-destination inference for tasks and declared
//! ordering for hooks.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::models::{JobConfig, ProjectSpec};

/// Errors crossing the plugin boundary.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin not found: {0}")]
    NotFound(String),
    #[error("plugin call failed: {0}")]
    Rpc(String),
}

/// Input to [DependencyMod::generate_dependencies].
#[derive(Clone, Debug)]
pub struct GenerateDependenciesRequest {
    pub config: JobConfig,
    pub assets: std::collections::BTreeMap<String, String>,
    pub project: ProjectSpec,
}

/// Output of [DependencyMod::generate_dependencies]: upstream destination
/// URNs (opaque strings, e.g. `bigquery://project:dataset.table`).
#[derive(Clone, Debug, Default)]
pub struct GenerateDependenciesResponse {
    pub destinations: Vec<String>,
}

/// Optional task capability: infer upstream destinations from the job's
/// config and assets.
#[async_trait]
pub trait DependencyMod: Send + Sync {
    async fn generate_dependencies(
        &self,
        request: GenerateDependenciesRequest,
    ) -> Result<GenerateDependenciesResponse, PluginError>;
}

/// A task transformation unit.
pub trait TaskPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// The dependency-inference capability, when the plugin supports it.
    fn dependency_mod(&self) -> Option<Arc<dyn DependencyMod>> {
        None
    }
}

/// A hook unit. `depends_on` names the hooks this one must run after.
pub trait HookPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn depends_on(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Looks up task and hook plugins by name.
pub trait PluginRegistry: Send + Sync {
    fn get_task(&self, name: &str) -> Result<Arc<dyn TaskPlugin>, PluginError>;
    fn get_hook(&self, name: &str) -> Result<Arc<dyn HookPlugin>, PluginError>;
}

/// Registry backed by in-process maps, for wiring and tests.
#[derive(Default)]
pub struct InMemoryPluginRegistry {
    tasks: RwLock<HashMap<String, Arc<dyn TaskPlugin>>>,
    hooks: RwLock<HashMap<String, Arc<dyn HookPlugin>>>,
}

impl InMemoryPluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_task(&self, plugin: Arc<dyn TaskPlugin>) -> Result<(), PluginError> {
        self.tasks
            .write()
            .map_err(|e| PluginError::Rpc(e.to_string()))?
            .insert(plugin.name().to_string(), plugin);
        Ok(())
    }

    pub fn register_hook(&self, plugin: Arc<dyn HookPlugin>) -> Result<(), PluginError> {
        self.hooks
            .write()
            .map_err(|e| PluginError::Rpc(e.to_string()))?
            .insert(plugin.name().to_string(), plugin);
        Ok(())
    }
}

impl PluginRegistry for InMemoryPluginRegistry {
    fn get_task(&self, name: &str) -> Result<Arc<dyn TaskPlugin>, PluginError> {
        self.tasks
            .read()
            .map_err(|e| PluginError::Rpc(e.to_string()))?
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }

    fn get_hook(&self, name: &str) -> Result<Arc<dyn HookPlugin>, PluginError> {
        self.hooks
            .read()
            .map_err(|e| PluginError::Rpc(e.to_string()))?
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }
}
