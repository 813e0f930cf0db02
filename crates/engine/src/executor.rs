//! The executor registry.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use trellis_workflow::{Step, StepResult};

use crate::context::ExecutionContext;
use crate::error::EngineError;

/// A step executor: the thing a leaf step's type tag names.
///
/// Executors are registered once at bootstrap and shared across executions,
/// so implementations hold only immutable or internally synchronized state.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// One-time initialization at process bootstrap.
    async fn init(&self, _config: &Map<String, Value>) -> Result<(), EngineError> {
        Ok(())
    }

    /// Execute one step invocation.
    ///
    /// Infrastructure failures are `Err`; domain failures (an HTTP error, a
    /// failed assertion) are `Ok` results with a failure status, so the
    /// kernel can apply retry and continue-on-error policy uniformly.
    async fn execute(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
    ) -> Result<StepResult, EngineError>;

    /// Teardown at process shutdown.
    async fn cleanup(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Process-wide mapping of type tags to executors, with alias support.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn StepExecutor>>>,
    aliases: RwLock<HashMap<String, String>>,
}

impl ExecutorRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under `tag`.
    ///
    /// Duplicate registration is a startup error.
    pub fn register(
        &self,
        tag: impl Into<String>,
        executor: Arc<dyn StepExecutor>,
    ) -> Result<(), EngineError> {
        let tag = tag.into();
        let mut executors = self.executors.write();
        if executors.contains_key(&tag) || self.aliases.read().contains_key(&tag) {
            return Err(EngineError::DuplicateExecutor(tag));
        }
        executors.insert(tag, executor);
        Ok(())
    }

    /// Register `alias` as another name for `target` (possibly itself an
    /// alias; resolution is transitive).
    pub fn alias(
        &self,
        alias: impl Into<String>,
        target: impl Into<String>,
    ) -> Result<(), EngineError> {
        let alias = alias.into();
        if self.executors.read().contains_key(&alias) || self.aliases.read().contains_key(&alias) {
            return Err(EngineError::DuplicateExecutor(alias));
        }
        self.aliases.write().insert(alias, target.into());
        Ok(())
    }

    /// The canonical tag `tag` resolves to, following aliases.
    pub fn canonical_tag(&self, tag: &str) -> Result<String, EngineError> {
        let aliases = self.aliases.read();
        let mut current = tag.to_owned();
        let mut visited = HashSet::new();
        while let Some(next) = aliases.get(&current) {
            if !visited.insert(current.clone()) {
                return Err(EngineError::AliasCycle(tag.to_owned()));
            }
            current = next.clone();
        }
        Ok(current)
    }

    /// Resolve a tag (through aliases) to its executor.
    pub fn resolve(&self, tag: &str) -> Result<Arc<dyn StepExecutor>, EngineError> {
        let canonical = self.canonical_tag(tag)?;
        self.executors
            .read()
            .get(&canonical)
            .cloned()
            .ok_or_else(|| EngineError::UnknownExecutor(tag.to_owned()))
    }

    /// Registered canonical tags.
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        self.executors.read().keys().cloned().collect()
    }

    /// Run every executor's `init`.
    pub async fn init_all(&self, config: &Map<String, Value>) -> Result<(), EngineError> {
        let executors: Vec<Arc<dyn StepExecutor>> =
            self.executors.read().values().cloned().collect();
        for executor in executors {
            executor.init(config).await?;
        }
        Ok(())
    }

    /// Run every executor's `cleanup`.
    pub async fn cleanup_all(&self) -> Result<(), EngineError> {
        let executors: Vec<Arc<dyn StepExecutor>> =
            self.executors.read().values().cloned().collect();
        for executor in executors {
            executor.cleanup().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("tags", &self.tags())
            .field("aliases", &*self.aliases.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Echo;

    #[async_trait]
    impl StepExecutor for Echo {
        async fn execute(
            &self,
            step: &Step,
            _ctx: &ExecutionContext,
        ) -> Result<StepResult, EngineError> {
            Ok(StepResult::success(step.id.clone(), serde_json::json!("echo")))
        }
    }

    #[test]
    fn register_and_resolve() {
        let registry = ExecutorRegistry::new();
        registry.register("echo", Arc::new(Echo)).unwrap();
        assert!(registry.resolve("echo").is_ok());
        assert!(matches!(
            registry.resolve("missing"),
            Err(EngineError::UnknownExecutor(_))
        ));
    }

    #[test]
    fn duplicate_registration_is_fatal() {
        let registry = ExecutorRegistry::new();
        registry.register("echo", Arc::new(Echo)).unwrap();
        assert!(matches!(
            registry.register("echo", Arc::new(Echo)),
            Err(EngineError::DuplicateExecutor(_))
        ));
    }

    #[test]
    fn aliases_resolve_transitively() {
        let registry = ExecutorRegistry::new();
        registry.register("http", Arc::new(Echo)).unwrap();
        registry.alias("api", "http").unwrap();
        registry.alias("rest", "api").unwrap();

        assert_eq!(registry.canonical_tag("rest").unwrap(), "http");
        assert!(registry.resolve("rest").is_ok());
    }

    #[test]
    fn alias_cycles_are_detected() {
        let registry = ExecutorRegistry::new();
        registry.alias("a", "b").unwrap();
        registry.alias("b", "a").unwrap();
        assert!(matches!(
            registry.resolve("a"),
            Err(EngineError::AliasCycle(_))
        ));
    }

    #[test]
    fn alias_over_existing_tag_rejected() {
        let registry = ExecutorRegistry::new();
        registry.register("http", Arc::new(Echo)).unwrap();
        assert!(registry.alias("http", "other").is_err());
    }
}
