//! Lookup scope for expression evaluation and variable resolution.

use serde_json::{Map, Value};
use std::collections::HashMap;

/// The data a `${path}` reference resolves against.
///
/// Lookup order for a path root is variables first, then step results. The
/// env overlay holds execution-scoped environment variables; `env.NAME`
/// references consult it before the process environment.
#[derive(Debug, Clone, Default)]
pub struct EvalScope {
    variables: Map<String, Value>,
    results: Map<String, Value>,
    env: HashMap<String, String>,
}

impl EvalScope {
    /// An empty scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a scope from complete variable and result maps.
    #[must_use]
    pub fn with_maps(variables: Map<String, Value>, results: Map<String, Value>) -> Self {
        Self {
            variables,
            results,
            env: HashMap::new(),
        }
    }

    /// Set a variable.
    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// Set a step result, keyed by step id.
    pub fn set_result(&mut self, step_id: impl Into<String>, value: Value) {
        self.results.insert(step_id.into(), value);
    }

    /// Set an execution-scoped environment variable.
    pub fn set_env(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.env.insert(name.into(), value.into());
    }

    /// Replace the env overlay wholesale.
    pub fn set_env_map(&mut self, env: HashMap<String, String>) {
        self.env = env;
    }

    /// The variables map.
    #[must_use]
    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    /// The results map.
    #[must_use]
    pub fn results(&self) -> &Map<String, Value> {
        &self.results
    }

    /// Look up a path root: variables first, then results.
    #[must_use]
    pub fn root(&self, name: &str) -> Option<&Value> {
        self.variables.get(name).or_else(|| self.results.get(name))
    }

    /// Look up `env.NAME`: the overlay first, then the process environment.
    #[must_use]
    pub fn env_var(&self, name: &str) -> Option<String> {
        self.env
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn variables_shadow_results() {
        let mut scope = EvalScope::new();
        scope.set_result("login", json!({"status": 500}));
        scope.set_variable("login", json!({"status": 200}));
        assert_eq!(scope.root("login").unwrap()["status"], 200);
    }

    #[test]
    fn results_used_when_no_variable() {
        let mut scope = EvalScope::new();
        scope.set_result("login", json!({"status": 200}));
        assert_eq!(scope.root("login").unwrap()["status"], 200);
    }

    #[test]
    fn env_overlay_wins_over_process_env() {
        let mut scope = EvalScope::new();
        scope.set_env("PATH", "overlaid");
        assert_eq!(scope.env_var("PATH").as_deref(), Some("overlaid"));
    }

    #[test]
    fn env_unset_is_none() {
        let scope = EvalScope::new();
        assert_eq!(scope.env_var("TRELLIS_DEFINITELY_UNSET_VAR_42"), None);
    }
}
