//! Built-in step executors.
//!
//! `http` and `script` are the workhorse leaves; `assertion` exists mainly
//! so hooks can gate entities through the same registry steps use.
//! Control-flow (sequence, parallel, loop, condition) lives in the kernel,
//! where its semantics are inseparable from dispatch.

pub mod assertion;
pub mod http;
pub mod script;

pub use assertion::AssertionExecutor;
pub use http::HttpExecutor;
pub use script::ScriptExecutor;

use std::sync::Arc;

use crate::error::EngineError;
use crate::executor::ExecutorRegistry;

/// Register the built-in executors and their conventional aliases.
pub fn register_builtins(registry: &ExecutorRegistry) -> Result<(), EngineError> {
    registry.register("http", Arc::new(HttpExecutor::new()))?;
    registry.alias("api", "http")?;
    registry.register("script", Arc::new(ScriptExecutor))?;
    registry.alias("js", "script")?;
    registry.register("assertion", Arc::new(AssertionExecutor))?;
    Ok(())
}
