#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Trellis Engine
//!
//! The workflow execution kernel and everything a step passes through on
//! its way to a result: the executor registry, the built-in HTTP and script
//! executors, the hook runner, the processor pipeline, per-execution control
//! surfaces, and the shared execution context.
//!
//! The kernel walks a [`trellis_workflow::Workflow`] tree, dispatching each
//! leaf to a registered [`StepExecutor`] wrapped in condition checks,
//! processors, and hooks. Composites run sequentially, in bounded parallel
//! fan-out, or as loops. A [`control::ControlSurface`] per execution exposes
//! pause/resume/stop/scale and metric snapshots without reaching into the
//! kernel.

pub mod callback;
pub mod context;
pub mod control;
pub mod error;
pub mod executor;
pub mod executors;
pub mod hooks;
pub mod journal;
pub mod kernel;
pub mod processors;

pub use callback::{ExecutionCallback, InteractionRequest, NoopCallback};
pub use context::{ExecutionContext, VarScope};
pub use control::{ControlSurface, SurfaceRegistry};
pub use error::EngineError;
pub use executor::{ExecutorRegistry, StepExecutor};
pub use journal::JournalEntry;
pub use kernel::{Kernel, KernelConfig};
