//! metapipe execution engine
//!
//! Runs a prepared configuration end to end:
//! - Lua stage scripts in a fresh, resource-limited sandbox per call
//! - Optional shell stage with process-group termination
//! - A bounded worker pool that restores canonical order before output

pub mod pipeline;
pub mod pool;
pub mod sandbox;
pub mod shell;
pub mod stage;

// Re-export key types
pub use pipeline::{Pipeline, RecordSink, RunReport};
pub use pool::{Aborted, ItemOutcome, ItemProcessor, ReorderBuffer, WorkerPool};
pub use sandbox::{Bindings, Sandbox, SandboxError};
pub use shell::{ShellError, ShellRunner, Template, TemplateContext, TemplateError};
pub use stage::{CompiledScripts, Script};
