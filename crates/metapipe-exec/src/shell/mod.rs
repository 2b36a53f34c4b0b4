//! Shell stage execution.
//!
//! - [`template`]: placeholder parsing and rendering
//! - [`process`]: spawning, deadlines, process-group termination, capture
//! - [`runner`]: the configured stage tying both together

pub mod process;
pub mod runner;
pub mod template;

pub use process::{run_command, CommandSpec, ProcessLimits};
pub use runner::{ShellError, ShellRunner};
pub use template::{shell_quote, Quoting, Template, TemplateContext, TemplateError};
