//! Shell stage: renders the configured template for an item and runs it.

use std::time::Duration;

use metapipe_core::config::ShellConfig;
use metapipe_core::domain::ShellResult;
use tracing::debug;

use super::process::{run_command, CommandSpec, ProcessLimits};
use super::template::{Quoting, Template, TemplateContext, TemplateError};

/// Shell configuration that cannot run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShellError {
    #[error("shell stage needs either `command` or a non-empty `argv`")]
    MissingCommand,

    #[error(transparent)]
    Template(#[from] TemplateError),
}

#[derive(Debug, Clone)]
enum Form {
    /// `program -c <rendered command>`
    Command { program: String, template: Template },
    /// Each element rendered separately; the first is the program.
    Argv(Vec<Template>),
}

/// Prepared shell stage, shared read-only by all workers.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    form: Form,
    auto_escape: bool,
    spec_base: CommandSpec,
    limits: ProcessLimits,
}

impl ShellRunner {
    /// Parse the templates; under strict templating this fails before any
    /// process is spawned.
    pub fn new(config: &ShellConfig) -> Result<Self, ShellError> {
        let strict = config.strict_templates;
        let form = match (&config.command, &config.argv) {
            (Some(command), _) => Form::Command {
                program: config.program.clone(),
                template: Template::parse(command, strict)?,
            },
            (None, Some(argv)) if !argv.is_empty() => Form::Argv(
                argv.iter()
                    .map(|arg| Template::parse(arg, strict))
                    .collect::<Result<_, _>>()?,
            ),
            _ => return Err(ShellError::MissingCommand),
        };
        Ok(Self {
            form,
            auto_escape: config.auto_escape,
            spec_base: CommandSpec {
                program: String::new(),
                args: Vec::new(),
                display: String::new(),
                working_dir: config.working_dir.clone(),
                env: config.env.clone(),
            },
            limits: ProcessLimits {
                timeout: Duration::from_millis(config.timeout_ms),
                grace: Duration::from_millis(config.grace_ms),
                capture_stdout: config.capture_stdout,
                capture_stderr: config.capture_stderr,
                max_stdout_bytes: config.max_stdout_bytes,
                max_stderr_bytes: config.max_stderr_bytes,
            },
        })
    }

    /// Render the command for one item.
    pub fn render(&self, ctx: &TemplateContext) -> CommandSpec {
        let mut spec = self.spec_base.clone();
        match &self.form {
            Form::Command { program, template } => {
                let quoting = if self.auto_escape {
                    Quoting::Auto
                } else {
                    Quoting::Explicit
                };
                let command = template.render(ctx, quoting);
                spec.program = program.clone();
                spec.args = vec!["-c".to_string(), command.clone()];
                spec.display = command;
            }
            Form::Argv(templates) => {
                let mut rendered: Vec<String> = templates
                    .iter()
                    .map(|t| t.render(ctx, Quoting::Explicit))
                    .collect();
                spec.display = rendered.join(" ");
                spec.program = rendered.remove(0);
                spec.args = rendered;
            }
        }
        spec
    }

    pub async fn run(&self, ctx: &TemplateContext) -> ShellResult {
        let spec = self.render(ctx);
        debug!(cmd = %spec.display, index = ctx.index, "running shell stage");
        run_command(&spec, &self.limits).await
    }
}
