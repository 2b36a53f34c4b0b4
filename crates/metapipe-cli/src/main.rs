//! metapipe - deterministic metadata pipeline
//!
//! ## Commands
//!
//! - `run`: execute a pipeline configuration and write the result
//! - `validate`: check a configuration without touching any input

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metapipe_core::config::{ErrorMode, OutputFormat, RunConfig};
use metapipe_exec::Pipeline;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, error, Level};

#[derive(Parser)]
#[command(name = "metapipe")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Deterministic metadata pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline configuration
    Run {
        /// Configuration file (YAML or JSON)
        #[arg(short, long, env = "METAPIPE_CONFIG")]
        config: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Validate a configuration, compiling scripts and templates
    Validate {
        /// Configuration file (YAML or JSON)
        #[arg(short, long, env = "METAPIPE_CONFIG")]
        config: PathBuf,
    },
}

#[derive(clap::Args, Debug, Default)]
struct Overrides {
    /// Number of concurrent workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Stop at the first item error
    #[arg(long)]
    fail_fast: bool,

    /// Write output to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Stream one JSON object per line
    #[arg(long)]
    jsonl: bool,

    /// Pretty-print the aggregate envelope
    #[arg(long)]
    pretty: bool,
}

impl Overrides {
    fn apply(self, config: &mut RunConfig) {
        if let Some(workers) = self.workers {
            config.workers = Some(workers);
        }
        if self.fail_fast {
            config.errors.mode = ErrorMode::FailFast;
        }
        if let Some(output) = self.output {
            config.output.path = Some(output);
        }
        if self.jsonl {
            config.output.format = OutputFormat::Jsonl;
        }
        if self.pretty {
            config.output.pretty = true;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    metapipe_core::init_tracing(cli.json_logs, level);

    let result = match cli.command {
        Commands::Run { config, overrides } => cmd_run(&config, overrides).await,
        Commands::Validate { config } => cmd_validate(&config),
    };
    match result {
        Ok(code) => ExitCode::from(exit_status(code)),
        Err(e) => {
            error!(error = %e, "metapipe failed");
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

fn load_config(path: &Path) -> Result<RunConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: RunConfig = serde_yaml::from_str(&text)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    debug!(path = %path.display(), "loaded configuration");
    Ok(config)
}

async fn cmd_run(path: &Path, overrides: Overrides) -> Result<i32> {
    let mut config = load_config(path)?;
    overrides.apply(&mut config);

    let pipeline = Pipeline::prepare(config).context("invalid configuration")?;
    let report = pipeline.execute().await.context("run failed")?;
    for line in &report.diagnostics {
        eprintln!("metapipe: {line}");
    }
    Ok(report.exit_code)
}

fn cmd_validate(path: &Path) -> Result<i32> {
    let config = load_config(path)?;
    let pipeline = Pipeline::prepare(config).context("invalid configuration")?;
    let config = pipeline.config();
    println!(
        "configuration ok: flow={} operation={} workers={}",
        config.flow.as_str(),
        config.operation.as_str(),
        config.effective_workers()
    );
    Ok(0)
}
