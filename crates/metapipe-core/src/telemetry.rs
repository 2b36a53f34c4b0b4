//! Tracing initialisation for metapipe binaries.
//!
//! Logs always go to stderr; stdout is reserved for the result envelope.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding a filter for metapipe's own logs.
pub const LOG_ENV: &str = "METAPIPE_LOG";

const CRATES: [&str; 3] = ["metapipe", "metapipe_core", "metapipe_exec"];

/// Filter used when neither `METAPIPE_LOG` nor `RUST_LOG` is set: metapipe
/// crates at `level`, dependencies at `warn` at most.
pub fn default_directive(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    let floor = if level == "error" { "error" } else { "warn" };
    let mut parts: Vec<String> = vec![floor.to_string()];
    parts.extend(CRATES.iter().map(|krate| format!("{krate}={level}")));
    parts.join(",")
}

fn filter(level: Level) -> EnvFilter {
    for var in [LOG_ENV, EnvFilter::DEFAULT_ENV] {
        match EnvFilter::try_from_env(var) {
            Ok(filter) => return filter,
            Err(e) if std::env::var_os(var).is_some() => {
                eprintln!("metapipe: ignoring {var}: {e}");
            }
            Err(_) => {}
        }
    }
    EnvFilter::new(default_directive(level))
}

/// Initialise the global tracing subscriber.
///
/// `json` switches to newline-delimited JSON lines. Only the first call in a
/// process takes effect.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = filter(level);
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let installed = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init()
    };
    if installed.is_ok() {
        tracing::debug!(json, %level, "tracing initialised");
    }
}
