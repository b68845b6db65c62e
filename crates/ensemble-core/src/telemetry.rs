use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt};

use crate::EnsembleError;

static TELEMETRY_GUARD: OnceLock<()> = OnceLock::new();

/// Options for the tracing bootstrap.
///
/// `level` usually comes from `[logging]` in the agent configuration; a
/// `RUST_LOG` environment variable always wins so operators can raise
/// verbosity on a single node without touching its config file.
#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    pub level: String,
    pub with_ansi: bool,
    pub with_target: bool,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_ansi: true,
            with_target: false,
        }
    }
}

impl TelemetryOptions {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }
}

/// Initialise the global tracing subscriber.
///
/// Safe to call multiple times; only the first invocation installs the subscriber.
pub fn init_telemetry(options: TelemetryOptions) -> Result<(), EnsembleError> {
    if TELEMETRY_GUARD.get().is_some() {
        return Ok(());
    }

    let directives = std::env::var("RUST_LOG").unwrap_or(options.level);

    fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::new(directives))
        .with_ansi(options.with_ansi)
        .with_target(options.with_target)
        .try_init()
        .map_err(|err| {
            EnsembleError::InvalidConfiguration(format!("telemetry init failed: {err}"))
        })?;

    TELEMETRY_GUARD.get_or_init(|| ());
    Ok(())
}
