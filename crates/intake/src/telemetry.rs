//! Tracing subscriber installation.
//!
//! Filter priority, highest first:
//!
//! 1. `INTAKE_LOG` (directives such as `intake=debug,warn`)
//! 2. `RUST_LOG`
//! 3. the [`Verbosity`] default
//!
//! `log` records emitted by the scheduler are bridged into the same
//! subscriber through `tracing-log`.

use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::error::TelemetryError;

pub const LOG_ENV_VAR: &str = "INTAKE_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

impl Verbosity {
    pub fn default_level(self) -> Level {
        match self {
            Verbosity::Quiet => Level::ERROR,
            Verbosity::Normal => Level::INFO,
            Verbosity::Verbose => Level::DEBUG,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Default)]
pub struct TelemetryOptions {
    pub verbosity: Verbosity,
    pub format: LogFormat,
    /// Suppress ANSI colors even on a terminal.
    pub no_color: bool,
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_tracing(options: TelemetryOptions) -> Result<(), TelemetryError> {
    tracing_log::LogTracer::init().map_err(|e| TelemetryError::LogBridge(e.to_string()))?;

    let directives = filter_directives(
        options.verbosity,
        std::env::var(LOG_ENV_VAR).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    );
    let filter = EnvFilter::try_new(&directives)
        .unwrap_or_else(|_| EnvFilter::new(options.verbosity.default_level().as_str()));

    let use_ansi = !options.no_color && std::io::IsTerminal::is_terminal(&std::io::stderr());

    let result = match options.format {
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(use_ansi)
                    .with_target(true)
                    .compact(),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init(),
    };

    result.map_err(|e| TelemetryError::Subscriber(e.to_string()))
}

fn filter_directives(
    verbosity: Verbosity,
    intake_log: Option<&str>,
    rust_log: Option<&str>,
) -> String {
    // Unparseable values fall through to the next source
    for directives in [intake_log, rust_log].into_iter().flatten() {
        if EnvFilter::try_new(directives).is_ok() {
            return directives.to_string();
        }
    }

    let level = verbosity.default_level().as_str().to_lowercase();
    match verbosity {
        Verbosity::Verbose => "warn,intake=debug".to_string(),
        _ => level,
    }
}
