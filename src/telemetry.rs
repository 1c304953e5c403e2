//! Log subscriber setup for hosts embedding the runtime.
//!
//! The library only emits `tracing` events. A host that wants them printed
//! calls [`init`] once with the `[application]` section: `RUST_LOG` wins
//! over `log_level`, and `log_format` picks the formatter. Capture and
//! forwarder threads are named, so thread names are always included.
//!
//! # Example
//! ```no_run
//! use nanotrack::{config::NanotrackConfig, telemetry};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NanotrackConfig::load_from("config/nanotrack.toml")?;
//! telemetry::init(&config.application)?;
//! tracing::info!("Runtime started");
//! # Ok(())
//! # }
//! ```

use crate::config::{ApplicationConfig, LogFormat};
use nanotrack_core::{AppResult, DaqError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Crates whose events follow the configured level.
const TARGETS: [&str; 4] = [
    "nanotrack",
    "nanotrack_core",
    "nanotrack_storage",
    "nanotrack_driver_mock",
];

/// Filter directives used when `RUST_LOG` is unset.
///
/// The workspace crates log at the configured level; everything else at
/// `warn`.
pub fn default_directives(config: &ApplicationConfig) -> AppResult<String> {
    let level = config.log_level.to_ascii_lowercase();
    if !LEVELS.contains(&level.as_str()) {
        return Err(DaqError::Configuration(format!(
            "Invalid log level '{}'. Must be one of: {}",
            config.log_level,
            LEVELS.join(", ")
        )));
    }
    let mut directives = vec!["warn".to_string()];
    directives.extend(TARGETS.iter().map(|target| format!("{target}={level}")));
    Ok(directives.join(","))
}

fn filter(config: &ApplicationConfig) -> AppResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::new(default_directives(config)?)),
    }
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed, by an
/// earlier call or by the host itself; that one stays in place.
pub fn init(config: &ApplicationConfig) -> AppResult<bool> {
    let filter = filter(config)?;
    let layer = match config.log_format {
        LogFormat::Pretty => fmt::layer().pretty().with_thread_names(true).boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_thread_names(true)
            .with_ansi(false)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_thread_names(true).boxed(),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!(format = ?config.log_format, "Log subscriber installed");
    }
    Ok(installed)
}
