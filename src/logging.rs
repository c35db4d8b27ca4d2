//! Tracing subscriber setup.
//!
//! Human-readable output goes to stderr. When `application.log_file` is set,
//! the same events are appended to that file without ANSI colours. `RUST_LOG`
//! overrides the configured level.

use crate::config::ApplicationConfig;
use crate::error::{AppResult, DaqError};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::Span;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

/// Install the global subscriber.
///
/// Returns `Ok(false)` if a subscriber was already installed, which happens
/// when the engine is embedded in a host that configured tracing itself.
pub fn init(config: &ApplicationConfig) -> AppResult<bool> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| DaqError::Configuration(format!("invalid log filter: {}", e)))?;

    let file_layer = match &config.log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .try_init()
        .is_ok();
    Ok(installed)
}

/// Span wrapping everything a single run logs.
pub fn run_span(run_id: Uuid) -> Span {
    tracing::info_span!("run", run_id = %run_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_run_span_carries_run_id() {
        let id = Uuid::new_v4();
        run_span(id).in_scope(|| tracing::info!("inside run"));
        assert!(logs_contain("inside run"));
        assert!(logs_contain(&id.to_string()));
    }
}
