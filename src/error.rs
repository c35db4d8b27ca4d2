//! Custom error types for the acquisition engine.
//!
//! `DaqError` is the single error type of the library. It separates the
//! failure families an operator needs to tell apart:
//!
//! - **`Connection`**: an instrument could not be reached at all. Fatal to the
//!   run and surfaced immediately.
//! - **`Io`** / **`Transport`**: a send or receive failed on an established
//!   connection (broken pipe, reset, read timeout). Not retried; the current
//!   cycle fails.
//! - **`ProtocolTimeout`**: a status register never reached its terminal value
//!   within the configured bound.
//! - **`Instrument`**: the instrument replied with something the engine cannot
//!   interpret.
//! - **`Phase`**: wraps any of the above with the cycle phase it happened in,
//!   so a failed run can report *where* it stopped.
//!
//! A graceful stop is not an error; see [`crate::core::StopReason`].

use crate::core::{CyclePhase, EngineState};
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Cannot connect to {host}:{port}: {source}")]
    Connection {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport not connected")]
    NotConnected,

    #[error("Timed out after {waited:?} waiting for the instrument during {phase}")]
    ProtocolTimeout { phase: CyclePhase, waited: Duration },

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Invalid state transition {from} -> {to}")]
    InvalidTransition { from: EngineState, to: EngineState },

    #[error("Invalid acquisition parameters: {0}")]
    InvalidParameters(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Metadata serialization error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Parameters are not locked")]
    ParametersNotLocked,

    #[error("{phase} failed: {source}")]
    Phase {
        phase: CyclePhase,
        #[source]
        source: Box<DaqError>,
    },
}

impl DaqError {
    /// Attribute this error to a cycle phase.
    ///
    /// Errors that already carry a phase keep it: the innermost phase is the
    /// one that actually failed.
    pub fn in_phase(self, phase: CyclePhase) -> Self {
        match self {
            err @ DaqError::Phase { .. } => err,
            DaqError::ProtocolTimeout { phase: inner, waited } => DaqError::Phase {
                phase: inner,
                source: Box::new(DaqError::ProtocolTimeout { phase: inner, waited }),
            },
            other => DaqError::Phase {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// The cycle phase this error was attributed to, if any.
    pub fn phase(&self) -> Option<CyclePhase> {
        match self {
            DaqError::Phase { phase, .. } => Some(*phase),
            DaqError::ProtocolTimeout { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Whether this error means the instrument was never reachable.
    pub fn is_connection(&self) -> bool {
        match self {
            DaqError::Connection { .. } => true,
            DaqError::Phase { source, .. } => source.is_connection(),
            _ => false,
        }
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Instrument("unexpected reply 'X'".to_string());
        assert_eq!(err.to_string(), "Instrument error: unexpected reply 'X'");
    }

    #[test]
    fn test_phase_attribution_keeps_innermost() {
        let err = DaqError::Transport("reset by peer".into())
            .in_phase(CyclePhase::Wipe)
            .in_phase(CyclePhase::Export);
        assert_eq!(err.phase(), Some(CyclePhase::Wipe));
        assert!(err.to_string().starts_with("wipe failed"));
    }

    #[test]
    fn test_timeout_carries_its_own_phase() {
        let err = DaqError::ProtocolTimeout {
            phase: CyclePhase::Arm,
            waited: Duration::from_secs(3),
        }
        .in_phase(CyclePhase::Record);
        assert_eq!(err.phase(), Some(CyclePhase::Arm));
    }

    #[test]
    fn test_connection_detection_through_phase() {
        let err = DaqError::Connection {
            host: "10.0.0.1".into(),
            port: 5025,
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        }
        .in_phase(CyclePhase::Calibrate);
        assert!(err.is_connection());
    }
}
