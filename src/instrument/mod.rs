//! Instrument controllers.
//!
//! Each controller owns its [`ScpiTransport`](crate::adapters::ScpiTransport)
//! exclusively; nothing else talks to the instrument behind its back.

pub mod iq_recorder;
pub mod poll;
pub mod spectrum_analyzer;

pub use iq_recorder::{IqRecorder, RecordTiming, RecorderSettings};
pub use poll::{PollSettings, Poller};
pub use spectrum_analyzer::SpectrumAnalyzer;
