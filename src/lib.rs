//! Instrument orchestration for I/Q acquisition runs.
//!
//! A spectrum analyzer streams I/Q data into a recorder; this crate sequences
//! both over SCPI: calibrate and start the analyzer once per run, then for
//! every file wait for a trigger, record, archive the recording to network
//! storage and write its metadata header. Progress and lifecycle events go
//! out on a broadcast [`EventBus`](events::EventBus) so any number of
//! observers can follow a run without slowing it down.

pub mod adapters;
pub mod config;
pub mod core;
pub mod data;
pub mod error;
pub mod events;
pub mod instrument;
pub mod logging;
pub mod metadata;
pub mod parameters;
pub mod sequencer;
pub mod trigger;

pub use error::{AppResult, DaqError};
pub use sequencer::{RunFailure, RunSummary, Sequencer, SequencerHandle};
