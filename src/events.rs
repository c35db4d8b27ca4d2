//! Engine events and their fan-out to observers.
//!
//! The engine never waits on an observer: events go out on a
//! `tokio::sync::broadcast` channel and an observer that falls behind simply
//! sees `RecvError::Lagged`. Presentation code subscribes, renders, and reads
//! the authoritative [`EngineState`] from the sequencer's `watch` channel.
//!
//! # Data Flow
//!
//! ```text
//! IqRecorder ----+
//!                +--[EngineEvent]--> broadcast::channel ---> UI / logging / tests
//! Sequencer -----+
//! ```

use crate::core::{CyclePhase, EngineState, FileCycle, RunTotals, StopReason, SubMachine};
use std::time::Duration;
use tokio::sync::broadcast;

/// Progress value for "started, extent unknown".
pub const PROGRESS_INDETERMINATE: i32 = -1;
/// Progress value for "terminal state confirmed by the instrument".
pub const PROGRESS_DONE: i32 = 100;
/// Highest progress reported before the instrument confirms completion.
pub const PROGRESS_CEILING: i32 = 99;

/// Everything the engine reports to the outside world.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    StateChanged {
        from: EngineState,
        to: EngineState,
    },
    /// `percent` is -1 (indeterminate), 0..=99, or 100 (done).
    Progress {
        machine: SubMachine,
        file_number: u32,
        percent: i32,
        indeterminate: bool,
    },
    /// Record sub-machine result: arm latency and recording duration.
    RecordResult {
        file_number: u32,
        prepare: Duration,
        record: Duration,
    },
    /// Export sub-machine result.
    ExportResult { file_number: u32, export: Duration },
    /// Fires exactly once per sub-machine invocation, after its terminal state.
    Finished {
        machine: SubMachine,
        file_number: u32,
    },
    CycleCompleted {
        cycle: FileCycle,
        totals: RunTotals,
    },
    /// The run is held at a cycle boundary; `next_file` starts on resume.
    Paused { next_file: u32, totals: RunTotals },
    Resumed { next_file: u32 },
    RunCompleted {
        reason: StopReason,
        totals: RunTotals,
    },
    RunFailed {
        phase: Option<CyclePhase>,
        error: String,
        totals: RunTotals,
    },
}

impl EngineEvent {
    pub fn progress(machine: SubMachine, file_number: u32, percent: i32) -> Self {
        EngineEvent::Progress {
            machine,
            file_number,
            percent,
            indeterminate: percent == PROGRESS_INDETERMINATE,
        }
    }
}

/// Cloneable sending side of the event channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.emit(EngineEvent::progress(SubMachine::Record, 1, 5));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_events() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(EngineEvent::progress(SubMachine::Export, 2, PROGRESS_INDETERMINATE));
        let expected = EngineEvent::Progress {
            machine: SubMachine::Export,
            file_number: 2,
            percent: -1,
            indeterminate: true,
        };
        assert_eq!(a.recv().await.unwrap(), expected);
        assert_eq!(b.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_slow_observer_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe();
        for percent in 0..5 {
            bus.emit(EngineEvent::progress(SubMachine::Record, 1, percent));
        }
        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
