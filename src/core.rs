//! Core state and bookkeeping types for the acquisition engine.
//!
//! # State Model
//!
//! ```text
//! Uninitialized -> Calibrating -> Armed -> Recording -> Exporting -> Idle
//!                                   ^                                  |
//!                                   +----------------------------------+
//!
//! any non-terminal state -> Stopping -> Stopped
//! any non-terminal state -> Failed
//! Stopped | Failed -> Calibrating     (parameters re-locked for a new run)
//! ```
//!
//! Exactly one [`EngineState`] exists per run. It is owned by the
//! [`Sequencer`](crate::sequencer::Sequencer) and published read-only through
//! a `tokio::sync::watch` channel.

use chrono::{DateTime, FixedOffset, Local, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// Engine State
// =============================================================================

/// Lifecycle state of the acquisition engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Uninitialized,
    Calibrating,
    Armed,
    Recording,
    Exporting,
    Idle,
    Stopping,
    Stopped,
    Failed,
}

impl EngineState {
    /// Whether the run is over in this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, EngineState::Stopped | EngineState::Failed)
    }

    /// Returns true if `next` is a legal successor of `self`.
    ///
    /// Transitions inside a cycle are strictly sequential: `Recording` is only
    /// reachable from `Armed`, `Exporting` only from `Recording`.
    pub fn can_transition_to(self, next: EngineState) -> bool {
        use EngineState::*;
        match (self, next) {
            (Uninitialized | Stopped | Failed, Calibrating) => true,
            (Calibrating, Armed) => true,
            (Armed, Recording) => true,
            (Recording, Exporting) => true,
            (Exporting, Idle) => true,
            (Idle, Armed) => true,
            (Stopping, Stopped) => true,
            (Stopping, Failed) => true,
            (from, Stopping | Failed) => !from.is_terminal() && from != Stopping,
            _ => false,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Calibrating => "calibrating",
            EngineState::Armed => "armed",
            EngineState::Recording => "recording",
            EngineState::Exporting => "exporting",
            EngineState::Idle => "idle",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
            EngineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Step of a run an error can be attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    /// Spectrum analyzer calibration, configuration and stream start.
    Calibrate,
    /// Recorder mode/file-size/trigger setup before a file.
    Initialize,
    /// Waiting for the trigger source.
    Trigger,
    /// Recorder armed, waiting for the status register to report recording.
    Arm,
    /// Recording in progress.
    Record,
    /// Archive engine picking up the export job.
    Wipe,
    /// Archive copy in progress.
    Export,
    /// Instrument-side artifact deletion after export.
    Cleanup,
    /// Metadata header write.
    Persist,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CyclePhase::Calibrate => "calibrate",
            CyclePhase::Initialize => "initialize",
            CyclePhase::Trigger => "trigger",
            CyclePhase::Arm => "arm",
            CyclePhase::Record => "record",
            CyclePhase::Wipe => "wipe",
            CyclePhase::Export => "export",
            CyclePhase::Cleanup => "cleanup",
            CyclePhase::Persist => "persist",
        };
        f.write_str(name)
    }
}

/// The two recorder sub-machines that report progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubMachine {
    Record,
    Export,
}

// =============================================================================
// Trigger Mode
// =============================================================================

/// How the next file cycle is started.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Wait for an external `triggered` message on the trigger port.
    #[default]
    Automatic,
    /// Start after a fixed delay; no trigger hardware needed.
    Manual,
}

impl FromStr for TriggerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "automatic" | "auto" => Ok(TriggerMode::Automatic),
            "manual" => Ok(TriggerMode::Manual),
            other => Err(format!(
                "unknown trigger mode '{}', expected 'automatic' or 'manual'",
                other
            )),
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerMode::Automatic => f.write_str("automatic"),
            TriggerMode::Manual => f.write_str("manual"),
        }
    }
}

// =============================================================================
// Stop Handling
// =============================================================================

/// When a run ends on its own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopCondition {
    /// Run until an operator stops it.
    #[default]
    UntilStopped,
    /// Stop after this many files have been persisted.
    AfterFiles(NonZeroU32),
}

impl StopCondition {
    /// Build from an optional file limit (`None` = run until stopped).
    pub fn from_limit(limit: Option<u32>) -> Self {
        limit
            .and_then(NonZeroU32::new)
            .map_or(StopCondition::UntilStopped, StopCondition::AfterFiles)
    }

    /// Evaluated once per completed cycle.
    pub fn is_met(&self, completed_files: u32) -> bool {
        match self {
            StopCondition::UntilStopped => false,
            StopCondition::AfterFiles(limit) => completed_files >= limit.get(),
        }
    }
}

/// Why a run halted. Both non-forced reasons drain at a cycle boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Operator asked for a graceful stop.
    Requested,
    /// The configured file count was reached.
    FileLimit(u32),
    /// Process exit; in-flight work was abandoned.
    Forced,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => f.write_str("stop requested"),
            StopReason::FileLimit(n) => write!(f, "file limit of {} reached", n),
            StopReason::Forced => f.write_str("forced stop"),
        }
    }
}

// =============================================================================
// File Cycle & Totals
// =============================================================================

/// One record -> export -> persist iteration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileCycle {
    /// Monotonic within a run, starting at 1.
    pub file_number: u32,
    /// `YYYYMMDD_HHMMSS` of the capture time.
    pub file_name: String,
    /// Capture time with the local UTC offset.
    pub timestamp: DateTime<FixedOffset>,
    /// Arm latency (dt1).
    pub prepare: Duration,
    /// Recording duration (dt2).
    pub record: Duration,
    /// Export duration (dt3).
    pub export: Duration,
}

impl FileCycle {
    /// Start a cycle at trigger time. Durations are filled in as the
    /// sub-machines complete.
    pub fn begin<Tz: TimeZone>(file_number: u32, captured_at: DateTime<Tz>) -> Self {
        let timestamp = captured_at.fixed_offset();
        Self {
            file_number,
            file_name: timestamp.format("%Y%m%d_%H%M%S").to_string(),
            timestamp,
            prepare: Duration::ZERO,
            record: Duration::ZERO,
            export: Duration::ZERO,
        }
    }

    /// Start a cycle stamped with the current local time.
    pub fn begin_now(file_number: u32) -> Self {
        Self::begin(file_number, Local::now())
    }

    /// ISO-8601 timestamp with offset, e.g. `2024-03-05T14:07:09+0100`.
    pub fn iso_timestamp(&self) -> String {
        self.timestamp.format("%Y-%m-%dT%H:%M:%S%z").to_string()
    }
}

/// Running sums of the three cycle durations across a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub cycles: u32,
    pub prepare: Duration,
    pub record: Duration,
    pub export: Duration,
}

impl RunTotals {
    /// Fold a completed cycle into the totals.
    pub fn add(&mut self, cycle: &FileCycle) {
        self.cycles += 1;
        self.prepare += cycle.prepare;
        self.record += cycle.record;
        self.export += cycle.export;
    }
}

impl fmt::Display for RunTotals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} file(s), total preparing time: {:.2} s, total recording time: {:.2} s, total exporting time: {:.2} s",
            self.cycles,
            self.prepare.as_secs_f64(),
            self.record.as_secs_f64(),
            self.export.as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    #[test]
    fn test_cycle_transitions_are_sequential() {
        use EngineState::*;
        assert!(Armed.can_transition_to(Recording));
        assert!(!Armed.can_transition_to(Exporting));
        assert!(!Calibrating.can_transition_to(Recording));
        assert!(!Idle.can_transition_to(Recording));
        assert!(Exporting.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Armed));
    }

    #[test]
    fn test_stop_and_fail_reachable_from_active_states() {
        use EngineState::*;
        for state in [Calibrating, Armed, Recording, Exporting, Idle] {
            assert!(state.can_transition_to(Stopping), "{state} -> stopping");
            assert!(state.can_transition_to(Failed), "{state} -> failed");
        }
        assert!(Stopping.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Stopping));
        assert!(!Stopped.can_transition_to(Armed));
        assert!(Stopped.can_transition_to(Calibrating));
        assert!(Failed.can_transition_to(Calibrating));
    }

    #[test]
    fn test_file_cycle_naming() {
        let tz = FixedOffset::east_opt(3600).unwrap();
        let at = tz.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        let cycle = FileCycle::begin(1, at);
        assert_eq!(cycle.file_name, "20240305_140709");
        assert_eq!(cycle.iso_timestamp(), "2024-03-05T14:07:09+0100");
    }

    #[test]
    fn test_stop_condition() {
        assert!(!StopCondition::UntilStopped.is_met(1_000));
        let after_three = StopCondition::from_limit(Some(3));
        assert!(!after_three.is_met(2));
        assert!(after_three.is_met(3));
        assert_eq!(StopCondition::from_limit(Some(0)), StopCondition::UntilStopped);
        assert_eq!(StopCondition::from_limit(None), StopCondition::UntilStopped);
    }

    #[test]
    fn test_totals_accumulate() {
        let mut totals = RunTotals::default();
        let mut cycle = FileCycle::begin_now(1);
        cycle.prepare = Duration::from_millis(300);
        cycle.record = Duration::from_secs(2);
        cycle.export = Duration::from_secs(5);
        totals.add(&cycle);
        totals.add(&cycle);
        assert_eq!(totals.cycles, 2);
        assert_eq!(totals.prepare, Duration::from_millis(600));
        assert_eq!(totals.record, Duration::from_secs(4));
        assert_eq!(totals.export, Duration::from_secs(10));
    }

    #[test]
    fn test_trigger_mode_parsing() {
        assert_eq!("Manual".parse::<TriggerMode>(), Ok(TriggerMode::Manual));
        assert_eq!("auto".parse::<TriggerMode>(), Ok(TriggerMode::Automatic));
        assert!("sometimes".parse::<TriggerMode>().is_err());
    }
}
