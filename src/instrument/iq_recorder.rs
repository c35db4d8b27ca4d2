//! I/Q recorder controller: the record and export sub-machines.
//!
//! ```text
//! Idle --arm--> Armed --poll(status == 1)--> Recording --poll(status == 0)--> Idle(recorded)
//! Idle(recorded) --export--> WaitingWipe --poll(running != 0)--> Exporting
//!                --poll(progress == "100 %")--> Idle(exported)
//! ```
//!
//! Each sub-machine reports through the [`EventBus`]: a `-1` progress when it
//! starts, `0..=99` while running, `100` once the instrument confirms the
//! terminal state, then its result, then exactly one `Finished`. A failed
//! sub-machine never emits `Finished`.

use crate::adapters::ScpiTransport;
use crate::config::Settings;
use crate::core::{CyclePhase, SubMachine};
use crate::error::{AppResult, DaqError};
use crate::events::{
    EngineEvent, EventBus, PROGRESS_CEILING, PROGRESS_DONE, PROGRESS_INDETERMINATE,
};
use crate::instrument::poll::{PollSettings, Poller};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const STATUS_QUERY: &str = "STATus:RECorder?";
const STATUS_ARMED: &str = "1";
const STATUS_IDLE: &str = "0";
const ARCHIVE_RUNNING_QUERY: &str = "SYSTem:ARCHive:RUNNing?";
const ARCHIVE_PROGRESS_QUERY: &str = "SYSTem:ARCHive:PROGress?";
const ARCHIVE_DONE: &str = "100 %";
/// Waveform parts left on the record drive after an export.
const RECORD_DRIVE_ARTIFACTS: &[&str] = &["ws1", "wsm"];
/// Waveform parts left on the scratch drive after an export.
const SCRATCH_DRIVE_ARTIFACTS: &[&str] = &["ws2"];

/// Drive layout and settle delays of the recorder.
#[derive(Clone, Debug, PartialEq)]
pub struct RecorderSettings {
    pub record_drive: String,
    pub archive_drive: String,
    pub scratch_drive: String,
    pub arm_settle: Duration,
    pub export_settle: Duration,
    pub cleanup_settle: Duration,
    pub poll: PollSettings,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for RecorderSettings {
    fn from(settings: &Settings) -> Self {
        let recorder = &settings.recorder;
        Self {
            record_drive: recorder.record_drive.clone(),
            archive_drive: recorder.archive_drive.clone(),
            scratch_drive: recorder.scratch_drive.clone(),
            arm_settle: recorder.arm_settle,
            export_settle: recorder.export_settle,
            cleanup_settle: recorder.cleanup_settle,
            poll: settings.poll_settings(),
        }
    }
}

/// Durations measured by the record sub-machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordTiming {
    /// From start command until the recorder reports armed (dt1).
    pub prepare: Duration,
    /// From armed until the recorder reports idle again (dt2).
    pub record: Duration,
}

/// Controller for the I/Q recorder. Owns its transport exclusively.
pub struct IqRecorder {
    transport: Box<dyn ScpiTransport>,
    settings: RecorderSettings,
    events: EventBus,
    expected: Duration,
}

impl IqRecorder {
    pub fn new(transport: Box<dyn ScpiTransport>, settings: RecorderSettings, events: EventBus) -> Self {
        Self {
            transport,
            settings,
            events,
            expected: Duration::ZERO,
        }
    }

    /// Estimated recording time of one file, set by [`initialize`](Self::initialize).
    pub fn expected_duration(&self) -> Duration {
        self.expected
    }

    /// Put the recorder in file-size limited, manually triggered recorder mode.
    pub async fn initialize(&mut self, file_size: u64, sample_rate: f64) -> AppResult<()> {
        if file_size == 0 || sample_rate.is_nan() || sample_rate <= 0.0 {
            return Err(DaqError::InvalidParameters(format!(
                "recorder needs a positive file size and sample rate, got {} samples at {} Hz",
                file_size, sample_rate
            )));
        }
        self.expected = Duration::from_secs_f64(file_size as f64 / sample_rate);

        let commands = [
            "INSTrument:SELect:MODE RECorder".to_string(),
            "INPut:RECorder:LIMits:CONDition FILesize".to_string(),
            format!("INPut:RECorder:LIMits:FILesize {}", file_size),
            "TRIGger:RECorder:SYNC SALone".to_string(),
            "TRIGger:RECorder:SOURce MANual".to_string(),
        ];
        self.send_all(&commands, CyclePhase::Initialize).await?;

        debug!(
            "{} initialized for {} samples, estimated time of finish {:.2} s",
            self.transport.name(),
            file_size,
            self.expected.as_secs_f64()
        );
        Ok(())
    }

    /// Record one file and wait until the recorder is idle again.
    pub async fn record(&mut self, file_number: u32, file_name: &str) -> AppResult<RecordTiming> {
        let select = format!(
            "INPut:RECorder:WAVeform:SELect '{}/{}'",
            self.settings.record_drive, file_name
        );
        self.send_all(&[select, "TRIGger:RECorder:ARM ONNO".to_string()], CyclePhase::Arm)
            .await?;
        sleep(self.settings.arm_settle).await;
        self.send_all(&["TRIGger:RECorder:STARt".to_string()], CyclePhase::Arm)
            .await?;
        self.emit_progress(SubMachine::Record, file_number, PROGRESS_INDETERMINATE);
        debug!("preparing file {}, please wait", file_number);

        let poll = self.settings.poll;
        let mut arming = Poller::start(&poll, CyclePhase::Arm, poll.timeout);
        loop {
            let status = self.query(STATUS_QUERY, CyclePhase::Arm).await?;
            if status == STATUS_ARMED {
                break;
            }
            arming.wait().await?;
        }
        let prepare = arming.elapsed();
        info!("recording file {} '{}'", file_number, file_name);

        let mut recording = Poller::start(&poll, CyclePhase::Record, self.expected + poll.timeout);
        loop {
            let status = self.query(STATUS_QUERY, CyclePhase::Record).await?;
            if status == STATUS_IDLE {
                break;
            }
            let percent = recording_percent(recording.elapsed(), self.expected);
            self.emit_progress(SubMachine::Record, file_number, percent);
            recording.wait().await?;
        }
        let record = recording.elapsed();

        self.emit_progress(SubMachine::Record, file_number, PROGRESS_DONE);
        info!("file {} '{}' is recorded", file_number, file_name);
        self.events.emit(EngineEvent::RecordResult {
            file_number,
            prepare,
            record,
        });
        self.events.emit(EngineEvent::Finished {
            machine: SubMachine::Record,
            file_number,
        });
        Ok(RecordTiming { prepare, record })
    }

    /// Archive a recorded file to the network drive, then delete the
    /// instrument-local copies. Returns the export duration.
    pub async fn export(&mut self, file_number: u32, file_name: &str) -> AppResult<Duration> {
        let commands = [
            format!(
                "SYSTem:ARCHive:SOURce:FILEname '{}/{}'",
                self.settings.record_drive, file_name
            ),
            format!(
                "SYSTem:ARCHive:DESTination:FILEname '{}/{}'",
                self.settings.archive_drive, file_name
            ),
            "SYSTem:ARCHive:FORMat RAW".to_string(),
            "SYSTem:ARCHive:STARt".to_string(),
        ];
        sleep(self.settings.export_settle).await;
        self.send_all(&commands, CyclePhase::Export).await?;
        self.emit_progress(SubMachine::Export, file_number, PROGRESS_INDETERMINATE);
        debug!("exporting file {} '{}', please wait", file_number, file_name);

        let poll = self.settings.poll;
        let started = Instant::now();

        let mut wiping = Poller::start(&poll, CyclePhase::Wipe, poll.timeout);
        loop {
            let running = self.query(ARCHIVE_RUNNING_QUERY, CyclePhase::Wipe).await?;
            if running != "0" {
                break;
            }
            wiping.wait().await?;
        }

        let mut exporting = Poller::start(&poll, CyclePhase::Export, poll.timeout);
        loop {
            let reply = self.query(ARCHIVE_PROGRESS_QUERY, CyclePhase::Export).await?;
            if unquote(&reply) == ARCHIVE_DONE {
                break;
            }
            match parse_archive_progress(&reply) {
                Some(percent) => self.emit_progress(
                    SubMachine::Export,
                    file_number,
                    percent.min(PROGRESS_CEILING),
                ),
                None => warn!("unreadable archive progress '{}'", reply),
            }
            exporting.wait().await?;
        }
        let export = started.elapsed();

        self.emit_progress(SubMachine::Export, file_number, PROGRESS_DONE);
        info!("file {} '{}' is exported", file_number, file_name);
        self.events.emit(EngineEvent::ExportResult {
            file_number,
            export,
        });

        self.delete_local_copies(file_name)
            .await
            .map_err(|e| e.in_phase(CyclePhase::Cleanup))?;

        self.events.emit(EngineEvent::Finished {
            machine: SubMachine::Export,
            file_number,
        });
        Ok(export)
    }

    async fn delete_local_copies(&mut self, file_name: &str) -> AppResult<()> {
        let settle = self.settings.cleanup_settle;
        let plan = [
            (self.settings.record_drive.clone(), RECORD_DRIVE_ARTIFACTS),
            (self.settings.scratch_drive.clone(), SCRATCH_DRIVE_ARTIFACTS),
        ];
        for (drive, extensions) in plan {
            self.transport
                .send(&format!("MMEMory:CDIRectory '{}'", drive))
                .await?;
            for extension in extensions {
                self.transport
                    .send(&format!("MMEMory:DELete '{}.{}'; *WAI", file_name, extension))
                    .await?;
                sleep(settle).await;
            }
        }
        Ok(())
    }

    pub async fn disconnect(&mut self) -> AppResult<()> {
        self.transport.disconnect().await
    }

    async fn send_all(&mut self, commands: &[String], phase: CyclePhase) -> AppResult<()> {
        for command in commands {
            self.transport
                .send(command)
                .await
                .map_err(|e| e.in_phase(phase))?;
        }
        Ok(())
    }

    async fn query(&mut self, command: &str, phase: CyclePhase) -> AppResult<String> {
        self.transport
            .query(command)
            .await
            .map_err(|e| e.in_phase(phase))
    }

    fn emit_progress(&self, machine: SubMachine, file_number: u32, percent: i32) {
        self.events
            .emit(EngineEvent::progress(machine, file_number, percent));
    }
}

/// Recording progress from elapsed time, capped below 100 until the
/// instrument reports idle.
pub fn recording_percent(elapsed: Duration, expected: Duration) -> i32 {
    if expected.is_zero() {
        return PROGRESS_CEILING;
    }
    let percent = (elapsed.as_secs_f64() / expected.as_secs_f64() * 100.0).floor();
    (percent as i32).clamp(0, PROGRESS_CEILING)
}

/// Parse a `"42 %"` archive progress reply.
pub fn parse_archive_progress(reply: &str) -> Option<i32> {
    let text = unquote(reply).trim();
    let number = text.strip_suffix('%').unwrap_or(text).trim();
    number
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| (v.floor() as i32).clamp(0, PROGRESS_DONE))
}

fn unquote(reply: &str) -> &str {
    reply.trim().trim_matches('"')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_percent_clamps_below_done() {
        let expected = Duration::from_secs(2);
        assert_eq!(recording_percent(Duration::ZERO, expected), 0);
        assert_eq!(recording_percent(Duration::from_secs(1), expected), 50);
        assert_eq!(recording_percent(Duration::from_secs(2), expected), 99);
        assert_eq!(recording_percent(Duration::from_secs(30), expected), 99);
        assert_eq!(recording_percent(Duration::from_secs(1), Duration::ZERO), 99);
    }

    #[test]
    fn test_parse_archive_progress() {
        assert_eq!(parse_archive_progress("\"0 %\""), Some(0));
        assert_eq!(parse_archive_progress("\"57 %\""), Some(57));
        assert_eq!(parse_archive_progress("50 %"), Some(50));
        assert_eq!(parse_archive_progress("\"100 %\""), Some(100));
        assert_eq!(parse_archive_progress("\"busy\""), None);
    }

    #[test]
    fn test_terminal_reply_detection() {
        assert_eq!(unquote("\"100 %\""), ARCHIVE_DONE);
        assert_eq!(unquote("100 %"), ARCHIVE_DONE);
        assert_ne!(unquote("\"100.0 %\""), ARCHIVE_DONE);
    }
}
