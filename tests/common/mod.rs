//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use iq_daq::adapters::MockAdapter;
use iq_daq::core::{FileCycle, StopCondition, TriggerMode};
use iq_daq::data::MetadataSink;
use iq_daq::events::{EngineEvent, EventBus};
use iq_daq::instrument::{IqRecorder, RecorderSettings, SpectrumAnalyzer};
use iq_daq::metadata::FileMetadata;
use iq_daq::parameters::AcquisitionParameters;
use iq_daq::trigger::{TriggerEvent, TriggerSet, TriggerSource};
use iq_daq::{AppResult, DaqError, Sequencer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

pub const STATUS_QUERY: &str = "STATus:RECorder?";
pub const RUNNING_QUERY: &str = "SYSTem:ARCHive:RUNNing?";
pub const PROGRESS_QUERY: &str = "SYSTem:ARCHive:PROGress?";
pub const ARM_COMMAND: &str = "TRIGger:RECorder:ARM ONNO";

pub fn params() -> AcquisitionParameters {
    AcquisitionParameters::new(245e6, 5e6, -45.0, 2.0).unwrap()
}

/// Recorder that goes through one complete file per five status queries,
/// two running queries and two progress queries.
pub fn healthy_recorder() -> MockAdapter {
    MockAdapter::new("recorder")
        .on_query_cycle(STATUS_QUERY, ["2", "1", "1", "1", "0"])
        .on_query_cycle(RUNNING_QUERY, ["0", "1"])
        .on_query_cycle(PROGRESS_QUERY, ["\"50 %\"", "\"100 %\""])
}

/// Everything received so far, without waiting.
pub fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ============================================================================
// Metadata sink
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    persisted: Vec<(FileCycle, FileMetadata)>,
    purges: usize,
    fail_after: Option<usize>,
}

/// Keeps persisted headers in memory.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    /// Accept `n` headers, then fail every write.
    pub fn failing_after(n: usize) -> Self {
        let sink = Self::default();
        sink.state.lock().unwrap().fail_after = Some(n);
        sink
    }

    pub fn persisted(&self) -> Vec<(FileCycle, FileMetadata)> {
        self.state.lock().unwrap().persisted.clone()
    }

    pub fn purges(&self) -> usize {
        self.state.lock().unwrap().purges
    }
}

#[async_trait]
impl MetadataSink for MemorySink {
    async fn persist(&mut self, cycle: &FileCycle, metadata: &FileMetadata) -> AppResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_after == Some(state.persisted.len()) {
            return Err(DaqError::Io(std::io::Error::other("disk full")));
        }
        state.persisted.push((cycle.clone(), metadata.clone()));
        Ok(())
    }

    async fn purge_partial(&mut self) -> AppResult<usize> {
        self.state.lock().unwrap().purges += 1;
        Ok(0)
    }
}

// ============================================================================
// Trigger
// ============================================================================

/// Fires after a delay (10 ms by default) and counts how often it was used.
#[derive(Clone, Debug)]
pub struct CountingTrigger {
    mode: TriggerMode,
    delay: Duration,
    fired: Arc<AtomicUsize>,
}

impl CountingTrigger {
    pub fn new(mode: TriggerMode) -> Self {
        Self {
            mode,
            delay: Duration::from_millis(10),
            fired: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }

    pub fn fired(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TriggerSource for CountingTrigger {
    fn mode(&self) -> TriggerMode {
        self.mode
    }

    async fn await_trigger(&mut self) -> AppResult<TriggerEvent> {
        let waited = self.delay;
        tokio::time::sleep(waited).await;
        self.fired.fetch_add(1, Ordering::SeqCst);
        Ok(TriggerEvent {
            mode: self.mode,
            waited,
            peer: None,
        })
    }
}

// ============================================================================
// Rig
// ============================================================================

/// A sequencer wired to mocks, with handles on every mock kept for
/// inspection.
pub struct Rig {
    pub analyzer: MockAdapter,
    pub recorder: MockAdapter,
    pub sink: MemorySink,
    pub automatic: CountingTrigger,
    pub manual: CountingTrigger,
    pub events: broadcast::Receiver<EngineEvent>,
    pub sequencer: Sequencer,
}

impl Rig {
    pub fn new() -> Self {
        Self::build(
            MockAdapter::new("analyzer"),
            healthy_recorder(),
            RecorderSettings::default(),
            MemorySink::default(),
        )
    }

    pub fn build(
        analyzer: MockAdapter,
        recorder: MockAdapter,
        settings: RecorderSettings,
        sink: MemorySink,
    ) -> Self {
        Self::assemble(
            analyzer,
            recorder,
            settings,
            sink,
            CountingTrigger::new(TriggerMode::Automatic),
        )
    }

    /// Healthy instruments with an automatic trigger that takes `delay`.
    pub fn with_automatic_delay(delay: Duration) -> Self {
        Self::assemble(
            MockAdapter::new("analyzer"),
            healthy_recorder(),
            RecorderSettings::default(),
            MemorySink::default(),
            CountingTrigger::new(TriggerMode::Automatic).with_delay(delay),
        )
    }

    fn assemble(
        analyzer: MockAdapter,
        recorder: MockAdapter,
        settings: RecorderSettings,
        sink: MemorySink,
        automatic: CountingTrigger,
    ) -> Self {
        let bus = EventBus::default();
        let events = bus.subscribe();
        let manual = CountingTrigger::new(TriggerMode::Manual);
        let sequencer = Sequencer::new(
            SpectrumAnalyzer::new(Box::new(analyzer.clone()), Duration::from_secs(12)),
            IqRecorder::new(Box::new(recorder.clone()), settings, bus.clone()),
            Box::new(sink.clone()),
            TriggerSet::new(Box::new(automatic.clone()), Box::new(manual.clone())),
            bus,
        );
        Self {
            analyzer,
            recorder,
            sink,
            automatic,
            manual,
            events,
            sequencer,
        }
    }

    pub fn stop_after(self, files: u32) -> Self {
        Self {
            sequencer: self
                .sequencer
                .with_stop_condition(StopCondition::from_limit(Some(files))),
            ..self
        }
    }
}
