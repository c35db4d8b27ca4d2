//! Run sequencing across the analyzer, the recorder and a trigger source.
//!
//! The [`Sequencer`] is the single coordinating task of a run. It owns the
//! authoritative [`EngineState`] and the [`RunTotals`]; everything else sees
//! them through a [`SequencerHandle`]:
//!
//! ```text
//!                 lock_parameters()                run()
//! SequencerHandle ------------------> Sequencer ------------------------+
//!   request_stop  ---stop (watch)-->      |   spawn: analyzer prepare    |
//!   force_stop    ---force (watch)->      |   per cycle:                 |
//!   pause/resume  ---pause (watch)->      |     trigger -> record ->     |
//!   set_mode      ---mode (watch)-->      |     export -> persist        |
//!   state()       <--state (watch)--      |                              |
//!   subscribe()   <--EventBus-------------+------------------------------+
//! ```
//!
//! A stop request is honored at the next cycle boundary, or immediately while
//! the cycle is still waiting for its trigger; an in-flight record or export
//! always runs to completion. A pause holds the run before its next file with
//! totals and file numbering intact. A forced stop abandons the current cycle,
//! disconnects both instruments and purges partial artifacts.

use crate::core::{
    CyclePhase, EngineState, FileCycle, RunTotals, StopCondition, StopReason, TriggerMode,
};
use crate::data::MetadataSink;
use crate::error::{AppResult, DaqError};
use crate::events::{EngineEvent, EventBus};
use crate::instrument::{IqRecorder, SpectrumAnalyzer};
use crate::logging::run_span;
use crate::metadata::FileMetadata;
use crate::parameters::AcquisitionParameters;
use crate::trigger::{TriggerEvent, TriggerSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument, Span};
use uuid::Uuid;

/// What a completed cycle tells the run loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    Continue,
    Stop(StopReason),
}

/// Result of a run that halted without error.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub reason: StopReason,
    pub totals: RunTotals,
    pub parameters: Option<AcquisitionParameters>,
}

/// A run that ended in [`EngineState::Failed`].
///
/// Carries the phase that failed and the totals accumulated up to that point.
#[derive(Debug, Error)]
#[error("run {run_id} failed after {} completed file(s)", .totals.cycles)]
pub struct RunFailure {
    pub run_id: Uuid,
    pub phase: Option<CyclePhase>,
    #[source]
    pub error: DaqError,
    pub totals: RunTotals,
}

impl RunFailure {
    fn new(run_id: Uuid, error: DaqError, totals: RunTotals) -> Self {
        Self {
            run_id,
            phase: error.phase(),
            error,
            totals,
        }
    }
}

/// Recorder setup prepared for the next cycle.
#[derive(Clone, Copy, Debug, PartialEq)]
struct RecorderInit {
    file_size: u64,
    sample_rate: f64,
}

impl RecorderInit {
    fn for_parameters(params: &AcquisitionParameters) -> Self {
        Self {
            file_size: params.sample_count(),
            sample_rate: params.sampling_rate(),
        }
    }
}

/// Operator controls shared between the sequencer and its handles.
#[derive(Debug)]
struct Control {
    stop: watch::Sender<bool>,
    force: watch::Sender<bool>,
    pause: watch::Sender<bool>,
    mode: watch::Sender<TriggerMode>,
}

type AnalyzerSetup = JoinHandle<(SpectrumAnalyzer, AppResult<()>)>;

/// Drives repeated file cycles until a stop condition is met.
pub struct Sequencer {
    analyzer: Option<SpectrumAnalyzer>,
    setup: Option<AnalyzerSetup>,
    recorder: IqRecorder,
    sink: Box<dyn MetadataSink>,
    triggers: TriggerSet,
    events: EventBus,
    state: watch::Sender<EngineState>,
    control: Arc<Control>,
    stop_condition: StopCondition,
    params: Option<AcquisitionParameters>,
    pending_init: Option<RecorderInit>,
    totals: RunTotals,
    next_file: u32,
    run_id: Uuid,
    span: Span,
}

impl Sequencer {
    /// `events` should be the bus the recorder was built with, so observers
    /// see sub-machine and lifecycle events on one channel.
    pub fn new(
        analyzer: SpectrumAnalyzer,
        recorder: IqRecorder,
        sink: Box<dyn MetadataSink>,
        triggers: TriggerSet,
        events: EventBus,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::Uninitialized);
        let control = Control {
            stop: watch::channel(false).0,
            force: watch::channel(false).0,
            pause: watch::channel(false).0,
            mode: watch::channel(TriggerMode::default()).0,
        };
        Self {
            analyzer: Some(analyzer),
            setup: None,
            recorder,
            sink,
            triggers,
            events,
            state,
            control: Arc::new(control),
            stop_condition: StopCondition::UntilStopped,
            params: None,
            pending_init: None,
            totals: RunTotals::default(),
            next_file: 1,
            run_id: Uuid::nil(),
            span: Span::none(),
        }
    }

    pub fn with_stop_condition(mut self, condition: StopCondition) -> Self {
        self.stop_condition = condition;
        self
    }

    pub fn with_mode(self, mode: TriggerMode) -> Self {
        self.control.mode.send_replace(mode);
        self
    }

    pub fn handle(&self) -> SequencerHandle {
        SequencerHandle {
            state: self.state.subscribe(),
            control: Arc::clone(&self.control),
            events: self.events.clone(),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn totals(&self) -> RunTotals {
        self.totals
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Start a new run with `params`.
    ///
    /// Resets the totals and file numbering, starts analyzer calibration in
    /// the background and prepares the recorder setup for the first file.
    pub fn lock_parameters(&mut self, params: AcquisitionParameters) -> AppResult<()> {
        let current = self.state();
        if !current.can_transition_to(EngineState::Calibrating) {
            return Err(DaqError::InvalidTransition {
                from: current,
                to: EngineState::Calibrating,
            });
        }
        params.validate()?;
        let mut analyzer = self.analyzer.take().ok_or_else(|| {
            DaqError::Instrument("spectrum analyzer is not available".to_string())
        })?;

        self.run_id = Uuid::new_v4();
        self.span = run_span(self.run_id);
        self.params = Some(params);
        self.pending_init = Some(RecorderInit::for_parameters(&params));
        self.totals = RunTotals::default();
        self.next_file = 1;
        self.control.stop.send_replace(false);
        self.control.force.send_replace(false);
        self.control.pause.send_replace(false);

        self.transition(EngineState::Calibrating)?;
        self.span.in_scope(|| {
            info!(
                "run started: {} MHz center, {} MHz span, {} dBm, {} s per file, {} samples per file",
                params.center_frequency / 1e6,
                params.span / 1e6,
                params.reference_level,
                params.duration,
                params.sample_count()
            );
        });

        let setup = async move {
            let result = analyzer.prepare(&params).await;
            (analyzer, result)
        };
        self.setup = Some(tokio::spawn(setup.instrument(self.span.clone())));
        Ok(())
    }

    /// Run cycles until the stop condition, a stop request, a forced stop or
    /// an error ends the run.
    pub async fn run(&mut self) -> Result<RunSummary, RunFailure> {
        let current = self.state();
        if current != EngineState::Calibrating {
            return Err(RunFailure::new(
                self.run_id,
                DaqError::InvalidTransition {
                    from: current,
                    to: EngineState::Armed,
                },
                self.totals,
            ));
        }

        let span = self.span.clone();
        let mut force = self.control.force.subscribe();
        let outcome = {
            let drive = self.drive().instrument(span);
            tokio::pin!(drive);
            tokio::select! {
                result = &mut drive => Some(result),
                () = until(&mut force, true) => None,
            }
        };

        match outcome {
            Some(Ok(reason)) => Ok(self.finish(reason)),
            Some(Err(e)) => Err(self.fail(e)),
            None => {
                {
                    let _entered = self.span.clone().entered();
                    warn!("forced stop, abandoning the current cycle");
                    if self.state() != EngineState::Stopping {
                        if let Err(e) = self.transition(EngineState::Stopping) {
                            warn!("{}", e);
                        }
                    }
                }
                self.force_stop().await;
                Ok(self.finish(StopReason::Forced))
            }
        }
    }

    async fn drive(&mut self) -> AppResult<StopReason> {
        loop {
            if let CycleOutcome::Stop(reason) = self.run_cycle().await? {
                return Ok(reason);
            }
        }
    }

    /// One trigger -> record -> export -> persist iteration.
    pub async fn run_cycle(&mut self) -> AppResult<CycleOutcome> {
        let current = self.state();
        if !current.can_transition_to(EngineState::Armed) {
            return Err(DaqError::InvalidTransition {
                from: current,
                to: EngineState::Armed,
            });
        }
        let params = self.params.ok_or(DaqError::ParametersNotLocked)?;
        self.await_analyzer().await?;

        if self.paused() {
            self.hold().await;
        }
        if self.stop_requested() {
            return self.stop_at_boundary(StopReason::Requested);
        }

        let file_number = self.next_file;
        self.transition(EngineState::Armed)?;
        let init = self
            .pending_init
            .take()
            .unwrap_or_else(|| RecorderInit::for_parameters(&params));
        self.recorder
            .initialize(init.file_size, init.sample_rate)
            .await
            .map_err(|e| e.in_phase(CyclePhase::Initialize))?;

        let Some(trigger) = self.wait_for_trigger(file_number).await? else {
            return self.stop_at_boundary(StopReason::Requested);
        };
        debug!("file {}: triggered after {:?}", file_number, trigger.waited);

        let mut cycle = FileCycle::begin_now(file_number);
        self.transition(EngineState::Recording)?;
        let timing = self.recorder.record(file_number, &cycle.file_name).await?;
        cycle.prepare = timing.prepare;
        cycle.record = timing.record;

        self.transition(EngineState::Exporting)?;
        cycle.export = self.recorder.export(file_number, &cycle.file_name).await?;

        let metadata = FileMetadata::new(&params, &cycle);
        self.sink
            .persist(&cycle, &metadata)
            .await
            .map_err(|e| e.in_phase(CyclePhase::Persist))?;

        self.totals.add(&cycle);
        self.next_file += 1;
        self.transition(EngineState::Idle)?;
        info!(
            "file {} '{}': preparing {:.2} s, recording {:.2} s, exporting {:.2} s",
            cycle.file_number,
            cycle.file_name,
            cycle.prepare.as_secs_f64(),
            cycle.record.as_secs_f64(),
            cycle.export.as_secs_f64()
        );
        self.events.emit(EngineEvent::CycleCompleted {
            cycle,
            totals: self.totals,
        });

        if self.stop_condition.is_met(self.totals.cycles) {
            return self.stop_at_boundary(StopReason::FileLimit(self.totals.cycles));
        }
        if self.stop_requested() {
            return self.stop_at_boundary(StopReason::Requested);
        }
        self.pending_init = Some(RecorderInit::for_parameters(&params));
        Ok(CycleOutcome::Continue)
    }

    /// Disconnect both instruments and purge partial artifacts, whatever the
    /// current phase. Safe to call more than once.
    pub async fn force_stop(&mut self) {
        if let Some(setup) = self.setup.take() {
            setup.abort();
            match setup.await {
                Ok((analyzer, _)) => self.analyzer = Some(analyzer),
                Err(_) => warn!("analyzer setup aborted, its connection was dropped with it"),
            }
        }
        if let Some(analyzer) = self.analyzer.as_mut() {
            if let Err(e) = analyzer.disconnect().await {
                warn!("failed to disconnect the spectrum analyzer: {}", e);
            }
        }
        if let Err(e) = self.recorder.disconnect().await {
            warn!("failed to disconnect the recorder: {}", e);
        }
        match self.sink.purge_partial().await {
            Ok(0) => {}
            Ok(n) => info!("purged {} partial file(s)", n),
            Err(e) => warn!("failed to purge partial files: {}", e),
        }
    }

    async fn await_analyzer(&mut self) -> AppResult<()> {
        let Some(setup) = self.setup.as_mut() else {
            return Ok(());
        };
        let joined = setup.await;
        self.setup = None;
        match joined {
            Ok((analyzer, result)) => {
                self.analyzer = Some(analyzer);
                result
            }
            Err(e) => Err(DaqError::Instrument(format!("analyzer setup task failed: {}", e))
                .in_phase(CyclePhase::Calibrate)),
        }
    }

    /// Wait for the trigger of the selected mode. Returns `None` if a stop is
    /// requested first. Switching the mode drops the pending wait and starts
    /// one on the newly selected source.
    async fn wait_for_trigger(&mut self, file_number: u32) -> AppResult<Option<TriggerEvent>> {
        let control = Arc::clone(&self.control);
        let mut stop = control.stop.subscribe();
        let mut mode = control.mode.subscribe();
        loop {
            let current = *mode.borrow_and_update();
            debug!("file {}: waiting for {} trigger", file_number, current);
            let mut wait = self.triggers.select(current).await_trigger();
            let switched = loop {
                tokio::select! {
                    result = &mut wait => {
                        return result.map(Some).map_err(|e| e.in_phase(CyclePhase::Trigger));
                    }
                    () = until(&mut stop, true) => {
                        info!("file {}: stop requested before the trigger", file_number);
                        return Ok(None);
                    }
                    Ok(()) = mode.changed() => {
                        let next = *mode.borrow_and_update();
                        if next != current {
                            break next;
                        }
                    }
                }
            };
            info!("file {}: switched to {} trigger, restarting the wait", file_number, switched);
        }
    }

    /// Hold before the next file until resumed or asked to stop.
    async fn hold(&self) {
        let mut pause = self.control.pause.subscribe();
        let mut stop = self.control.stop.subscribe();
        info!("paused before file {}", self.next_file);
        self.events.emit(EngineEvent::Paused {
            next_file: self.next_file,
            totals: self.totals,
        });
        tokio::select! {
            () = until(&mut pause, false) => {
                info!("resumed with file {}", self.next_file);
                self.events.emit(EngineEvent::Resumed {
                    next_file: self.next_file,
                });
            }
            () = until(&mut stop, true) => {}
        }
    }

    /// Enter `Stopping`; no further file is started.
    fn stop_at_boundary(&mut self, reason: StopReason) -> AppResult<CycleOutcome> {
        self.transition(EngineState::Stopping)?;
        info!("{}, no further files will be started", reason);
        Ok(CycleOutcome::Stop(reason))
    }

    fn paused(&self) -> bool {
        *self.control.pause.borrow()
    }

    fn stop_requested(&self) -> bool {
        *self.control.stop.borrow()
    }

    fn transition(&mut self, next: EngineState) -> AppResult<()> {
        let from = self.state();
        if !from.can_transition_to(next) {
            return Err(DaqError::InvalidTransition { from, to: next });
        }
        self.state.send_replace(next);
        debug!("state {} -> {}", from, next);
        self.events.emit(EngineEvent::StateChanged { from, to: next });
        Ok(())
    }

    fn finish(&mut self, reason: StopReason) -> RunSummary {
        let _entered = self.span.clone().entered();
        for next in [EngineState::Stopping, EngineState::Stopped] {
            if self.state() == next {
                continue;
            }
            if let Err(e) = self.transition(next) {
                warn!("{}", e);
            }
        }
        info!("run stopped ({}): {}", reason, self.totals);
        self.events.emit(EngineEvent::RunCompleted {
            reason,
            totals: self.totals,
        });
        RunSummary {
            run_id: self.run_id,
            reason,
            totals: self.totals,
            parameters: self.params,
        }
    }

    fn fail(&mut self, error: DaqError) -> RunFailure {
        let _entered = self.span.clone().entered();
        if let Err(e) = self.transition(EngineState::Failed) {
            warn!("{}", e);
        }
        error!("run failed: {}; {}", error, self.totals);
        self.events.emit(EngineEvent::RunFailed {
            phase: error.phase(),
            error: error.to_string(),
            totals: self.totals,
        });
        RunFailure::new(self.run_id, error, self.totals)
    }
}

/// Resolves once the flag reads `value`.
async fn until(rx: &mut watch::Receiver<bool>, value: bool) {
    let closed = rx.wait_for(|v| *v == value).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Read-only view of a sequencer plus the operator controls.
#[derive(Clone, Debug)]
pub struct SequencerHandle {
    state: watch::Receiver<EngineState>,
    control: Arc<Control>,
    events: EventBus,
}

impl SequencerHandle {
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Receiver that wakes on every state change.
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Applies at once; a pending trigger wait restarts on the new source.
    pub fn set_mode(&self, mode: TriggerMode) {
        let previous = self.control.mode.send_replace(mode);
        if previous != mode {
            info!("trigger mode switched to {}", mode);
        }
    }

    pub fn mode(&self) -> TriggerMode {
        *self.control.mode.borrow()
    }

    /// Finish the in-flight cycle, then stop.
    pub fn request_stop(&self) {
        if !self.control.stop.send_replace(true) {
            info!("stop requested, finishing the current cycle");
        }
    }

    pub fn stop_requested(&self) -> bool {
        *self.control.stop.borrow()
    }

    /// Hold the run before its next file. Totals and file numbering carry
    /// over to [`resume`](Self::resume).
    pub fn pause(&self) {
        if !self.control.pause.send_replace(true) {
            info!("pause requested, holding after the current cycle");
        }
    }

    pub fn resume(&self) {
        if self.control.pause.send_replace(false) {
            info!("resume requested");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.control.pause.borrow()
    }

    /// Abandon the in-flight cycle and shut everything down.
    pub fn force_stop(&self) {
        if !self.control.force.send_replace(true) {
            warn!("forced stop requested");
        }
    }
}
