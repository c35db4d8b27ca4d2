//! `iq_daq`: run repeated I/Q acquisitions from the command line.
//!
//! The first Ctrl-C finishes the file in flight and stops; a second one
//! abandons it. Either way both instruments are disconnected and partial
//! files are purged before the process exits. On Unix, `SIGUSR1` pauses the
//! run before its next file and `SIGUSR2` resumes it.

use anyhow::{Context, Result};
use clap::Parser;
use iq_daq::adapters::TcpAdapter;
use iq_daq::config::{settings::DEFAULT_CONFIG_PATH, Settings};
use iq_daq::core::{SubMachine, TriggerMode};
use iq_daq::data::JsonHeaderWriter;
use iq_daq::events::{EngineEvent, EventBus};
use iq_daq::instrument::{IqRecorder, RecorderSettings, SpectrumAnalyzer};
use iq_daq::logging;
use iq_daq::trigger::TriggerSet;
use iq_daq::{Sequencer, SequencerHandle};
use std::path::PathBuf;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "iq_daq", version, about = "Sequence a spectrum analyzer and an I/Q recorder")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Stop after this many files (default: run until interrupted).
    #[arg(long)]
    files: Option<u32>,

    /// Trigger mode: automatic (external trigger) or manual (fixed delay).
    #[arg(long)]
    mode: Option<TriggerMode>,

    /// Center frequency in Hz.
    #[arg(long)]
    center_frequency: Option<f64>,

    /// Span in Hz.
    #[arg(long)]
    span: Option<f64>,

    /// Reference level in dBm.
    #[arg(long, allow_negative_numbers = true)]
    reference_level: Option<f64>,

    /// Recording duration per file in seconds.
    #[arg(long)]
    duration: Option<f64>,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        if let Some(files) = self.files {
            settings.run.stop_after = Some(files);
        }
        if let Some(mode) = self.mode {
            settings.trigger.mode = mode;
        }
        let acquisition = &mut settings.acquisition;
        if let Some(v) = self.center_frequency {
            acquisition.center_frequency = v;
        }
        if let Some(v) = self.span {
            acquisition.span = v;
        }
        if let Some(v) = self.reference_level {
            acquisition.reference_level = v;
        }
        if let Some(v) = self.duration {
            acquisition.duration = v;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    cli.apply(&mut settings);
    settings.validate().context("invalid command line overrides")?;
    logging::init(&settings.application).context("failed to initialize logging")?;
    info!("{} starting", settings.application.name);

    let params = settings.acquisition_parameters()?;
    let events = EventBus::default();
    let observer = tokio::spawn(observe(events.subscribe()));

    let (analyzer_link, recorder_link) = tokio::try_join!(
        TcpAdapter::connect("spectrum analyzer", &settings.analyzer.endpoint),
        TcpAdapter::connect("recorder", &settings.recorder.endpoint),
    )
    .context("failed to connect to the instruments")?;

    let analyzer = SpectrumAnalyzer::new(
        Box::new(analyzer_link),
        settings.analyzer.calibration_settle,
    );
    let recorder = IqRecorder::new(
        Box::new(recorder_link),
        RecorderSettings::from(&settings),
        events.clone(),
    );
    let mut sequencer = Sequencer::new(
        analyzer,
        recorder,
        Box::new(JsonHeaderWriter::from_config(&settings.storage)),
        TriggerSet::from_config(&settings.trigger),
        events,
    )
    .with_stop_condition(settings.stop_condition())
    .with_mode(settings.trigger.mode);

    let interrupts = tokio::spawn(handle_interrupts(sequencer.handle()));
    #[cfg(unix)]
    let pauses = tokio::spawn(handle_pause_signals(sequencer.handle()));

    sequencer.lock_parameters(params)?;
    let result = sequencer.run().await;
    sequencer.force_stop().await;

    interrupts.abort();
    let _ = interrupts.await;
    #[cfg(unix)]
    {
        pauses.abort();
        let _ = pauses.await;
    }
    drop(sequencer);
    let _ = observer.await;

    match result {
        Ok(summary) => {
            info!(
                "{} stopped: {} ({})",
                settings.application.name, summary.reason, summary.totals
            );
            Ok(())
        }
        Err(failure) => {
            match failure.phase {
                Some(phase) => error!("run failed during {}", phase),
                None => error!("run failed"),
            }
            Err(failure.into())
        }
    }
}

async fn handle_interrupts(handle: SequencerHandle) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    warn!("interrupted, stopping after the current file (Ctrl-C again to abort it)");
    handle.request_stop();
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    handle.force_stop();
}

#[cfg(unix)]
async fn handle_pause_signals(handle: SequencerHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut pause, mut resume) = match (
        signal(SignalKind::user_defined1()),
        signal(SignalKind::user_defined2()),
    ) {
        (Ok(pause), Ok(resume)) => (pause, resume),
        (Err(e), _) | (_, Err(e)) => {
            warn!("pause signals unavailable: {}", e);
            return;
        }
    };
    loop {
        tokio::select! {
            Some(()) = pause.recv() => handle.pause(),
            Some(()) = resume.recv() => handle.resume(),
            else => break,
        }
    }
}

/// Render engine events as log lines until the bus closes.
async fn observe(mut events: broadcast::Receiver<EngineEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => render(&event),
            Err(RecvError::Lagged(skipped)) => debug!("observer skipped {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

fn render(event: &EngineEvent) {
    match event {
        EngineEvent::Progress {
            machine,
            file_number,
            percent,
            indeterminate,
        } => {
            let action = match machine {
                SubMachine::Record => "recording",
                SubMachine::Export => "exporting",
            };
            if *indeterminate {
                debug!("file {}: {} started", file_number, action);
            } else {
                debug!("file {}: {} {}%", file_number, action, percent);
            }
        }
        EngineEvent::RecordResult {
            file_number,
            prepare,
            record,
        } => info!(
            "file {}: preparing time {:.2} s, recording time {:.2} s",
            file_number,
            prepare.as_secs_f64(),
            record.as_secs_f64()
        ),
        EngineEvent::ExportResult {
            file_number,
            export,
        } => info!(
            "file {}: exporting time {:.2} s",
            file_number,
            export.as_secs_f64()
        ),
        EngineEvent::CycleCompleted { totals, .. } => info!("{}", totals),
        EngineEvent::Paused { next_file, totals } => {
            info!("paused before file {} ({})", next_file, totals)
        }
        EngineEvent::Resumed { next_file } => info!("resuming with file {}", next_file),
        EngineEvent::StateChanged { .. }
        | EngineEvent::Finished { .. }
        | EngineEvent::RunCompleted { .. }
        | EngineEvent::RunFailed { .. } => {}
    }
}
