//! Spectrum analyzer acting as the I/Q source.
//!
//! The analyzer is set up once per run: calibrate, configure the I/Q trace
//! and digital output, then start streaming. Nothing stops the stream when a
//! run ends; the recorder simply stops listening to it.

use crate::adapters::ScpiTransport;
use crate::core::CyclePhase;
use crate::error::AppResult;
use crate::parameters::AcquisitionParameters;
use std::time::Duration;
use tracing::info;

/// Controller for the I/Q source. Owns its transport exclusively.
pub struct SpectrumAnalyzer {
    transport: Box<dyn ScpiTransport>,
    calibration_settle: Duration,
}

impl SpectrumAnalyzer {
    pub fn new(transport: Box<dyn ScpiTransport>, calibration_settle: Duration) -> Self {
        Self {
            transport,
            calibration_settle,
        }
    }

    /// Run the self-calibration and wait out the settle time.
    ///
    /// The settle is a fixed hardware characteristic; the reply to `*CAL?`
    /// is not awaited and does not shorten it.
    pub async fn calibrate(&mut self) -> AppResult<()> {
        self.transport.send("*CAL?").await?;
        info!(
            "{} is being calibrated ({:?})",
            self.transport.name(),
            self.calibration_settle
        );
        tokio::time::sleep(self.calibration_settle).await;
        Ok(())
    }

    /// Apply I/Q capture settings for `params`.
    pub async fn configure(&mut self, params: &AcquisitionParameters) -> AppResult<()> {
        for command in configuration_commands(params) {
            self.transport.send(&command).await?;
        }
        info!("{} is all set", self.transport.name());
        Ok(())
    }

    /// Start the continuous I/Q stream.
    pub async fn start(&mut self) -> AppResult<()> {
        self.transport.send("INITiate").await?;
        info!("{}: data is streaming", self.transport.name());
        Ok(())
    }

    /// Calibrate, configure and start in one go.
    pub async fn prepare(&mut self, params: &AcquisitionParameters) -> AppResult<()> {
        async {
            self.calibrate().await?;
            self.configure(params).await?;
            self.start().await
        }
        .await
        .map_err(|e| e.in_phase(CyclePhase::Calibrate))
    }

    pub async fn disconnect(&mut self) -> AppResult<()> {
        self.transport.disconnect().await
    }
}

/// Configuration sequence sent after calibration, in order.
pub fn configuration_commands(params: &AcquisitionParameters) -> Vec<String> {
    vec![
        "TRAC:IQ ON".to_string(),
        format!("FREQuency:CENTer {}MHz", params.center_frequency / 1e6),
        format!("TRACe:IQ:SRATe {}MHz", params.sampling_rate() / 1e6),
        format!("DISP:TRAC:Y:RLEV {}dBm", params.reference_level),
        "INP:ATT:AUTO OFF".to_string(),
        "INP:ATT 0dB".to_string(),
        "OUTPut:DIQ ON".to_string(),
        "OUTPut:UPOR:STAT ON".to_string(),
    ]
}
