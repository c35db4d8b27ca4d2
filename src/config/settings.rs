//! Strongly-typed settings loaded with Figment.

use crate::core::{StopCondition, TriggerMode};
use crate::error::{AppResult, DaqError};
use crate::instrument::poll::PollSettings;
use crate::parameters::AcquisitionParameters;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default file the binary reads when no `--config` is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/iq_daq.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub application: ApplicationConfig,
    pub analyzer: AnalyzerConfig,
    pub recorder: RecorderConfig,
    pub polling: PollingConfig,
    pub trigger: TriggerConfig,
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub run: RunConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Append-mode log file; stderr only when absent.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// Network location and socket timeouts of one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentEndpoint {
    pub host: String,
    #[serde(default = "default_scpi_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default = "default_io_timeout", with = "humantime_serde")]
    pub io_timeout: Duration,
}

/// Spectrum analyzer (I/Q source) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    #[serde(flatten)]
    pub endpoint: InstrumentEndpoint,
    /// Fixed wait after `*CAL?`; a hardware characteristic, not a poll.
    #[serde(default = "default_calibration_settle", with = "humantime_serde")]
    pub calibration_settle: Duration,
}

/// I/Q recorder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    #[serde(flatten)]
    pub endpoint: InstrumentEndpoint,
    /// Drive the recorder writes waveforms to.
    #[serde(default = "default_record_drive")]
    pub record_drive: String,
    /// Network drive the archive engine exports to.
    #[serde(default = "default_archive_drive")]
    pub archive_drive: String,
    /// Second local drive holding the `.ws2` part of a recording.
    #[serde(default = "default_scratch_drive")]
    pub scratch_drive: String,
    #[serde(default = "default_arm_settle", with = "humantime_serde")]
    pub arm_settle: Duration,
    #[serde(default = "default_export_settle", with = "humantime_serde")]
    pub export_settle: Duration,
    #[serde(default = "default_cleanup_settle", with = "humantime_serde")]
    pub cleanup_settle: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Upper bound for each status poll loop. The recording loop is allowed
    /// the expected file duration on top of this.
    #[serde(default = "default_poll_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default)]
    pub mode: TriggerMode,
    #[serde(default = "default_trigger_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_trigger_port")]
    pub port: u16,
    #[serde(default = "default_manual_delay", with = "humantime_serde")]
    pub manual_delay: Duration,
}

impl TriggerConfig {
    /// Address the external trigger listens on.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Default acquisition parameters; the CLI may override each value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    pub center_frequency: f64,
    pub span: f64,
    pub reference_level: f64,
    pub duration: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// Stop after this many files; run until stopped when absent.
    #[serde(default)]
    pub stop_after: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory receiving the per-file JSON headers.
    pub metadata_dir: PathBuf,
    #[serde(default = "default_header_extension")]
    pub header_extension: String,
    /// Extension of partially exported files removed at exit.
    #[serde(default = "default_partial_extension")]
    pub partial_extension: String,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_scpi_port() -> u16 {
    5025
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_calibration_settle() -> Duration {
    Duration::from_secs(12)
}

fn default_record_drive() -> String {
    "e:".to_string()
}

fn default_archive_drive() -> String {
    "z:".to_string()
}

fn default_scratch_drive() -> String {
    "f:".to_string()
}

fn default_arm_settle() -> Duration {
    Duration::from_secs(2)
}

fn default_export_settle() -> Duration {
    Duration::from_secs(1)
}

fn default_cleanup_settle() -> Duration {
    Duration::from_millis(100)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_trigger_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_trigger_port() -> u16 {
    5555
}

fn default_manual_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_header_extension() -> String {
    "wvh".to_string()
}

fn default_partial_extension() -> String {
    "wsm".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        let endpoint = |host: &str| InstrumentEndpoint {
            host: host.to_string(),
            port: default_scpi_port(),
            connect_timeout: default_connect_timeout(),
            io_timeout: default_io_timeout(),
        };
        Self {
            application: ApplicationConfig {
                name: "iq-daq".to_string(),
                log_level: "info".to_string(),
                log_file: None,
            },
            analyzer: AnalyzerConfig {
                endpoint: endpoint("10.10.91.95"),
                calibration_settle: default_calibration_settle(),
            },
            recorder: RecorderConfig {
                endpoint: endpoint("10.10.91.93"),
                record_drive: default_record_drive(),
                archive_drive: default_archive_drive(),
                scratch_drive: default_scratch_drive(),
                arm_settle: default_arm_settle(),
                export_settle: default_export_settle(),
                cleanup_settle: default_cleanup_settle(),
            },
            polling: PollingConfig {
                interval: default_poll_interval(),
                timeout: default_poll_timeout(),
            },
            trigger: TriggerConfig {
                mode: TriggerMode::Automatic,
                bind: default_trigger_bind(),
                port: default_trigger_port(),
                manual_delay: default_manual_delay(),
            },
            acquisition: AcquisitionConfig {
                center_frequency: 245e6,
                span: 5e6,
                reference_level: -45.0,
                duration: 2.0,
            },
            run: RunConfig::default(),
            storage: StorageConfig {
                metadata_dir: PathBuf::from("data"),
                header_extension: default_header_extension(),
                partial_extension: default_partial_extension(),
            },
        }
    }
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// Built-in defaults sit underneath the file, so a config file only
    /// needs the keys that differ. `IQDAQ_`-prefixed environment variables
    /// override both.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("IQDAQ_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse a TOML string on top of the defaults (no environment).
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(toml))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        for (name, endpoint) in [
            ("analyzer", &self.analyzer.endpoint),
            ("recorder", &self.recorder.endpoint),
        ] {
            if endpoint.host.trim().is_empty() {
                return Err(DaqError::Configuration(format!(
                    "{}: 'host' cannot be empty",
                    name
                )));
            }
            if endpoint.port == 0 {
                return Err(DaqError::Configuration(format!(
                    "{}: 'port' must be > 0",
                    name
                )));
            }
        }

        if self.polling.interval.is_zero() {
            return Err(DaqError::Configuration(
                "polling: 'interval' must be > 0".to_string(),
            ));
        }

        if self.trigger.port == 0 {
            return Err(DaqError::Configuration(
                "trigger: 'port' must be > 0".to_string(),
            ));
        }

        if self.run.stop_after == Some(0) {
            return Err(DaqError::Configuration(
                "run: 'stop_after' must be > 0 (omit it to run until stopped)".to_string(),
            ));
        }

        self.acquisition_parameters()
            .map_err(|e| DaqError::Configuration(format!("acquisition: {}", e)))?;

        Ok(())
    }

    pub fn acquisition_parameters(&self) -> AppResult<AcquisitionParameters> {
        AcquisitionParameters::new(
            self.acquisition.center_frequency,
            self.acquisition.span,
            self.acquisition.reference_level,
            self.acquisition.duration,
        )
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: self.polling.interval,
            timeout: self.polling.timeout,
        }
    }

    pub fn stop_condition(&self) -> StopCondition {
        StopCondition::from_limit(self.run.stop_after)
    }
}
