//! Configuration System
//!
//! Configuration management using Figment.
//!
//! # Configuration Sources
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `IQDAQ_` (nested keys joined by `__`)
//! 2. TOML configuration file (default: `config/iq_daq.toml`)
//!
//! # Example
//!
//! ```no_run
//! use iq_daq::config::Settings;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load_from("config/iq_daq.toml")?;
//!     println!("Analyzer at {}:{}", settings.analyzer.endpoint.host, settings.analyzer.endpoint.port);
//!     println!("Trigger mode: {}", settings.trigger.mode);
//!     Ok(())
//! }
//! ```
//!
//! # Environment Variables
//!
//! ```text
//! # Point at a different recorder
//! IQDAQ_RECORDER__HOST=10.10.91.94
//!
//! # Poll twice as fast
//! IQDAQ_POLLING__INTERVAL=50ms
//!
//! # Stop after 10 files
//! IQDAQ_RUN__STOP_AFTER=10
//! ```

pub mod settings;

pub use settings::{
    AcquisitionConfig, AnalyzerConfig, ApplicationConfig, InstrumentEndpoint, PollingConfig,
    RecorderConfig, RunConfig, Settings, StorageConfig, TriggerConfig,
};
