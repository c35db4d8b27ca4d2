//! Acquisition parameters and the sample-count arithmetic derived from them.
//!
//! The recorder stores samples in blocks of [`SAMPLE_BLOCK_SIZE`]; the
//! requested duration is therefore rounded up to a whole number of blocks.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Recorder storage granularity in samples.
pub const SAMPLE_BLOCK_SIZE: u64 = 2_621_440;

/// I/Q sampling rate as a multiple of the analyzer span.
pub const SPAN_TO_SAMPLE_RATE: f64 = 1.25;

/// Operator-chosen acquisition settings, locked for the whole run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionParameters {
    /// Center frequency in Hz.
    pub center_frequency: f64,
    /// Span in Hz.
    pub span: f64,
    /// Reference level in dBm.
    pub reference_level: f64,
    /// Requested recording duration in seconds.
    pub duration: f64,
}

impl AcquisitionParameters {
    /// Build validated parameters.
    pub fn new(
        center_frequency: f64,
        span: f64,
        reference_level: f64,
        duration: f64,
    ) -> AppResult<Self> {
        let params = Self {
            center_frequency,
            span,
            reference_level,
            duration,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> AppResult<()> {
        let finite = [
            self.center_frequency,
            self.span,
            self.reference_level,
            self.duration,
        ]
        .iter()
        .all(|v| v.is_finite());
        if !finite {
            return Err(DaqError::InvalidParameters(
                "all values must be finite".to_string(),
            ));
        }
        if self.center_frequency <= 0.0 {
            return Err(DaqError::InvalidParameters(format!(
                "center frequency must be positive, got {} Hz",
                self.center_frequency
            )));
        }
        if self.span <= 0.0 {
            return Err(DaqError::InvalidParameters(format!(
                "span must be positive, got {} Hz",
                self.span
            )));
        }
        if self.duration <= 0.0 {
            return Err(DaqError::InvalidParameters(format!(
                "duration must be positive, got {} s",
                self.duration
            )));
        }
        Ok(())
    }

    /// I/Q sampling rate in Hz (span x 1.25).
    pub fn sampling_rate(&self) -> f64 {
        self.span * SPAN_TO_SAMPLE_RATE
    }

    /// Smallest positive multiple of [`SAMPLE_BLOCK_SIZE`] covering the
    /// requested duration.
    pub fn sample_count(&self) -> u64 {
        let needed = (self.sampling_rate() * self.duration).ceil().max(1.0) as u64;
        needed.div_ceil(SAMPLE_BLOCK_SIZE) * SAMPLE_BLOCK_SIZE
    }

    /// How long the recorder should take for one file.
    pub fn expected_record_time(&self) -> Duration {
        Duration::from_secs_f64(self.sample_count() as f64 / self.sampling_rate())
    }

    pub fn format(&self) -> SampleFormat {
        SampleFormat::default()
    }
}

/// Sample type written by the recorder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleType {
    #[default]
    Int16,
}

/// Byte order of the recorded samples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    Little,
    Big,
}

/// Fixed on-disk format descriptor of a recorded file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleFormat {
    pub format: SampleType,
    pub endian: Endian,
    /// Bits per sample component.
    pub resolution: u8,
}

impl Default for SampleFormat {
    fn default() -> Self {
        Self {
            format: SampleType::Int16,
            endian: Endian::Little,
            resolution: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(span: f64, duration: f64) -> AcquisitionParameters {
        AcquisitionParameters::new(245e6, span, -45.0, duration).unwrap()
    }

    #[test]
    fn test_default_experiment_values() {
        let p = params(5e6, 2.0);
        assert_eq!(p.sampling_rate(), 6.25e6);
        // 12.5e6 samples needed -> 5 blocks
        assert_eq!(p.sample_count(), 5 * SAMPLE_BLOCK_SIZE);
    }

    #[test]
    fn test_sample_count_is_smallest_covering_multiple() {
        let cases = [
            (5e6, 2.0),
            (1e3, 0.001),
            (2_097_152.0, 1.0), // exactly one block
            (40e6, 10.0),
            (123_456.7, 3.3),
        ];
        for (span, duration) in cases {
            let p = params(span, duration);
            let count = p.sample_count();
            let needed = p.sampling_rate() * p.duration;
            assert!(count > 0);
            assert_eq!(count % SAMPLE_BLOCK_SIZE, 0);
            assert!(count as f64 >= needed, "{count} < {needed}");
            assert!(
                ((count - SAMPLE_BLOCK_SIZE) as f64) < needed,
                "{count} is not the smallest multiple for {needed}"
            );
        }
    }

    #[test]
    fn test_exact_multiple_is_not_rounded_up() {
        let p = params(2_097_152.0, 1.0);
        assert_eq!(p.sample_count(), SAMPLE_BLOCK_SIZE);
    }

    #[test]
    fn test_expected_record_time() {
        let p = params(5e6, 2.0);
        let expected = (5 * SAMPLE_BLOCK_SIZE) as f64 / 6.25e6;
        assert!((p.expected_record_time().as_secs_f64() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert!(AcquisitionParameters::new(245e6, 0.0, -45.0, 2.0).is_err());
        assert!(AcquisitionParameters::new(245e6, 5e6, -45.0, -1.0).is_err());
        assert!(AcquisitionParameters::new(f64::NAN, 5e6, -45.0, 2.0).is_err());
        assert!(AcquisitionParameters::new(0.0, 5e6, -45.0, 2.0).is_err());
    }
}
