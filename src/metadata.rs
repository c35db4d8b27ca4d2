//! Per-file metadata header.
//!
//! One JSON object is written next to every exported recording. The key
//! names are part of the contract with downstream analysis code and are
//! kept exactly as the analysis side expects them (space separated):
//!
//! ```json
//! {
//!     "center frequency": 245000000.0,
//!     "duration": 2.0,
//!     "endian": "little",
//!     "format": "int16",
//!     "number of samples": 13107200,
//!     "reference level": -45.0,
//!     "resolution": 16,
//!     "sampling rate": 6250000.0,
//!     "span": 5000000.0,
//!     "timestamp": "2024-03-05T14:07:09+0100"
//! }
//! ```

use crate::core::FileCycle;
use crate::error::AppResult;
use crate::parameters::{AcquisitionParameters, Endian, SampleType};
use serde::{Deserialize, Serialize};

/// The persisted header of one recorded file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileMetadata {
    #[serde(rename = "center frequency")]
    pub center_frequency: f64,
    pub span: f64,
    #[serde(rename = "reference level")]
    pub reference_level: f64,
    pub duration: f64,
    #[serde(rename = "sampling rate")]
    pub sampling_rate: f64,
    #[serde(rename = "number of samples")]
    pub number_of_samples: u64,
    pub timestamp: String,
    pub format: SampleType,
    pub endian: Endian,
    pub resolution: u8,
}

impl FileMetadata {
    /// Header for `cycle` recorded with `params`.
    pub fn new(params: &AcquisitionParameters, cycle: &FileCycle) -> Self {
        let format = params.format();
        Self {
            center_frequency: params.center_frequency,
            span: params.span,
            reference_level: params.reference_level,
            duration: params.duration,
            sampling_rate: params.sampling_rate(),
            number_of_samples: params.sample_count(),
            timestamp: cycle.iso_timestamp(),
            format: format.format,
            endian: format.endian,
            resolution: format.resolution,
        }
    }

    /// The acquisition parameters this header was written for.
    pub fn parameters(&self) -> AcquisitionParameters {
        AcquisitionParameters {
            center_frequency: self.center_frequency,
            span: self.span,
            reference_level: self.reference_level,
            duration: self.duration,
        }
    }

    /// Pretty JSON with keys in lexicographic order.
    pub fn to_json_pretty(&self) -> AppResult<String> {
        // serde_json::Map is a BTreeMap without `preserve_order`, so going
        // through Value sorts the keys.
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_string_pretty(&value)?)
    }

    pub fn from_json(text: &str) -> AppResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn sample() -> (AcquisitionParameters, FileCycle) {
        let params = AcquisitionParameters::new(245e6, 5e6, -45.0, 2.0).unwrap();
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let cycle = FileCycle::begin(7, tz.with_ymd_and_hms(2023, 11, 2, 9, 30, 0).unwrap());
        (params, cycle)
    }

    #[test]
    fn test_header_keys() {
        let (params, cycle) = sample();
        let json = FileMetadata::new(&params, &cycle).to_json_pretty().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "center frequency",
                "duration",
                "endian",
                "format",
                "number of samples",
                "reference level",
                "resolution",
                "sampling rate",
                "span",
                "timestamp",
            ]
        );
        assert_eq!(value["format"], "int16");
        assert_eq!(value["endian"], "little");
        assert_eq!(value["resolution"], 16);
        assert_eq!(value["number of samples"], 13_107_200);
        assert_eq!(value["timestamp"], "2023-11-02T09:30:00+0200");
    }

    #[test]
    fn test_header_reproduces_parameters() {
        let (params, cycle) = sample();
        let json = FileMetadata::new(&params, &cycle).to_json_pretty().unwrap();
        let parsed = FileMetadata::from_json(&json).unwrap();
        assert_eq!(parsed.parameters(), params);
    }
}
