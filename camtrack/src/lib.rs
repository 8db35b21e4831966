//! Action-camera telemetry normalization.
//!
//! Reads GPMF telemetry embedded in MP4 containers (or a GPX sidecar track)
//! and produces a time-ordered sequence of position samples with altitude,
//! speed and timestamps in one canonical schema.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod container;
pub mod gpmf;
pub mod kinematics;
pub mod normalize;
pub mod pipeline;
pub mod profile;
pub mod track;

#[cfg(test)]
pub(crate) mod fixtures;

pub use container::{read_container, ContainerFormat, Payload, RawContainer};
pub use gpmf::{decode_payload, DecodedPayload, PayloadTiming, RawSample, StreamKind, StreamRecord};
pub use kinematics::{backfill_speed, backfill_speed_chunked, haversine_distance};
pub use normalize::{normalize_streams, normalize_track};
pub use pipeline::{extract, Extraction, Inputs};
pub use profile::{ProfileTable, SlotMap, SpeedUnit, StreamProfile};
pub use track::{parse_track, TrackPoint};

/// Which caller-supplied input an error refers to.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Video,
    TrackFile,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Video => f.write_str("video"),
            SourceKind::TrackFile => f.write_str("track-file"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TelemetryError {
    #[error("neither a video nor a track-file source was supplied")]
    InputMissing,
    #[error("unrecognized {origin} format: {message}")]
    Format { origin: SourceKind, message: String },
    #[error("corrupt telemetry at byte {offset}: {message}")]
    Decode { offset: usize, message: String },
    #[error("no position telemetry found")]
    NoTelemetryFound,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

impl TelemetryError {
    pub(crate) fn format(origin: SourceKind, message: impl Into<String>) -> Self {
        TelemetryError::Format {
            origin,
            message: message.into(),
        }
    }

    pub(crate) fn decode(offset: usize, message: impl Into<String>) -> Self {
        TelemetryError::Decode {
            offset,
            message: message.into(),
        }
    }

    /// Rebase a payload-relative decode offset onto the enclosing buffer.
    pub fn rebased(self, base: usize) -> Self {
        match self {
            TelemetryError::Decode { offset, message } => TelemetryError::Decode {
                offset: offset + base,
                message,
            },
            other => other,
        }
    }
}

/// Provenance tag of a result.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    Embedded,
    EmbeddedWithTime,
    TrackFile,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Embedded => f.write_str("embedded"),
            Provenance::EmbeddedWithTime => f.write_str("embedded-with-time"),
            Provenance::TrackFile => f.write_str("track-file"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedSample {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_kmh: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iso_time: Option<String>,
}

impl NormalizedSample {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            alt: None,
            speed_kmh: None,
            time_ms: None,
            iso_time: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedResult {
    pub samples: Vec<NormalizedSample>,
    pub total_samples: usize,
    pub source: Provenance,
}

impl NormalizedResult {
    pub fn new(samples: Vec<NormalizedSample>, source: Provenance) -> Self {
        Self {
            total_samples: samples.len(),
            samples,
            source,
        }
    }
}

/// What the track-file path records for a point without `<ele>`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ElevationPolicy {
    Absent,
    Zero,
}

impl Default for ElevationPolicy {
    fn default() -> Self {
        ElevationPolicy::Absent
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    pub profiles: ProfileTable,
    pub min_gps_fix: Option<u32>,
    pub max_dop: Option<f64>,
    pub elevation_policy: ElevationPolicy,
    pub max_depth: usize,
    pub default_payload_ms: f64,
    pub backfill_chunk: Option<usize>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            profiles: ProfileTable::default(),
            min_gps_fix: None,
            max_dop: None,
            elevation_policy: ElevationPolicy::Absent,
            max_depth: 8,
            default_payload_ms: 1000.0,
            backfill_chunk: None,
        }
    }
}

impl Params {
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.max_depth < 2 {
            return Err(TelemetryError::InvalidParameter(format!(
                "max_depth must be at least 2 (got {})",
                self.max_depth
            )));
        }
        if !(self.default_payload_ms.is_finite() && self.default_payload_ms > 0.0) {
            return Err(TelemetryError::InvalidParameter(
                "default_payload_ms must be positive".into(),
            ));
        }
        if self.backfill_chunk == Some(0) {
            return Err(TelemetryError::InvalidParameter(
                "backfill_chunk must be non-zero".into(),
            ));
        }
        if let Some(dop) = self.max_dop {
            if !(dop.is_finite() && dop > 0.0) {
                return Err(TelemetryError::InvalidParameter(
                    "max_dop must be positive".into(),
                ));
            }
        }
        self.profiles.validate()
    }
}

pub(crate) fn iso_millis(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn valid_coordinate(lat: f64, lon: f64) -> bool {
    lat.is_finite()
        && lon.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_serializes_to_wire_shape() {
        let mut sample = NormalizedSample::new(51.5, -3.25);
        sample.time_ms = Some(100);
        let result = NormalizedResult::new(vec![sample], Provenance::EmbeddedWithTime);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["totalSamples"], 1);
        assert_eq!(json["source"], "embedded-with-time");
        assert_eq!(json["samples"][0]["timeMs"], 100);
        assert!(json["samples"][0].get("speedKmh").is_none());
        assert!(json["samples"][0].get("alt").is_none());
    }

    #[test]
    fn test_params_validation() {
        assert!(Params::default().validate().is_ok());
        let mut params = Params::default();
        params.backfill_chunk = Some(0);
        assert!(matches!(
            params.validate(),
            Err(TelemetryError::InvalidParameter(_))
        ));
        let params: Params = serde_json::from_str(r#"{"min_gps_fix": 3}"#).unwrap();
        assert_eq!(params.min_gps_fix, Some(3));
        assert_eq!(params.max_depth, 8);
    }

    #[test]
    fn test_coordinate_bounds() {
        assert!(valid_coordinate(90.0, -180.0));
        assert!(!valid_coordinate(90.5, 0.0));
        assert!(!valid_coordinate(0.0, f64::NAN));
    }
}
