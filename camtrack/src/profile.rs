//! Declared slot layouts for position-fix streams.
//!
//! A profile says which positional value of a stream sample holds latitude,
//! longitude, altitude and speed, and in which units. Tables are plain data
//! (and load from JSON), so a device family with a different layout is
//! supported by swapping the table rather than changing decode logic.

use serde::{Deserialize, Serialize};

use crate::TelemetryError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpeedUnit {
    MetersPerSecond,
    Knots,
    KilometersPerHour,
}

impl SpeedUnit {
    pub fn to_kmh(self, value: f64) -> f64 {
        match self {
            SpeedUnit::MetersPerSecond => value * 3.6,
            SpeedUnit::Knots => value * 1.852,
            SpeedUnit::KilometersPerHour => value,
        }
    }
}

impl Default for SpeedUnit {
    fn default() -> Self {
        SpeedUnit::MetersPerSecond
    }
}

/// Slot index of each semantic field within a sample's value vector.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotMap {
    pub lat: usize,
    pub lon: usize,
    #[serde(default)]
    pub alt: Option<usize>,
    #[serde(default)]
    pub speed: Option<usize>,
    /// Days since 2000-01-01 UTC.
    #[serde(default)]
    pub gps_days: Option<usize>,
    /// Seconds since UTC midnight of `gps_days`.
    #[serde(default)]
    pub gps_seconds: Option<usize>,
    #[serde(default)]
    pub dop: Option<usize>,
    #[serde(default)]
    pub fix: Option<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StreamProfile {
    pub id: String,
    /// Exact stream names, or prefixes ending in `*`.
    pub stream_names: Vec<String>,
    pub slots: SlotMap,
    /// Applied after the container's own scale; 1.0 when altitude is already meters.
    #[serde(default = "unit_divisor")]
    pub altitude_divisor: f64,
    #[serde(default)]
    pub speed_unit: SpeedUnit,
}

fn unit_divisor() -> f64 {
    1.0
}

impl StreamProfile {
    pub fn matches(&self, stream_name: &str) -> bool {
        self.stream_names
            .iter()
            .any(|pattern| match pattern.strip_suffix('*') {
                Some(prefix) => stream_name.starts_with(prefix),
                None => pattern == stream_name,
            })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProfileTable {
    pub version: String,
    pub profiles: Vec<StreamProfile>,
}

impl Default for ProfileTable {
    fn default() -> Self {
        ProfileTable::gpmf()
    }
}

impl ProfileTable {
    /// Built-in layouts for GoPro GPMF position streams.
    pub fn gpmf() -> Self {
        Self {
            version: "gpmf.v1".to_string(),
            profiles: vec![
                // lat, lon, alt, 2D speed, 3D speed
                StreamProfile {
                    id: "gpmf.gps5.v1".to_string(),
                    stream_names: vec!["GPS5".to_string()],
                    slots: SlotMap {
                        lat: 0,
                        lon: 1,
                        alt: Some(2),
                        speed: Some(3),
                        gps_days: None,
                        gps_seconds: None,
                        dop: None,
                        fix: None,
                    },
                    altitude_divisor: 1.0,
                    speed_unit: SpeedUnit::MetersPerSecond,
                },
                // lat, lon, alt, 2D speed, 3D speed, days, seconds, DOP, fix
                StreamProfile {
                    id: "gpmf.gps9.v1".to_string(),
                    stream_names: vec!["GPS9".to_string()],
                    slots: SlotMap {
                        lat: 0,
                        lon: 1,
                        alt: Some(2),
                        speed: Some(3),
                        gps_days: Some(5),
                        gps_seconds: Some(6),
                        dop: Some(7),
                        fix: Some(8),
                    },
                    altitude_divisor: 1.0,
                    speed_unit: SpeedUnit::MetersPerSecond,
                },
            ],
        }
    }

    pub fn from_json(input: &str) -> Result<Self, TelemetryError> {
        let table: ProfileTable = serde_json::from_str(input)
            .map_err(|e| TelemetryError::InvalidParameter(format!("profile table: {e}")))?;
        table.validate()?;
        Ok(table)
    }

    /// First profile whose name patterns match, in table order.
    pub fn lookup(&self, stream_name: &str) -> Option<&StreamProfile> {
        self.profiles.iter().find(|p| p.matches(stream_name))
    }

    pub fn is_position_fix(&self, stream_name: &str) -> bool {
        self.lookup(stream_name).is_some()
    }

    pub fn validate(&self) -> Result<(), TelemetryError> {
        for profile in &self.profiles {
            if profile.stream_names.iter().all(|n| n.trim().is_empty()) {
                return Err(TelemetryError::InvalidParameter(format!(
                    "profile {} has no stream names",
                    profile.id
                )));
            }
            if profile.slots.lat == profile.slots.lon {
                return Err(TelemetryError::InvalidParameter(format!(
                    "profile {} maps latitude and longitude to the same slot",
                    profile.id
                )));
            }
            if !(profile.altitude_divisor.is_finite() && profile.altitude_divisor != 0.0) {
                return Err(TelemetryError::InvalidParameter(format!(
                    "profile {} has an unusable altitude divisor",
                    profile.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_name_based() {
        let table = ProfileTable::gpmf();
        assert_eq!(table.lookup("GPS5").unwrap().id, "gpmf.gps5.v1");
        assert_eq!(table.lookup("GPS9").unwrap().id, "gpmf.gps9.v1");
        assert!(table.lookup("ACCL").is_none());
        assert!(!table.is_position_fix("GPSU"));
    }

    #[test]
    fn test_prefix_patterns() {
        let mut table = ProfileTable::gpmf();
        table.profiles[0].stream_names = vec!["GPS*".to_string()];
        assert!(table.is_position_fix("GPSX"));
        assert!(!table.is_position_fix("GYRO"));
    }

    #[test]
    fn test_speed_units() {
        assert!((SpeedUnit::MetersPerSecond.to_kmh(5.0) - 18.0).abs() < 1e-12);
        assert!((SpeedUnit::Knots.to_kmh(10.0) - 18.52).abs() < 1e-12);
        assert_eq!(SpeedUnit::KilometersPerHour.to_kmh(42.0), 42.0);
    }

    #[test]
    fn test_vendor_table_from_json() {
        let json = r#"{
            "version": "acme.v2",
            "profiles": [{
                "id": "acme.pos.v2",
                "stream_names": ["APOS"],
                "slots": {"lat": 1, "lon": 0, "alt": 2, "speed": 3},
                "altitude_divisor": 3.28084,
                "speed_unit": "knots"
            }]
        }"#;
        let table = ProfileTable::from_json(json).unwrap();
        let profile = table.lookup("APOS").unwrap();
        assert_eq!(profile.slots.lat, 1);
        assert_eq!(profile.speed_unit, SpeedUnit::Knots);
        assert!(table.lookup("GPS5").is_none());
    }

    #[test]
    fn test_rejects_degenerate_slots() {
        let json = r#"{"version": "x", "profiles": [{"id": "bad", "stream_names": ["GPS5"],
            "slots": {"lat": 0, "lon": 0}}]}"#;
        assert!(matches!(
            ProfileTable::from_json(json),
            Err(TelemetryError::InvalidParameter(_))
        ));
    }
}
