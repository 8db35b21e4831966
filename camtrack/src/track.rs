//! GPX track-file decoding.

use std::io::Cursor;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{SourceKind, TelemetryError};

/// A track point in document order. `elevation` stays `None` when the file
/// has no `<ele>` for the point.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrackPoint {
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
    pub time: Option<DateTime<Utc>>,
}

/// Parse every `<trkpt>` of every `<trk>`/`<trkseg>`, concatenated in
/// document order.
pub fn parse_track(input: &str) -> Result<Vec<TrackPoint>, TelemetryError> {
    let mut cursor = Cursor::new(input.as_bytes());
    let gpx = gpx::read(&mut cursor)
        .map_err(|e| TelemetryError::format(SourceKind::TrackFile, e.to_string()))?;
    if gpx.tracks.is_empty() {
        return Err(TelemetryError::format(
            SourceKind::TrackFile,
            "document has no <trk> element",
        ));
    }

    let mut out = Vec::new();
    for (track_idx, track) in gpx.tracks.into_iter().enumerate() {
        for segment in track.segments {
            debug!(
                "track {} segment with {} points",
                track_idx,
                segment.points.len()
            );
            for point in segment.points {
                let time = match point.time {
                    Some(time) => {
                        let iso = time
                            .format()
                            .map_err(|e| TelemetryError::format(SourceKind::TrackFile, e.to_string()))?;
                        let utc = DateTime::parse_from_rfc3339(&iso)
                            .map_err(|e| TelemetryError::format(SourceKind::TrackFile, e.to_string()))?
                            .with_timezone(&Utc);
                        Some(utc)
                    }
                    None => None,
                };
                let geo = point.point();
                out.push(TrackPoint {
                    lat: geo.y(),
                    lon: geo.x(),
                    elevation: point.elevation,
                    time,
                });
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn test_parses_points_in_document_order() {
        let doc = fixtures::gpx(&[
            (51.5, -3.2, Some(120.5), Some("2024-05-01T10:00:05Z")),
            (51.6, -3.3, None, Some("2024-05-01T10:00:01Z")),
            (51.7, -3.4, Some(0.0), None),
        ]);
        let points = parse_track(&doc).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].lat, 51.5);
        assert_eq!(points[0].lon, -3.2);
        assert_eq!(points[0].elevation, Some(120.5));
        // out-of-order times are kept as written
        assert!(points[0].time.unwrap() > points[1].time.unwrap());
        assert_eq!(points[1].elevation, None);
        assert_eq!(points[2].elevation, Some(0.0));
        assert!(points[2].time.is_none());
    }

    #[test]
    fn test_concatenates_segments() {
        let doc = r#"<?xml version="1.0"?>
<gpx version="1.1" creator="test">
  <trk>
    <trkseg><trkpt lat="1.0" lon="2.0"></trkpt></trkseg>
    <trkseg><trkpt lat="3.0" lon="4.0"></trkpt><trkpt lat="5.0" lon="6.0"></trkpt></trkseg>
  </trk>
  <trk><trkseg><trkpt lat="7.0" lon="8.0"></trkpt></trkseg></trk>
</gpx>"#;
        let lats: Vec<f64> = parse_track(doc).unwrap().iter().map(|p| p.lat).collect();
        assert_eq!(lats, vec![1.0, 3.0, 5.0, 7.0]);
    }

    #[test]
    fn test_missing_track_is_format_error() {
        let doc = r#"<?xml version="1.0"?>
<gpx version="1.1" creator="test"><wpt lat="1.0" lon="2.0"></wpt></gpx>"#;
        assert!(matches!(
            parse_track(doc),
            Err(TelemetryError::Format {
                origin: SourceKind::TrackFile,
                ..
            })
        ));
    }

    #[test]
    fn test_not_gpx_is_format_error() {
        assert!(matches!(
            parse_track("lat,lon\n1,2\n"),
            Err(TelemetryError::Format { .. })
        ));
    }
}
