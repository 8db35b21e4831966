//! Maps decoded stream records and track points onto [`NormalizedSample`].

use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::debug;

use crate::gpmf::{RawSample, StreamRecord};
use crate::profile::StreamProfile;
use crate::track::TrackPoint;
use crate::{iso_millis, valid_coordinate, ElevationPolicy, NormalizedSample, Params};

/// Normalize every position-fix stream among `records`.
///
/// Streams are selected by name through the profile table, so their order in
/// the container does not matter. Samples from all matching streams are
/// merged, then stably sorted by `time_ms` (absent sorts as 0).
pub fn normalize_streams(records: &[StreamRecord], params: &Params) -> Vec<NormalizedSample> {
    let mut out = Vec::new();
    for record in records {
        let Some(profile) = params.profiles.lookup(&record.stream_name) else {
            continue;
        };
        let before = out.len();
        out.extend(
            record
                .samples
                .iter()
                .filter_map(|sample| map_sample(sample, record, profile, params)),
        );
        debug!(
            "{} via {}: kept {} of {} samples",
            record.stream_name,
            profile.id,
            out.len() - before,
            record.samples.len()
        );
    }
    sort_by_time(&mut out);
    out
}

fn map_sample(
    sample: &RawSample,
    record: &StreamRecord,
    profile: &StreamProfile,
    params: &Params,
) -> Option<NormalizedSample> {
    let slot = |index: usize| sample.values.get(index).copied().filter(|v| v.is_finite());
    let slots = &profile.slots;

    let lat = slot(slots.lat)?;
    let lon = slot(slots.lon)?;
    if !valid_coordinate(lat, lon) {
        return None;
    }

    if let Some(min_fix) = params.min_gps_fix {
        let fix = slots
            .fix
            .and_then(slot)
            .map(|v| v as u32)
            .or(record.fix);
        if fix.is_some_and(|f| f < min_fix) {
            return None;
        }
    }
    if let Some(max_dop) = params.max_dop {
        let dop = slots.dop.and_then(slot).or(record.precision);
        if dop.is_some_and(|d| d > max_dop) {
            return None;
        }
    }

    let iso_time = sample.absolute_time.clone().or_else(|| {
        let days = slot(slots.gps_days?).filter(|d| *d >= 0.0)?;
        let seconds = slot(slots.gps_seconds?).filter(|s| *s >= 0.0)?;
        gps_epoch_time(days, seconds).map(iso_millis)
    });

    Some(NormalizedSample {
        lat,
        lon,
        alt: slots.alt.and_then(slot).map(|a| a / profile.altitude_divisor),
        speed_kmh: slots.speed.and_then(slot).map(|v| profile.speed_unit.to_kmh(v)),
        time_ms: sample.relative_time_ms.map(|t| t.round() as i64),
        iso_time,
    })
}

/// Days since 2000-01-01 plus seconds of day. `None` when the instant is
/// outside what `DateTime` can hold.
fn gps_epoch_time(days: f64, seconds: f64) -> Option<DateTime<Utc>> {
    let epoch = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).single()?;
    let offset = Duration::try_days(days as i64)?
        .checked_add(&Duration::microseconds((seconds * 1_000_000.0).round() as i64))?;
    epoch.checked_add_signed(offset)
}

/// Normalize track-file points. Times become milliseconds since the earliest
/// timestamp in the file; speed is left for the backfill stage.
pub fn normalize_track(points: &[TrackPoint], params: &Params) -> Vec<NormalizedSample> {
    let base = points.iter().filter_map(|p| p.time).min();
    let mut out: Vec<NormalizedSample> = points
        .iter()
        .filter(|p| valid_coordinate(p.lat, p.lon))
        .map(|p| NormalizedSample {
            lat: p.lat,
            lon: p.lon,
            alt: match (p.elevation, params.elevation_policy) {
                (Some(ele), _) => Some(ele),
                (None, ElevationPolicy::Zero) => Some(0.0),
                (None, ElevationPolicy::Absent) => None,
            },
            speed_kmh: None,
            time_ms: p
                .time
                .zip(base)
                .map(|(t, b)| (t - b).num_milliseconds()),
            iso_time: p.time.map(iso_millis),
        })
        .collect();
    if out.len() < points.len() {
        debug!("dropped {} track points with invalid coordinates", points.len() - out.len());
    }
    sort_by_time(&mut out);
    out
}

fn sort_by_time(samples: &mut [NormalizedSample]) {
    samples.sort_by_key(|s| s.time_ms.unwrap_or(0));
}
