//! Great-circle distance and speed backfill.

use rayon::prelude::*;

use crate::NormalizedSample;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance in meters between two points given in degrees.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let to_rad = |deg: f64| deg.to_radians();
    let dlat = to_rad(lat2 - lat1);
    let dlon = to_rad(lon2 - lon1);
    let a = (dlat / 2.0).sin().powi(2)
        + to_rad(lat1).cos() * to_rad(lat2).cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

#[derive(Clone, Copy, Debug)]
struct Fix {
    lat: f64,
    lon: f64,
    time_ms: Option<i64>,
}

impl Fix {
    fn of(sample: &NormalizedSample) -> Self {
        Self {
            lat: sample.lat,
            lon: sample.lon,
            time_ms: sample.time_ms,
        }
    }
}

/// Fill missing `speed_kmh` from the immediately preceding sample.
///
/// Expects samples already sorted by time. Speeds the source provided are
/// kept; a sample whose elapsed time to its predecessor is not positive (or
/// unknown) keeps no speed.
pub fn backfill_speed(samples: &mut [NormalizedSample]) {
    backfill_from(None, samples);
}

/// Same result as [`backfill_speed`], computed over `chunk_len`-sized chunks
/// in parallel. Each chunk is seeded with the last fix of the chunk before it.
pub fn backfill_speed_chunked(samples: &mut [NormalizedSample], chunk_len: usize) {
    if chunk_len == 0 || samples.len() <= chunk_len {
        backfill_speed(samples);
        return;
    }
    let seeds: Vec<Option<Fix>> = (0..samples.len().div_ceil(chunk_len))
        .map(|chunk| (chunk > 0).then(|| Fix::of(&samples[chunk * chunk_len - 1])))
        .collect();
    samples
        .par_chunks_mut(chunk_len)
        .zip(seeds.into_par_iter())
        .for_each(|(chunk, seed)| backfill_from(seed, chunk));
}

fn backfill_from(seed: Option<Fix>, samples: &mut [NormalizedSample]) {
    let mut prev = seed;
    for sample in samples.iter_mut() {
        if sample.speed_kmh.is_none() {
            sample.speed_kmh = prev.and_then(|p| segment_speed_kmh(&p, sample));
        }
        prev = Some(Fix::of(sample));
    }
}

fn segment_speed_kmh(prev: &Fix, next: &NormalizedSample) -> Option<f64> {
    let dt_s = (next.time_ms? - prev.time_ms?) as f64 / 1000.0;
    if dt_s <= 0.0 {
        return None;
    }
    let meters = haversine_distance(prev.lat, prev.lon, next.lat, next.lon);
    let kmh = meters / dt_s * 3.6;
    kmh.is_finite().then_some(kmh)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(lat: f64, lon: f64, time_ms: Option<i64>) -> NormalizedSample {
        let mut s = NormalizedSample::new(lat, lon);
        s.time_ms = time_ms;
        s
    }

    #[test]
    fn test_haversine_distance() {
        let dist = haversine_distance(0.0, 0.0, 0.0, 1.0);
        assert!((dist - 111_195.0).abs() < 200.0);
        assert_eq!(haversine_distance(12.5, 45.0, 12.5, 45.0), 0.0);
    }

    #[test]
    fn test_backfill_matches_haversine_over_time() {
        let mut samples = vec![
            at(51.0, -3.0, Some(0)),
            at(51.0001, -3.0, Some(1000)),
            at(51.0001, -3.0002, Some(2000)),
        ];
        let d1 = haversine_distance(51.0, -3.0, 51.0001, -3.0);
        let d2 = haversine_distance(51.0001, -3.0, 51.0001, -3.0002);
        backfill_speed(&mut samples);
        assert_eq!(samples[0].speed_kmh, None);
        assert!((samples[1].speed_kmh.unwrap() - 3.6 * d1).abs() < 1e-3);
        assert!((samples[2].speed_kmh.unwrap() - 3.6 * d2).abs() < 1e-3);
    }

    #[test]
    fn test_zero_or_negative_dt_leaves_speed_absent() {
        let mut samples = vec![
            at(10.0, 10.0, Some(1000)),
            at(10.001, 10.0, Some(1000)),
            at(10.002, 10.0, Some(500)),
            at(10.003, 10.0, None),
        ];
        backfill_speed(&mut samples);
        assert!(samples.iter().all(|s| s.speed_kmh.is_none()));
    }

    #[test]
    fn test_existing_speed_is_kept() {
        let mut samples = vec![at(0.0, 0.0, Some(0)), at(0.0, 0.001, Some(1000))];
        samples[0].speed_kmh = Some(7.0);
        samples[1].speed_kmh = Some(42.0);
        backfill_speed(&mut samples);
        assert_eq!(samples[0].speed_kmh, Some(7.0));
        assert_eq!(samples[1].speed_kmh, Some(42.0));
    }

    #[test]
    fn test_chunked_matches_sequential() {
        let make = || -> Vec<NormalizedSample> {
            (0..103)
                .map(|i| {
                    let t = if i == 50 { Some(49 * 100) } else { Some(i * 100) };
                    at(45.0 + i as f64 * 1e-5, 7.0 + (i % 7) as f64 * 1e-5, t)
                })
                .collect()
        };
        let mut sequential = make();
        backfill_speed(&mut sequential);
        for chunk in [1, 7, 10, 50, 200] {
            let mut chunked = make();
            backfill_speed_chunked(&mut chunked, chunk);
            assert_eq!(chunked, sequential, "chunk length {}", chunk);
        }
    }
}
