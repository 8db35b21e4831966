//! Source selection and result assembly.

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::container::read_container;
use crate::gpmf::decode_payload;
use crate::kinematics::{backfill_speed, backfill_speed_chunked};
use crate::normalize::{normalize_streams, normalize_track};
use crate::track::parse_track;
use crate::{NormalizedResult, NormalizedSample, Params, Provenance, TelemetryError};

/// Caller-supplied sources. Either may be absent, not both.
#[derive(Clone, Copy, Debug, Default)]
pub struct Inputs<'a> {
    pub video: Option<&'a [u8]>,
    pub track: Option<&'a str>,
}

/// A successful result plus the non-fatal problems met on the way.
#[derive(Clone, Debug)]
pub struct Extraction {
    pub result: NormalizedResult,
    pub warnings: Vec<TelemetryError>,
}

/// Run the embedded path, falling back to the track file when it yields no
/// samples.
///
/// A corrupt embedded stream that still produced samples is reported as a
/// warning on the result. When the embedded path fails outright and the track
/// file succeeds, that failure is downgraded to a warning as well.
pub fn extract(inputs: Inputs<'_>, params: &Params) -> Result<Extraction, TelemetryError> {
    params.validate()?;
    if inputs.video.is_none() && inputs.track.is_none() {
        return Err(TelemetryError::InputMissing);
    }

    let mut warnings = Vec::new();
    let mut failure = None;

    if let Some(video) = inputs.video {
        match embedded_samples(video, params) {
            Ok((samples, corruption)) if !samples.is_empty() => {
                warnings.extend(corruption);
                let source = if samples.iter().any(|s| s.iso_time.is_some()) {
                    Provenance::EmbeddedWithTime
                } else {
                    Provenance::Embedded
                };
                return Ok(finish(samples, source, warnings, params));
            }
            Ok((_, corruption)) => {
                // corruption with nothing salvaged is a hard failure
                failure = corruption.into_iter().next();
                debug!("embedded telemetry yielded no position samples");
            }
            Err(err) => {
                warn!("embedded telemetry unusable: {}", err);
                failure = Some(err);
            }
        }
    }

    if let Some(track) = inputs.track {
        let points = match parse_track(track) {
            Ok(points) => points,
            Err(err) => return Err(failure.unwrap_or(err)),
        };
        let samples = normalize_track(&points, params);
        if !samples.is_empty() {
            if let Some(err) = failure.take() {
                warn!("falling back to track file after: {}", err);
                warnings.push(err);
            }
            return Ok(finish(samples, Provenance::TrackFile, warnings, params));
        }
        debug!("track file yielded no usable points");
    }

    Err(failure.unwrap_or(TelemetryError::NoTelemetryFound))
}

/// Decode every payload of `video`, returning the merged samples and any
/// corruption met while walking the payloads.
fn embedded_samples(
    video: &[u8],
    params: &Params,
) -> Result<(Vec<NormalizedSample>, Vec<TelemetryError>), TelemetryError> {
    let container = read_container(video, params.default_payload_ms)?;
    debug!(
        "{:?} container with {} telemetry payloads",
        container.format,
        container.payloads.len()
    );

    let decoded: Vec<_> = container
        .payloads
        .par_iter()
        .map(|payload| {
            let mut decoded = decode_payload(
                payload.bytes(video),
                payload.timing(),
                &params.profiles,
                params.max_depth,
            );
            decoded.corruption = decoded.corruption.map(|e| e.rebased(payload.range.start));
            decoded
        })
        .collect();

    let mut records = Vec::new();
    let mut corruption = Vec::new();
    for payload in decoded {
        records.extend(payload.records);
        corruption.extend(payload.corruption);
    }
    Ok((normalize_streams(&records, params), corruption))
}

fn finish(
    mut samples: Vec<NormalizedSample>,
    source: Provenance,
    warnings: Vec<TelemetryError>,
    params: &Params,
) -> Extraction {
    match params.backfill_chunk {
        Some(chunk) => backfill_speed_chunked(&mut samples, chunk),
        None => backfill_speed(&mut samples),
    }
    info!("{} samples from {}", samples.len(), source);
    Extraction {
        result: NormalizedResult::new(samples, source),
        warnings,
    }
}
