//! GPMF (GoPro Metadata Format) decoder.
//!
//! A payload is a sequence of KLV records: a FourCC key, a one-byte type,
//! a one-byte struct size and a big-endian 16-bit repeat count, followed by
//! `struct_size * repeat` bytes padded to a 32-bit boundary. Type 0 marks a
//! nested record whose payload is itself a KLV sequence.
//!
//! The walk is iterative over an explicit stack and fills a flat arena of
//! nodes (each pointing at its parent), so corrupt nesting can never blow the
//! call stack. Device groups are the top-level nested nodes, whatever their
//! key; each nested child of a device is a stream.

use std::ops::Range;

use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::profile::ProfileTable;
use crate::{iso_millis, TelemetryError};

const HEADER_LEN: usize = 8;

pub const fn fourcc(s: &str) -> u32 {
    let s = s.as_bytes();
    (s[3] as u32) | ((s[2] as u32) << 8) | ((s[1] as u32) << 16) | ((s[0] as u32) << 24)
}

pub fn fourcc_to_string(key: u32) -> String {
    match String::from_utf8(key.to_be_bytes().to_vec()) {
        Ok(s) => s,
        Err(_) => format!("{:08X}", key),
    }
}

const DVID: u32 = fourcc("DVID");
const DVNM: u32 = fourcc("DVNM");
const STNM: u32 = fourcc("STNM");
const SCAL: u32 = fourcc("SCAL");
const SIUN: u32 = fourcc("SIUN");
const UNIT: u32 = fourcc("UNIT");
const TYPE: u32 = fourcc("TYPE");
const GPSF: u32 = fourcc("GPSF");
const GPSP: u32 = fourcc("GPSP");
const GPSU: u32 = fourcc("GPSU");

/// Stream-level metadata tags that never carry the sample data themselves.
const COMPANION_KEYS: [&str; 14] = [
    "STMP", "TSMP", "STNM", "SIUN", "UNIT", "SCAL", "TYPE", "GPSF", "GPSP", "GPSU", "GPSA",
    "EMPT", "ORIN", "ORIO",
];

const MOTION_STREAMS: [&str; 6] = ["ACCL", "GYRO", "GRAV", "MAGN", "CORI", "IORI"];

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StreamKind {
    PositionFix,
    Motion,
    Other,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RawSample {
    /// Element values after the stream's `SCAL` divisors.
    pub values: Vec<f64>,
    pub relative_time_ms: Option<f64>,
    pub absolute_time: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StreamRecord {
    pub stream_name: String,
    pub stream_type: StreamKind,
    pub device_id: Option<u32>,
    pub device_name: Option<String>,
    pub label: Option<String>,
    pub units: Vec<String>,
    pub fix: Option<u32>,
    pub precision: Option<f64>,
    pub samples: Vec<RawSample>,
}

/// Where a payload sits on the media timeline.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PayloadTiming {
    pub start_ms: f64,
    pub duration_ms: f64,
}

#[derive(Clone, Debug, Default)]
pub struct DecodedPayload {
    pub records: Vec<StreamRecord>,
    /// Structural corruption that ended the walk early. Records decoded
    /// before that point are still present.
    pub corruption: Option<TelemetryError>,
}

#[derive(Clone, Debug)]
struct KlvNode {
    key: u32,
    type_char: u8,
    struct_size: usize,
    repeat: usize,
    data: Range<usize>,
    parent: Option<usize>,
}

impl KlvNode {
    fn is_nested(&self) -> bool {
        self.type_char == 0
    }
}

struct Frame {
    pos: usize,
    end: usize,
    parent: Option<usize>,
    depth: usize,
}

/// Decode one telemetry payload into stream records.
pub fn decode_payload(
    bytes: &[u8],
    timing: PayloadTiming,
    profiles: &ProfileTable,
    max_depth: usize,
) -> DecodedPayload {
    if bytes.is_empty() {
        return DecodedPayload::default();
    }
    let (nodes, corruption) = walk(bytes, max_depth);
    if let Some(err) = corruption.as_ref() {
        warn!("GPMF walk stopped early: {}", err);
    }

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (idx, node) in nodes.iter().enumerate() {
        if let Some(parent) = node.parent {
            children[parent].push(idx);
        }
    }

    let mut records = Vec::new();
    for (device_idx, device) in nodes.iter().enumerate() {
        if device.parent.is_some() || !device.is_nested() {
            continue;
        }
        let mut device_id = None;
        let mut device_name = None;
        let mut streams = Vec::new();
        for &child in &children[device_idx] {
            let node = &nodes[child];
            match node.key {
                DVID => device_id = read_numbers(bytes, node).first().map(|v| *v as u32),
                DVNM => device_name = Some(read_string(bytes, node)),
                _ if node.is_nested() => {
                    if let Some(record) = build_stream(bytes, &nodes, &children[child], timing, profiles)
                    {
                        streams.push(record);
                    }
                }
                _ => {}
            }
        }
        for mut record in streams {
            record.device_id = device_id;
            record.device_name = device_name.clone();
            records.push(record);
        }
    }

    DecodedPayload {
        records,
        corruption,
    }
}

fn walk(bytes: &[u8], max_depth: usize) -> (Vec<KlvNode>, Option<TelemetryError>) {
    let mut nodes: Vec<KlvNode> = Vec::new();
    let mut stack = vec![Frame {
        pos: 0,
        end: bytes.len(),
        parent: None,
        depth: 0,
    }];

    while let Some(frame) = stack.last_mut() {
        // A partial header at the end of a level is trailing truncation.
        if frame.end - frame.pos < HEADER_LEN {
            stack.pop();
            continue;
        }
        let header = &bytes[frame.pos..frame.pos + HEADER_LEN];
        let key = BigEndian::read_u32(&header[0..4]);
        if key == 0 {
            // zero padding
            stack.pop();
            continue;
        }
        let type_char = header[4];
        let struct_size = header[5] as usize;
        let repeat = BigEndian::read_u16(&header[6..8]) as usize;
        let data_start = frame.pos + HEADER_LEN;
        let data_len = struct_size * repeat;
        if data_len > frame.end - data_start {
            let err = TelemetryError::decode(
                frame.pos,
                format!(
                    "{} declares {} bytes but only {} remain",
                    fourcc_to_string(key),
                    data_len,
                    frame.end - data_start
                ),
            );
            return (nodes, Some(err));
        }

        let parent = frame.parent;
        let depth = frame.depth;
        let padded = (data_len + 3) & !3;
        frame.pos = (data_start + padded).min(frame.end);

        let index = nodes.len();
        nodes.push(KlvNode {
            key,
            type_char,
            struct_size,
            repeat,
            data: data_start..data_start + data_len,
            parent,
        });

        if type_char == 0 {
            if depth + 1 >= max_depth {
                let err = TelemetryError::decode(
                    data_start - HEADER_LEN,
                    format!("nesting deeper than {} levels", max_depth),
                );
                return (nodes, Some(err));
            }
            stack.push(Frame {
                pos: data_start,
                end: data_start + data_len,
                parent: Some(index),
                depth: depth + 1,
            });
        }
    }

    (nodes, None)
}

fn build_stream(
    bytes: &[u8],
    nodes: &[KlvNode],
    members: &[usize],
    timing: PayloadTiming,
    profiles: &ProfileTable,
) -> Option<StreamRecord> {
    let mut scale: Vec<f64> = Vec::new();
    let mut label = None;
    let mut units = Vec::new();
    let mut layout: Option<Vec<u8>> = None;
    let mut fix = None;
    let mut precision = None;
    let mut gps_time = None;
    let mut data: Option<&KlvNode> = None;
    let mut position: Option<&KlvNode> = None;

    for &idx in members {
        let node = &nodes[idx];
        match node.key {
            SCAL => scale = read_numbers(bytes, node),
            STNM => label = Some(read_string(bytes, node)),
            SIUN | UNIT => units = read_strings(bytes, node),
            TYPE => layout = Some(read_string(bytes, node).into_bytes()),
            GPSF => fix = read_numbers(bytes, node).first().map(|v| *v as u32),
            GPSP => precision = read_numbers(bytes, node).first().map(|v| *v / 100.0),
            GPSU => gps_time = parse_gps_time(&read_string(bytes, node)),
            _ if node.is_nested() => {}
            key if COMPANION_KEYS.contains(&fourcc_to_string(key).as_str()) => {}
            key => {
                if position.is_none() && profiles.is_position_fix(&fourcc_to_string(key)) {
                    position = Some(node);
                }
                data = Some(node);
            }
        }
    }

    // a position leaf wins over whatever unknown leaves follow it
    let data = position.or(data)?;
    let stream_name = fourcc_to_string(data.key);
    let element_types = match element_layout(data, layout.as_deref()) {
        Some(types) => types,
        None => {
            debug!(
                "skipping stream {} with unsupported type {:?}",
                stream_name, data.type_char as char
            );
            return None;
        }
    };

    let stream_type = if profiles.is_position_fix(&stream_name) {
        StreamKind::PositionFix
    } else if MOTION_STREAMS.contains(&stream_name.as_str()) {
        StreamKind::Motion
    } else {
        StreamKind::Other
    };

    let count = data.repeat;
    let step_ms = if count > 0 {
        timing.duration_ms / count as f64
    } else {
        0.0
    };
    let mut samples = Vec::with_capacity(count);
    for i in 0..count {
        let start = data.data.start + i * data.struct_size;
        let raw = &bytes[start..start + data.struct_size];
        let mut values = Vec::with_capacity(element_types.len());
        let mut offset = 0;
        for (slot, &type_char) in element_types.iter().enumerate() {
            let width = type_width(type_char).unwrap_or(0);
            if let Some(value) = read_scalar(&raw[offset..offset + width], type_char) {
                values.push(value / divisor(&scale, slot));
            } else {
                values.push(f64::NAN);
            }
            offset += width;
        }
        let offset_ms = i as f64 * step_ms;
        samples.push(RawSample {
            values,
            relative_time_ms: Some(timing.start_ms + offset_ms),
            absolute_time: gps_time
                .and_then(|t: DateTime<Utc>| {
                    t.checked_add_signed(Duration::microseconds((offset_ms * 1000.0).round() as i64))
                })
                .map(iso_millis),
        });
    }

    Some(StreamRecord {
        stream_name,
        stream_type,
        device_id: None,
        device_name: None,
        label,
        units,
        fix,
        precision,
        samples,
    })
}

/// Per-element type characters for one sample of `data`, or `None` when the
/// layout is not numeric or does not tile the struct size.
fn element_layout(data: &KlvNode, layout: Option<&[u8]>) -> Option<Vec<u8>> {
    let types = match data.type_char {
        b'?' => layout?.to_vec(),
        b'c' | b'U' | 0 => return None,
        t => {
            let width = type_width(t)?;
            if data.struct_size % width != 0 {
                return None;
            }
            vec![t; data.struct_size / width]
        }
    };
    let mut total = 0;
    for &t in &types {
        if matches!(t, b'c' | b'U') {
            return None;
        }
        total += type_width(t)?;
    }
    (total == data.struct_size).then_some(types)
}

fn divisor(scale: &[f64], slot: usize) -> f64 {
    let d = match scale.len() {
        0 => 1.0,
        1 => scale[0],
        _ => scale.get(slot).copied().unwrap_or(1.0),
    };
    if d == 0.0 || !d.is_finite() {
        1.0
    } else {
        d
    }
}

fn type_width(type_char: u8) -> Option<usize> {
    match type_char {
        b'b' | b'B' | b'c' => Some(1),
        b's' | b'S' => Some(2),
        b'l' | b'L' | b'f' | b'F' | b'q' => Some(4),
        b'd' | b'j' | b'J' | b'Q' => Some(8),
        b'U' => Some(16),
        _ => None,
    }
}

fn read_scalar(buf: &[u8], type_char: u8) -> Option<f64> {
    let value = match type_char {
        b'b' => buf[0] as i8 as f64,
        b'B' => buf[0] as f64,
        b's' => BigEndian::read_i16(buf) as f64,
        b'S' => BigEndian::read_u16(buf) as f64,
        b'l' => BigEndian::read_i32(buf) as f64,
        b'L' | b'F' => BigEndian::read_u32(buf) as f64,
        b'f' => BigEndian::read_f32(buf) as f64,
        b'q' => BigEndian::read_i32(buf) as f64 / 65_536.0,
        b'd' => BigEndian::read_f64(buf),
        b'j' => BigEndian::read_i64(buf) as f64,
        b'J' => BigEndian::read_u64(buf) as f64,
        b'Q' => BigEndian::read_i64(buf) as f64 / 4_294_967_296.0,
        _ => return None,
    };
    Some(value)
}

fn read_numbers(bytes: &[u8], node: &KlvNode) -> Vec<f64> {
    let width = match type_width(node.type_char) {
        Some(w) if !matches!(node.type_char, b'c' | b'U') => w,
        _ => return Vec::new(),
    };
    bytes[node.data.clone()]
        .chunks_exact(width)
        .filter_map(|chunk| read_scalar(chunk, node.type_char))
        .collect()
}

fn read_string(bytes: &[u8], node: &KlvNode) -> String {
    String::from_utf8_lossy(&bytes[node.data.clone()])
        .trim_end_matches(['\0', ' '])
        .to_string()
}

fn read_strings(bytes: &[u8], node: &KlvNode) -> Vec<String> {
    if node.struct_size == 0 {
        return Vec::new();
    }
    bytes[node.data.clone()]
        .chunks(node.struct_size)
        .map(|chunk| {
            String::from_utf8_lossy(chunk)
                .trim_end_matches(['\0', ' '])
                .to_string()
        })
        .collect()
}

/// `GPSU` carries UTC as `yymmddhhmmss.sss`.
fn parse_gps_time(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), "%y%m%d%H%M%S%.f").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}
