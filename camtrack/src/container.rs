//! Locates telemetry payloads inside the input buffer.
//!
//! MP4 files are walked box by box (`moov/trak/mdia/minf/stbl`) to find the
//! GPMF metadata track; its sample table gives the byte range and media time
//! of every payload. A buffer that already starts with a `DEVC` record is an
//! extracted GPMF stream and becomes a single payload. Nothing here looks at
//! payload contents.

use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::ops::Range;

use byteorder::{BigEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::gpmf::{fourcc, fourcc_to_string, PayloadTiming};
use crate::{SourceKind, TelemetryError};

const GPMF_SAMPLE_FORMAT: u32 = fourcc("gpmd");
const META_HANDLER: u32 = fourcc("meta");
const GOPRO_HANDLER_NAME: &str = "GoPro MET";
const MAX_BOX_DEPTH: usize = 8;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerFormat {
    Mp4,
    RawGpmf,
}

/// A telemetry payload: a byte range of the input plus its media timing.
#[derive(Clone, Debug, PartialEq)]
pub struct Payload {
    pub range: Range<usize>,
    pub start_ms: f64,
    pub duration_ms: f64,
}

impl Payload {
    pub fn bytes<'a>(&self, buffer: &'a [u8]) -> &'a [u8] {
        &buffer[self.range.clone()]
    }

    pub fn timing(&self) -> PayloadTiming {
        PayloadTiming {
            start_ms: self.start_ms,
            duration_ms: self.duration_ms,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RawContainer {
    pub format: ContainerFormat,
    pub payloads: Vec<Payload>,
}

#[derive(Clone, Debug)]
struct BoxHeader {
    typ: u32,
    body: Range<usize>,
}

#[derive(Default, Debug)]
struct TrackTables {
    timescale: u32,
    handler: Option<u32>,
    handler_name: String,
    sample_format: Option<u32>,
    stts: Vec<(u32, u32)>,
    stsz_size: u32,
    stsz: Vec<u32>,
    stsz_count: u32,
    stsc: Vec<(u32, u32)>,
    chunk_offsets: Vec<u64>,
}

impl TrackTables {
    fn is_telemetry(&self) -> bool {
        self.sample_format == Some(GPMF_SAMPLE_FORMAT)
            || (self.handler == Some(META_HANDLER) && self.handler_name.contains(GOPRO_HANDLER_NAME))
    }
}

/// Find the telemetry payloads in `buffer`.
///
/// An MP4 without a telemetry track yields an empty payload list; only an
/// unparseable outer framing is an error.
pub fn read_container(buffer: &[u8], default_payload_ms: f64) -> Result<RawContainer, TelemetryError> {
    if buffer.len() < 8 {
        return Err(TelemetryError::format(
            SourceKind::Video,
            format!("{} bytes is too short for a container", buffer.len()),
        ));
    }
    if &buffer[0..4] == b"DEVC" {
        debug!("input is a bare GPMF stream");
        return Ok(RawContainer {
            format: ContainerFormat::RawGpmf,
            payloads: vec![Payload {
                range: 0..buffer.len(),
                start_ms: 0.0,
                duration_ms: default_payload_ms,
            }],
        });
    }

    check_outer_framing(buffer)?;

    let mut payloads = Vec::new();
    let Some(moov) = boxes(buffer, 0..buffer.len())
        .into_iter()
        .find(|b| b.typ == fourcc("moov"))
    else {
        debug!("no moov box; container holds no sample tables");
        return Ok(RawContainer {
            format: ContainerFormat::Mp4,
            payloads,
        });
    };

    for (index, trak) in boxes(buffer, moov.body.clone())
        .into_iter()
        .filter(|b| b.typ == fourcc("trak"))
        .enumerate()
    {
        let mut tables = TrackTables::default();
        if let Err(err) = read_track(buffer, trak.body.clone(), &mut tables, 0) {
            warn!("skipping track {}: {}", index, err);
            continue;
        }
        if !tables.is_telemetry() {
            continue;
        }
        debug!(
            "telemetry track {}: {} samples, timescale {}",
            index, tables.stsz_count, tables.timescale
        );
        payloads.extend(track_payloads(buffer.len(), &tables, default_payload_ms));
    }

    Ok(RawContainer {
        format: ContainerFormat::Mp4,
        payloads,
    })
}

fn check_outer_framing(buffer: &[u8]) -> Result<(), TelemetryError> {
    let mut cursor = Cursor::new(buffer);
    let size = cursor
        .read_u32::<BigEndian>()
        .map_err(|e| TelemetryError::format(SourceKind::Video, e.to_string()))?;
    let typ = cursor
        .read_u32::<BigEndian>()
        .map_err(|e| TelemetryError::format(SourceKind::Video, e.to_string()))?;
    let printable = typ.to_be_bytes().iter().all(|c| (0x20..0x7f).contains(c));
    if !printable || (size != 0 && size != 1 && size < 8) {
        return Err(TelemetryError::format(
            SourceKind::Video,
            format!("leading box {:?} is not ISO-BMFF framing", fourcc_to_string(typ)),
        ));
    }
    Ok(())
}

/// Child boxes of `range`. A box running past `range` is clipped to it; a
/// header that cannot be read ends the list.
fn boxes(buffer: &[u8], range: Range<usize>) -> Vec<BoxHeader> {
    let mut out = Vec::new();
    let mut cursor = Cursor::new(buffer);
    let mut pos = range.start;
    while range.end.saturating_sub(pos) >= 8 {
        cursor.set_position(pos as u64);
        let Ok((typ, size, header_len)) = read_box(&mut cursor) else {
            break;
        };
        let size = match size {
            0 => (range.end - pos) as u64,
            s => s,
        };
        if size < header_len as u64 {
            warn!("box {} at {} has invalid size {}", fourcc_to_string(typ), pos, size);
            break;
        }
        let end = pos.saturating_add(usize::try_from(size).unwrap_or(usize::MAX));
        let clipped = end.min(range.end);
        if end > range.end {
            warn!(
                "box {} at {} runs {} bytes past its parent; clipping",
                fourcc_to_string(typ),
                pos,
                end - range.end
            );
        }
        out.push(BoxHeader {
            typ,
            body: (pos + header_len).min(clipped)..clipped,
        });
        pos = clipped;
    }
    out
}

fn read_box<R: Read + Seek>(reader: &mut R) -> io::Result<(u32, u64, usize)> {
    let size = reader.read_u32::<BigEndian>()?;
    let typ = reader.read_u32::<BigEndian>()?;
    if size == 1 {
        let largesize = reader.read_u64::<BigEndian>()?;
        Ok((typ, largesize, 16))
    } else {
        Ok((typ, size as u64, 8))
    }
}

fn read_track(
    buffer: &[u8],
    range: Range<usize>,
    tables: &mut TrackTables,
    depth: usize,
) -> io::Result<()> {
    if depth > MAX_BOX_DEPTH {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "boxes nested too deeply"));
    }
    for child in boxes(buffer, range) {
        let body = &buffer[child.body.clone()];
        let mut d = Cursor::new(body);
        match &child.typ.to_be_bytes() {
            b"mdia" | b"minf" | b"stbl" => read_track(buffer, child.body.clone(), tables, depth + 1)?,
            b"mdhd" => {
                let (v, _flags) = (d.read_u8()?, d.read_u24::<BigEndian>()?);
                if v == 1 {
                    d.seek(SeekFrom::Current(8 + 8))?;
                } else {
                    d.seek(SeekFrom::Current(4 + 4))?;
                }
                tables.timescale = d.read_u32::<BigEndian>()?;
            }
            b"hdlr" => {
                let (_v, _flags) = (d.read_u8()?, d.read_u24::<BigEndian>()?);
                d.seek(SeekFrom::Current(4))?; // pre_defined
                tables.handler = Some(d.read_u32::<BigEndian>()?);
                let name = body.get(24..).unwrap_or_default();
                tables.handler_name = String::from_utf8_lossy(name).into_owned();
            }
            b"stsd" => {
                let (_v, _flags) = (d.read_u8()?, d.read_u24::<BigEndian>()?);
                let count = d.read_u32::<BigEndian>()?;
                if count > 0 {
                    let _entry_size = d.read_u32::<BigEndian>()?;
                    tables.sample_format = Some(d.read_u32::<BigEndian>()?);
                }
            }
            b"stts" => {
                let count = table_len(&mut d, body.len(), 8)?;
                for _ in 0..count {
                    tables
                        .stts
                        .push((d.read_u32::<BigEndian>()?, d.read_u32::<BigEndian>()?));
                }
            }
            b"stsz" => {
                let (_v, _flags) = (d.read_u8()?, d.read_u24::<BigEndian>()?);
                tables.stsz_size = d.read_u32::<BigEndian>()?;
                let count = d.read_u32::<BigEndian>()?;
                tables.stsz_count = count;
                if tables.stsz_size == 0 {
                    let available = (body.len().saturating_sub(12) / 4) as u32;
                    if available < count {
                        warn!("stsz lists {} samples but holds {}", count, available);
                        tables.stsz_count = available;
                    }
                    for _ in 0..tables.stsz_count {
                        tables.stsz.push(d.read_u32::<BigEndian>()?);
                    }
                }
            }
            b"stsc" => {
                let count = table_len(&mut d, body.len(), 12)?;
                for _ in 0..count {
                    let first_chunk = d.read_u32::<BigEndian>()?;
                    let per_chunk = d.read_u32::<BigEndian>()?;
                    let _description = d.read_u32::<BigEndian>()?;
                    tables.stsc.push((first_chunk, per_chunk));
                }
            }
            b"stco" => {
                let count = table_len(&mut d, body.len(), 4)?;
                for _ in 0..count {
                    tables.chunk_offsets.push(d.read_u32::<BigEndian>()? as u64);
                }
            }
            b"co64" => {
                let count = table_len(&mut d, body.len(), 8)?;
                for _ in 0..count {
                    tables.chunk_offsets.push(d.read_u64::<BigEndian>()?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Reads a full-box header and entry count, capping the count at what the
/// box can actually hold.
fn table_len(d: &mut Cursor<&[u8]>, body_len: usize, entry_len: usize) -> io::Result<u32> {
    let (_v, _flags) = (d.read_u8()?, d.read_u24::<BigEndian>()?);
    let count = d.read_u32::<BigEndian>()?;
    let available = (body_len.saturating_sub(8) / entry_len) as u32;
    if count > available {
        warn!("sample table lists {} entries but holds {}", count, available);
    }
    Ok(count.min(available))
}

fn track_payloads(buffer_len: usize, tables: &TrackTables, default_payload_ms: f64) -> Vec<Payload> {
    let mut sample_count = tables.stsz_count as usize;
    if tables.stsz_size != 0 {
        // fixed-size samples cannot outnumber what the buffer holds
        sample_count = sample_count.min(buffer_len / tables.stsz_size as usize);
    }
    let size_of = |i: usize| -> u64 {
        if tables.stsz_size != 0 {
            tables.stsz_size as u64
        } else {
            tables.stsz.get(i).copied().unwrap_or(0) as u64
        }
    };

    // (offset, size) per sample, walking chunks through stsc runs
    let mut locations = Vec::with_capacity(sample_count);
    let chunk_count = tables.chunk_offsets.len();
    let runs: Vec<(u32, u32)> = if tables.stsc.is_empty() {
        vec![(1, 1)]
    } else {
        tables.stsc.clone()
    };
    'runs: for (i, &(first_chunk, per_chunk)) in runs.iter().enumerate() {
        let last_chunk = runs
            .get(i + 1)
            .map(|next| next.0.saturating_sub(1) as usize)
            .unwrap_or(chunk_count)
            .min(chunk_count);
        for chunk in (first_chunk.max(1) as usize)..=last_chunk {
            let mut offset = tables.chunk_offsets[chunk - 1];
            for _ in 0..per_chunk {
                if locations.len() >= sample_count {
                    break 'runs;
                }
                let size = size_of(locations.len());
                locations.push((offset, size));
                offset = offset.saturating_add(size);
            }
        }
    }

    let timescale = tables.timescale as f64;
    let mut deltas = tables
        .stts
        .iter()
        .flat_map(|&(count, delta)| std::iter::repeat(delta).take(count as usize));

    let mut payloads = Vec::with_capacity(locations.len());
    let mut clock = 0u64;
    for (index, (offset, size)) in locations.into_iter().enumerate() {
        let (start_ms, duration_ms) = match deltas.next() {
            Some(delta) if timescale > 0.0 => {
                let start = clock as f64 * 1000.0 / timescale;
                clock += delta as u64;
                (start, delta as f64 * 1000.0 / timescale)
            }
            _ => (index as f64 * default_payload_ms, default_payload_ms),
        };
        let start = offset as usize;
        if offset >= buffer_len as u64 || size == 0 {
            warn!("payload {} at {} lies outside the buffer; dropped", index, offset);
            continue;
        }
        let end = offset.saturating_add(size).min(buffer_len as u64) as usize;
        if end - start < size as usize {
            warn!("payload {} truncated to {} of {} bytes", index, end - start, size);
        }
        payloads.push(Payload {
            range: start..end,
            start_ms,
            duration_ms,
        });
    }
    payloads
}
