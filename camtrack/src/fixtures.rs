//! Synthetic GPMF payloads and MP4 containers for tests.

pub(crate) fn klv(key: &str, type_char: u8, struct_size: u8, repeat: u16, data: &[u8]) -> Vec<u8> {
    assert_eq!(key.len(), 4);
    let mut out = Vec::with_capacity(8 + data.len() + 3);
    out.extend_from_slice(key.as_bytes());
    out.push(type_char);
    out.push(struct_size);
    out.extend_from_slice(&repeat.to_be_bytes());
    out.extend_from_slice(data);
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out
}

pub(crate) fn nested(key: &str, children: &[Vec<u8>]) -> Vec<u8> {
    let body: Vec<u8> = children.concat();
    assert_eq!(body.len() % 4, 0);
    klv(key, 0, 4, (body.len() / 4) as u16, &body)
}

pub(crate) fn string(key: &str, value: &str) -> Vec<u8> {
    klv(key, b'c', 1, value.len() as u16, value.as_bytes())
}

pub(crate) fn scal(divisors: &[i32]) -> Vec<u8> {
    let data: Vec<u8> = divisors.iter().flat_map(|d| d.to_be_bytes()).collect();
    klv("SCAL", b'l', 4, divisors.len() as u16, &data)
}

const GPS5_SCALE: [i32; 5] = [10_000_000, 10_000_000, 1000, 1000, 100];

pub(crate) fn gps5_data(rows: &[[f64; 5]]) -> Vec<u8> {
    let mut data = Vec::with_capacity(rows.len() * 20);
    for row in rows {
        for (value, scale) in row.iter().zip(GPS5_SCALE.iter()) {
            data.extend_from_slice(&((value * *scale as f64).round() as i32).to_be_bytes());
        }
    }
    klv("GPS5", b'l', 20, rows.len() as u16, &data)
}

/// One device with a single GPS5 stream.
pub(crate) fn gps5_payload(rows: &[[f64; 5]], gpsu: Option<&str>) -> Vec<u8> {
    let mut stream = vec![
        string("STNM", "GPS (Lat., Long., Alt., 2D speed, 3D speed)"),
        klv("GPSF", b'L', 4, 1, &3u32.to_be_bytes()),
        klv("GPSP", b'S', 2, 1, &250u16.to_be_bytes()),
    ];
    if let Some(time) = gpsu {
        stream.push(klv("GPSU", b'U', 16, 1, time.as_bytes()));
    }
    stream.push(klv("UNIT", b'c', 3, 5, b"degdeg\0m\0\0m/sm/s"));
    stream.push(scal(&GPS5_SCALE));
    stream.push(gps5_data(rows));
    nested(
        "DEVC",
        &[
            klv("DVID", b'L', 4, 1, &1u32.to_be_bytes()),
            string("DVNM", "Camera"),
            nested("STRM", &stream),
        ],
    )
}

/// One device with a single GPS9 stream using the complex `?` type.
pub(crate) fn gps9_payload(rows: &[[f64; 9]]) -> Vec<u8> {
    let scale = [10_000_000, 10_000_000, 1000, 1000, 100, 1, 1000, 100, 1];
    let mut data = Vec::with_capacity(rows.len() * 32);
    for row in rows {
        for (value, s) in row.iter().zip(scale.iter()).take(7) {
            data.extend_from_slice(&((value * *s as f64).round() as i32).to_be_bytes());
        }
        data.extend_from_slice(&((row[7] * 100.0).round() as u16).to_be_bytes());
        data.extend_from_slice(&(row[8].round() as u16).to_be_bytes());
    }
    nested(
        "DEVC",
        &[
            klv("DVID", b'L', 4, 1, &1u32.to_be_bytes()),
            nested(
                "STRM",
                &[
                    string("TYPE", "lllllllSS"),
                    scal(&scale),
                    klv("GPS9", b'?', 32, rows.len() as u16, &data),
                ],
            ),
        ],
    )
}

/// One device with an accelerometer stream only.
pub(crate) fn accl_payload() -> Vec<u8> {
    nested(
        "DEVC",
        &[nested(
            "STRM",
            &[
                scal(&[100]),
                klv("ACCL", b's', 6, 2, &[0, 100, 0, 200, 0, 50, 0, 100, 0, 200, 0, 50]),
            ],
        )],
    )
}

pub(crate) fn mp4_box(typ: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&((body.len() + 8) as u32).to_be_bytes());
    out.extend_from_slice(typ.as_bytes());
    out.extend_from_slice(body);
    out
}

fn full_box(typ: &str, body: &[u8]) -> Vec<u8> {
    let mut with_flags = vec![0u8; 4];
    with_flags.extend_from_slice(body);
    mp4_box(typ, &with_flags)
}

fn u32s(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

/// `ftyp`, `mdat` holding `payloads` back to back, then a `moov` with one
/// GPMF metadata track (one sample per chunk, fixed sample duration).
pub(crate) fn mp4_with_gpmf(payloads: &[Vec<u8>], timescale: u32, sample_delta: u32) -> Vec<u8> {
    let ftyp = mp4_box("ftyp", b"mp41\0\0\0\0mp41");
    let mdat = mp4_box("mdat", &payloads.concat());
    let mut offsets = Vec::with_capacity(payloads.len());
    let mut offset = (ftyp.len() + 8) as u32;
    for payload in payloads {
        offsets.push(offset);
        offset += payload.len() as u32;
    }
    let count = payloads.len() as u32;

    let mdhd = full_box(
        "mdhd",
        &u32s(&[0, 0, timescale, count * sample_delta, 0]),
    );
    let mut hdlr_body = u32s(&[0]);
    hdlr_body.extend_from_slice(b"meta");
    hdlr_body.extend_from_slice(&[0; 12]);
    hdlr_body.extend_from_slice(b"\tGoPro MET\0");
    let hdlr = full_box("hdlr", &hdlr_body);

    let mut entry = Vec::new();
    entry.extend_from_slice(&[0; 6]);
    entry.extend_from_slice(&1u16.to_be_bytes());
    entry.extend_from_slice(&[0; 4]);
    let mut stsd_body = u32s(&[1]);
    stsd_body.extend(mp4_box("gpmd", &entry));
    let stsd = full_box("stsd", &stsd_body);
    let stts = full_box("stts", &u32s(&[1, count, sample_delta]));
    let mut stsz_body = u32s(&[0, count]);
    stsz_body.extend(u32s(&payloads.iter().map(|p| p.len() as u32).collect::<Vec<_>>()));
    let stsz = full_box("stsz", &stsz_body);
    let stsc = full_box("stsc", &u32s(&[1, 1, 1, 1]));
    let mut stco_body = u32s(&[count]);
    stco_body.extend(u32s(&offsets));
    let stco = full_box("stco", &stco_body);

    let stbl = mp4_box("stbl", &[stsd, stts, stsz, stsc, stco].concat());
    let minf = mp4_box("minf", &[mp4_box("gmhd", &[]), stbl].concat());
    let mdia = mp4_box("mdia", &[mdhd, hdlr, minf].concat());
    let trak = mp4_box("trak", &[full_box("tkhd", &[0; 80]), mdia].concat());
    let moov = mp4_box("moov", &[full_box("mvhd", &[0; 96]), trak].concat());

    [ftyp, mdat, moov].concat()
}

pub(crate) fn gpx(points: &[(f64, f64, Option<f64>, Option<&str>)]) -> String {
    let mut out = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <gpx version=\"1.1\" creator=\"camtrack-tests\" xmlns=\"http://www.topografix.com/GPX/1/1\">\n\
         <trk><name>ride</name><trkseg>\n",
    );
    for (lat, lon, ele, time) in points {
        out.push_str(&format!("<trkpt lat=\"{}\" lon=\"{}\">", lat, lon));
        if let Some(ele) = ele {
            out.push_str(&format!("<ele>{}</ele>", ele));
        }
        if let Some(time) = time {
            out.push_str(&format!("<time>{}</time>", time));
        }
        out.push_str("</trkpt>\n");
    }
    out.push_str("</trkseg></trk>\n</gpx>\n");
    out
}
