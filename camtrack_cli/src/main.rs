use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use camtrack::{
    decode_payload, extract, read_container, ElevationPolicy, Inputs, NormalizedResult, Params,
    ProfileTable, StreamKind, TelemetryError,
};
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use gpx::{Gpx, GpxVersion, Track, TrackSegment, Waypoint};
use rayon::prelude::*;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Action-camera telemetry extraction CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract normalized GPS samples from a video and/or a GPX track
    Extract(ExtractArgs),
    /// List telemetry payloads and streams found in video files
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
struct ExtractArgs {
    /// Video (MP4 with GPMF, or a bare GPMF dump)
    #[arg(long, value_hint = ValueHint::FilePath)]
    video: Option<PathBuf>,

    /// GPX track used when the video has no position telemetry
    #[arg(long, value_hint = ValueHint::FilePath)]
    track: Option<PathBuf>,

    /// Output JSON path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Also write the samples as a GPX track
    #[arg(long, value_hint = ValueHint::FilePath)]
    gpx: Option<PathBuf>,

    /// Stream profile table JSON replacing the built-in GoPro table
    #[arg(long, value_hint = ValueHint::FilePath)]
    profiles: Option<PathBuf>,

    /// Drop embedded samples whose GPS fix is below this (2 = 2D, 3 = 3D)
    #[arg(long)]
    min_fix: Option<u32>,

    /// Drop embedded samples whose dilution of precision exceeds this
    #[arg(long)]
    max_dop: Option<f64>,

    /// Record 0 m for track points without elevation
    #[arg(long, action = ArgAction::SetTrue)]
    zero_elevation: bool,

    /// Backfill speed in parallel chunks of this many samples
    #[arg(long)]
    backfill_chunk: Option<usize>,

    /// Verbose logging
    #[arg(short, long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Video files to inspect
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Extract(args) => args.verbose,
        Command::Inspect(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Extract(args) => handle_extract(args),
        Command::Inspect(args) => handle_inspect(args),
    }
}

fn handle_extract(args: ExtractArgs) -> Result<()> {
    let mut params = Params::default();
    params.min_gps_fix = args.min_fix;
    params.max_dop = args.max_dop;
    params.backfill_chunk = args.backfill_chunk;
    if args.zero_elevation {
        params.elevation_policy = ElevationPolicy::Zero;
    }
    if let Some(path) = args.profiles.as_ref() {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read profile table {}", path.display()))?;
        params.profiles = ProfileTable::from_json(&text)
            .with_context(|| format!("invalid profile table {}", path.display()))?;
        info!("Using profile table {}", params.profiles.version);
    }

    let video = args
        .video
        .as_ref()
        .map(|path| fs::read(path).with_context(|| format!("failed to read {}", path.display())))
        .transpose()?;
    let track = args
        .track
        .as_ref()
        .map(|path| {
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
        })
        .transpose()?;

    let inputs = Inputs {
        video: video.as_deref(),
        track: track.as_deref(),
    };
    let extraction = match extract(inputs, &params) {
        Ok(extraction) => extraction,
        Err(TelemetryError::NoTelemetryFound) => {
            return Err(anyhow!("no position telemetry found in the supplied inputs"));
        }
        Err(err) => return Err(err).context("telemetry extraction failed"),
    };
    for warning in &extraction.warnings {
        warn!("{}", warning);
    }
    let result = extraction.result;
    info!(
        "Extracted {} samples (source: {})",
        result.total_samples, result.source
    );

    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        serde_json::to_writer_pretty(&mut handle, &result)?;
        writeln!(handle)?;
    } else {
        let file = File::create(&args.output)
            .with_context(|| format!("failed to create {}", args.output.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &result)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Wrote samples JSON: {}", args.output.display());
    }

    if let Some(path) = args.gpx.as_ref() {
        write_gpx(&result, path)?;
        info!("Wrote GPX track: {}", path.display());
    }
    Ok(())
}

fn write_gpx(result: &NormalizedResult, path: &Path) -> Result<()> {
    let mut segment = TrackSegment::new();
    for sample in &result.samples {
        let mut waypoint = Waypoint::new(geo_types::Point::new(sample.lon, sample.lat));
        waypoint.elevation = sample.alt;
        waypoint.speed = sample.speed_kmh.map(|kmh| kmh / 3.6);
        if let Some(iso) = sample.iso_time.as_deref() {
            match OffsetDateTime::parse(iso, &Rfc3339) {
                Ok(time) => waypoint.time = Some(gpx::Time::from(time)),
                Err(err) => warn!("Dropping unparseable time {}: {}", iso, err),
            }
        }
        segment.points.push(waypoint);
    }
    let mut track = Track::new();
    track.segments.push(segment);

    let mut doc = Gpx::default();
    doc.version = GpxVersion::Gpx11;
    doc.creator = Some("camtrack".to_string());
    doc.tracks.push(track);

    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    gpx::write(&doc, BufWriter::new(file))
        .map_err(|err| anyhow!("failed to write {}: {}", path.display(), err))?;
    Ok(())
}

#[derive(Debug, Default)]
struct StreamSummary {
    kind: Option<StreamKind>,
    label: Option<String>,
    units: Vec<String>,
    payloads: usize,
    samples: usize,
}

#[derive(Debug)]
struct InspectReport {
    format: String,
    payloads: usize,
    corrupt_payloads: usize,
    streams: BTreeMap<(Option<u32>, String), StreamSummary>,
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let params = Params::default();
    let reports: Vec<(PathBuf, Result<InspectReport>)> = args
        .inputs
        .par_iter()
        .map(|path| (path.clone(), inspect_file(path, &params)))
        .collect();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut failures = 0;
    for (path, report) in reports {
        match report {
            Ok(report) => print_report(&mut out, &path, &report)?,
            Err(err) => {
                failures += 1;
                warn!("{}: {:#}", path.display(), err);
            }
        }
    }
    if failures > 0 {
        return Err(anyhow!("{} of {} inputs could not be inspected", failures, args.inputs.len()));
    }
    Ok(())
}

fn inspect_file(path: &Path, params: &Params) -> Result<InspectReport> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let container = read_container(&bytes, params.default_payload_ms)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let mut report = InspectReport {
        format: format!("{:?}", container.format),
        payloads: container.payloads.len(),
        corrupt_payloads: 0,
        streams: BTreeMap::new(),
    };
    for payload in &container.payloads {
        let decoded = decode_payload(
            payload.bytes(&bytes),
            payload.timing(),
            &params.profiles,
            params.max_depth,
        );
        if let Some(err) = decoded.corruption {
            report.corrupt_payloads += 1;
            warn!(
                "{}: {}",
                path.display(),
                err.rebased(payload.range.start)
            );
        }
        for record in decoded.records {
            let entry = report
                .streams
                .entry((record.device_id, record.stream_name))
                .or_default();
            entry.kind = Some(record.stream_type);
            entry.payloads += 1;
            entry.samples += record.samples.len();
            if entry.label.is_none() {
                entry.label = record.label;
            }
            if entry.units.is_empty() {
                entry.units = record.units;
            }
        }
    }
    Ok(report)
}

fn print_report<W: Write>(out: &mut W, path: &Path, report: &InspectReport) -> Result<()> {
    writeln!(
        out,
        "{}: {} container, {} telemetry payloads ({} corrupt)",
        path.display(),
        report.format,
        report.payloads,
        report.corrupt_payloads
    )?;
    for ((device, name), summary) in &report.streams {
        let device = device.map_or_else(|| "-".to_string(), |id| id.to_string());
        let kind = match summary.kind {
            Some(StreamKind::PositionFix) => "position-fix",
            Some(StreamKind::Motion) => "motion",
            _ => "other",
        };
        write!(
            out,
            "  device {:>4}  {:<4}  {:<12}  {:>7} samples in {:>5} payloads",
            device, name, kind, summary.samples, summary.payloads
        )?;
        if !summary.units.is_empty() {
            write!(out, "  [{}]", summary.units.join(", "))?;
        }
        if let Some(label) = summary.label.as_deref() {
            write!(out, "  {}", label)?;
        }
        writeln!(out)?;
    }
    Ok(())
}
