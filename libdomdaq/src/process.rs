use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

use super::config::Config;
use super::constants::GLOBAL_TRIGGER_SOURCE;
use super::error::ProcessorError;
use super::hit_stream::HitStreamReader;
use super::hits::{DecodedHit, DomHit};
use super::payload::{hit_stack, EventPayload, Payload, TriggerRequestPayload};
use super::payload_reader::read_payloads;
use super::source_id::SourceId;
use super::time_calibrator::TimeCalibrator;
use super::worker_status::{BarColor, WorkerStatus};

/// Seconds per DOR tick
const TICK_SECONDS: f64 = 1.0e-10;

/// Hit statistics of one DOM. Times are in seconds, rates in mHz.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomSummary {
    pub hits: u64,
    pub beacons: u64,
    pub first_time: f64,
    pub last_time: f64,
    pub hit_rate: f64,
    pub beacon_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSummary {
    pub path: PathBuf,
    pub bytes: u64,
    pub payloads: u64,
    pub events: u64,
    /// Payload count per type tag
    pub payload_types: BTreeMap<i32, u64>,
    /// Well-framed records whose contents could not be decoded
    pub record_errors: u64,
    /// Set when the file could not be read to the end
    pub error: Option<String>,
}

/// Everything `process` learned about a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_number: Option<i32>,
    pub files: Vec<FileSummary>,
    pub events: u64,
    /// Seconds between the first and last event
    pub run_length: f64,
    /// Hz
    pub event_rate: f64,
    pub triggers: BTreeMap<i32, u64>,
    /// Hz
    pub trigger_rates: BTreeMap<i32, f64>,
    pub total_hits: u64,
    pub doms: BTreeMap<String, DomSummary>,
    /// Hits that could not be decoded from their records
    pub hit_failures: u64,
    pub waveform_failures: u64,
    pub calibration_failures: u64,
}

/// Count trigger types. Global trigger requests only merge other triggers, so they are
/// descended into rather than counted.
fn count_triggers(request: &TriggerRequestPayload, histogram: &mut FxHashMap<i32, u64>) {
    if SourceId(request.srcid).component() == GLOBAL_TRIGGER_SOURCE {
        for nested in &request.hits {
            if let Payload::TriggerRequest(inner) = nested {
                count_triggers(inner, histogram);
            }
        }
    } else {
        *histogram.entry(request.trigger_type).or_default() += 1;
    }
}

fn count_event_triggers(event: &EventPayload, histogram: &mut FxHashMap<i32, u64>) {
    if event.is_v5() {
        for record in &event.trigger_records {
            if SourceId(record.srcid as i32).component() != GLOBAL_TRIGGER_SOURCE {
                *histogram.entry(record.trigger_type).or_default() += 1;
            }
        }
    } else if let Some(Payload::TriggerRequest(request)) = event.trigger_request.as_deref() {
        count_triggers(request, histogram);
    }
}

/// Fill the event, run-length and trigger fields of the summary
fn summarize_events(events: &[EventPayload], summary: &mut RunSummary) {
    summary.events = events.len() as u64;
    let (Some(first), Some(last)) = (events.first(), events.last()) else {
        return;
    };
    summary.run_number = Some(first.run_number);
    summary.run_length = TICK_SECONDS * (last.envelope.utime as f64 - first.envelope.utime as f64);

    let mut histogram: FxHashMap<i32, u64> = FxHashMap::default();
    for event in events {
        count_event_triggers(event, &mut histogram);
    }
    summary.triggers = histogram.into_iter().collect();
    if summary.run_length > 0.0 {
        summary.event_rate = summary.events as f64 / summary.run_length;
        summary.trigger_rates = summary
            .triggers
            .iter()
            .map(|(id, count)| (*id, *count as f64 / summary.run_length))
            .collect();
    }
}

/// Per-DOM hit counts, time span and rates. Calibrated hits use their DOR time,
/// others fall back to the DAQ time stamp.
pub fn summarize_doms(stack: &FxHashMap<String, Vec<DecodedHit>>) -> BTreeMap<String, DomSummary> {
    let time = |hit: &DecodedHit| TICK_SECONDS * hit.utclk().unwrap_or(hit.utc()) as f64;
    let mut doms = BTreeMap::new();
    for (dom_id, hits) in stack {
        let (Some(first), Some(last)) = (hits.first(), hits.last()) else {
            continue;
        };
        let mut dom = DomSummary {
            hits: hits.len() as u64,
            beacons: hits.iter().filter(|hit| hit.is_beacon()).count() as u64,
            first_time: time(first),
            last_time: time(last),
            ..Default::default()
        };
        let span = dom.last_time - dom.first_time;
        if span > 0.0 {
            dom.hit_rate = 1000.0 * dom.hits as f64 / span;
            dom.beacon_rate = 1000.0 * dom.beacons as f64 / span;
        }
        doms.insert(dom_id.clone(), dom);
    }
    doms
}

/// Decode every compressed waveform, returning the number of hits that failed
fn decode_all_waveforms(stack: &FxHashMap<String, Vec<DecodedHit>>) -> u64 {
    let mut failures = 0;
    for (dom_id, hits) in stack {
        for hit in hits {
            if let DecodedHit::DeltaCompressed(hit) = hit {
                if let Err(e) = hit.decode_waveforms() {
                    log::warn!("DOM {dom_id}: discarding waveforms of hit at {}: {e}", hit.utc);
                    failures += 1;
                }
            }
        }
    }
    failures
}

/// Translate every hit to DOR time, returning the number that could not be calibrated
fn calibrate_hits(
    calibrator: &mut TimeCalibrator,
    stack: &mut FxHashMap<String, Vec<DecodedHit>>,
    year: i32,
) -> u64 {
    let mut failures = 0;
    for (dom_id, hits) in stack.iter_mut() {
        let mut dom_failures = 0;
        for hit in hits.iter_mut() {
            if let Err(e) = calibrator.translate_dom_to_dor(hit, year) {
                if dom_failures == 0 {
                    log::warn!("Could not calibrate hits of DOM {dom_id}: {e}");
                }
                dom_failures += 1;
            }
        }
        failures += dom_failures;
    }
    failures
}

/// Read one payload file, keeping its events. A record that cannot be decoded is counted
/// and skipped; an error that loses the record framing ends the file, keeping what was
/// read before it.
fn read_payload_file(
    path: &Path,
    file_index: usize,
    limit: u64,
    tx: &Sender<WorkerStatus>,
) -> Result<(FileSummary, Vec<EventPayload>), ProcessorError> {
    let file = File::open(path)?;
    let total_size = file.metadata()?.len();
    log::info!(
        "Reading payloads from {} ({})",
        path.to_string_lossy(),
        human_bytes::human_bytes(total_size as f64)
    );

    let mut summary = FileSummary {
        path: path.to_path_buf(),
        bytes: total_size,
        ..Default::default()
    };
    let mut events = Vec::new();
    let flush_frac: f32 = 0.01;
    let flush_val = (total_size as f64 * flush_frac as f64) as u64;
    let mut last_flush = 0;

    tx.send(WorkerStatus::new(0.0, file_index, BarColor::CYAN))?;
    let mut payloads = read_payloads(BufReader::new(file));
    while summary.payloads + summary.record_errors < limit {
        let payload = match payloads.next() {
            Some(Ok(payload)) => payload,
            Some(Err(e)) if payloads.is_aligned() => {
                log::warn!("Skipping record in {}: {e}", path.to_string_lossy());
                summary.record_errors += 1;
                continue;
            }
            Some(Err(e)) => {
                log::error!("Stopped reading {}: {e}", path.to_string_lossy());
                summary.error = Some(e.to_string());
                break;
            }
            None => break,
        };
        summary.payloads += 1;
        *summary
            .payload_types
            .entry(payload.payload_type())
            .or_default() += 1;
        if let Payload::Event(event) = payload {
            summary.events += 1;
            events.push(event);
        }

        if payloads.offset() - last_flush > flush_val {
            last_flush = payloads.offset();
            tx.send(WorkerStatus::new(
                last_flush as f32 / total_size as f32,
                file_index,
                BarColor::CYAN,
            ))?;
        }
    }
    let color = if summary.error.is_some() {
        BarColor::RED
    } else {
        BarColor::CYAN
    };
    tx.send(WorkerStatus::new(1.0, file_index, color))?;
    log::info!(
        "Read {} payloads ({} events) from {}",
        summary.payloads,
        summary.events,
        path.to_string_lossy()
    );
    Ok((summary, events))
}

/// The main loop of domdaq.
///
/// Reads the configured payload files and hit stream, optionally decodes waveforms and
/// calibrates hit times, then summarizes the run. Progress is reported over `tx`.
pub fn process(config: Config, tx: Sender<WorkerStatus>) -> Result<RunSummary, ProcessorError> {
    config.validate()?;

    let mut calibrator = match &config.tcal_path {
        Some(tcal_path) => {
            let format = config.get_tcal_format()?;
            log::info!("Loading RAPCal records from {}...", tcal_path.to_string_lossy());
            tx.send(WorkerStatus::new(0.0, 0, BarColor::GREEN))?;
            let calibrator = TimeCalibrator::from_file(tcal_path, format)?;
            tx.send(WorkerStatus::new(1.0, 0, BarColor::GREEN))?;
            log::info!(
                "Loaded {} RAPCal records for {} DOMs.",
                calibrator.len(),
                calibrator.dom_ids().count()
            );
            Some(calibrator)
        }
        None => None,
    };

    let mut summary = RunSummary::default();
    let mut events = Vec::new();
    for (file_index, path) in config.payload_paths.iter().enumerate() {
        let (file_summary, mut file_events) =
            read_payload_file(path, file_index, config.record_limit(), &tx)?;
        events.append(&mut file_events);
        summary.files.push(file_summary);
    }

    let (mut stack, hit_failures) = hit_stack(&events);
    summary.hit_failures = hit_failures;
    if let Some(hit_path) = &config.hit_path {
        log::info!("Reading TestDAQ hits from {}...", hit_path.to_string_lossy());
        tx.send(WorkerStatus::new(0.0, config.payload_paths.len(), BarColor::MAGENTA))?;
        let mut reader = HitStreamReader::new(BufReader::new(File::open(hit_path)?));
        let limit = usize::try_from(config.record_limit()).unwrap_or(usize::MAX);
        let (stream_hits, stream_failures) = reader.hits_by_dom(limit)?;
        for (dom_id, mut hits) in stream_hits {
            stack.entry(dom_id).or_default().append(&mut hits);
        }
        summary.hit_failures += stream_failures;
        tx.send(WorkerStatus::new(1.0, config.payload_paths.len(), BarColor::MAGENTA))?;
    }
    log::info!("Found {} events, {} DOMs.", events.len(), stack.len());

    if config.decode_waveforms {
        summary.waveform_failures = decode_all_waveforms(&stack);
    }
    if let Some(calibrator) = calibrator.as_mut() {
        summary.calibration_failures = calibrate_hits(calibrator, &mut stack, config.year);
    }

    summarize_events(&events, &mut summary);
    summary.doms = summarize_doms(&stack);
    summary.total_hits = summary.doms.values().map(|dom| dom.hits).sum();
    if let Some(run_number) = summary.run_number {
        log::info!("DAQ thinks this is run #{run_number}");
    }
    log::info!(
        "Run length is {:.1} s, event rate is {:.3} Hz",
        summary.run_length,
        summary.event_rate
    );

    if let Some(summary_path) = &config.summary_path {
        std::fs::write(summary_path, serde_yaml::to_string(&summary)?)?;
        log::info!("Wrote run summary to {}", summary_path.to_string_lossy());
    }
    Ok(summary)
}
