//! Typed DAQ payloads.
//!
//! Every payload starts with a 16-byte envelope (length, type, time) and the body layout
//! depends on the type. Container payloads (events, trigger requests, readout data)
//! embed a composite: a sub-envelope followed by nested payloads. Payload types that
//! are not understood are kept as opaque bytes.
use fxhash::FxHashMap;
use std::fmt;

use super::constants::*;
use super::error::HitError;
use super::hits::{DecodedHit, DomHit, EngineeringHit};
use super::slc_hit::DeltaCompressedHit;
use super::source_id::SourceId;

/// The 16-byte envelope shared by all payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadEnvelope {
    /// Total payload length including the envelope
    pub length: i32,
    pub payload_type: i32,
    /// UTC time in 0.1 ns (for monitor and DeltaSender hits this slot holds the mbid)
    pub utime: i64,
}

/// (first, last) times in 0.1 ns
pub type Interval = (i64, i64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitDataPayload {
    pub envelope: PayloadEnvelope,
    pub trigger_type: i32,
    pub trigger_cfg_id: i32,
    pub srcid: i32,
    pub mbid: u64,
    pub trigger_mode: i16,
}

/// Hit as sent by the DOMHub sender, before compression into event form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaSenderHitPayload {
    pub envelope: PayloadEnvelope,
    pub mbid: u64,
    pub utime: u64,
    pub version: u16,
    pub pedestal: u16,
    pub domclk: u64,
    pub word0: u32,
    pub word2: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorRecordPayload {
    pub envelope: PayloadEnvelope,
    pub mbid: u64,
    pub record: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngHitDataPayload {
    pub envelope: PayloadEnvelope,
    pub trigger_cfg_id: i32,
    pub srcid: i32,
    pub data_length: i32,
    pub format_id: i32,
    pub mbid: u64,
    pub utc: i64,
    pub data: Vec<u8>,
}

impl EngHitDataPayload {
    /// Decode the carried engineering hit, timed by the payload's UTC
    pub fn hit(&self) -> Result<EngineeringHit, HitError> {
        EngineeringHit::decode(self.mbid, self.envelope.utime, &self.data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaCompressedHitPayload {
    pub envelope: PayloadEnvelope,
    pub mbid: u64,
    pub order_check: i16,
    pub version: i16,
    pub pedestal: i16,
    pub data: Vec<u8>,
}

impl DeltaCompressedHitPayload {
    pub fn hit(&self) -> Result<DeltaCompressedHit, HitError> {
        DeltaCompressedHit::new(&self.data, self.mbid, self.envelope.utime)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupernovaPayload {
    pub envelope: PayloadEnvelope,
    pub mbid: u64,
    pub record_length: i16,
    pub format_id: i16,
    pub domclk: i64,
    /// One counter per 1.6384 ms bin
    pub scalers: Vec<u8>,
}

impl SupernovaPayload {
    /// End of the scaler window in 0.1 ns
    pub fn utc_end(&self) -> i64 {
        (self.scalers.len() as i64)
            .saturating_mul(SUPERNOVA_BIN_WIDTH)
            .saturating_add(self.envelope.utime)
    }
}

/// One DOM window requested by a trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadoutRequestElement {
    pub readout_type: i32,
    pub srcid: i32,
    pub interval: Interval,
    pub mbid: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadoutRequest {
    pub request_type: i16,
    pub trigger_uid: i32,
    pub srcid: i32,
    pub elements: Vec<ReadoutRequestElement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerRequestPayload {
    pub envelope: PayloadEnvelope,
    pub record_type: i16,
    pub uid: i32,
    pub trigger_type: i32,
    pub trigger_cfg_id: i32,
    pub srcid: i32,
    pub interval: Interval,
    pub readout_request: ReadoutRequest,
    /// Hit payloads or, for merged triggers, nested trigger requests
    pub hits: Vec<Payload>,
}

impl TriggerRequestPayload {
    /// Flatten the (srcid, type, config id) of this request and every nested request
    pub fn triggers(&self) -> Vec<(i32, i32, i32)> {
        let mut out = vec![(self.srcid, self.trigger_type, self.trigger_cfg_id)];
        for nested in &self.hits {
            if let Payload::TriggerRequest(request) = nested {
                out.extend(request.triggers());
            }
        }
        out
    }

    /// All hit data payloads, including those inside nested requests
    pub fn hit_data(&self) -> Vec<&HitDataPayload> {
        let mut out = Vec::new();
        for nested in &self.hits {
            match nested {
                Payload::HitData(hit) => out.push(hit),
                Payload::TriggerRequest(request) => out.extend(request.hit_data()),
                _ => (),
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadoutDataPayload {
    pub envelope: PayloadEnvelope,
    pub record_type: i16,
    pub uid: i32,
    pub index: i16,
    pub is_last: i16,
    pub srcid: i32,
    pub interval: Interval,
    pub data: Vec<Payload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitRecordKind {
    Engineering,
    DeltaCompressed,
}

impl HitRecordKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Engineering),
            1 => Some(Self::DeltaCompressed),
            _ => None,
        }
    }
}

/// A hit stored inline in a version-5 event, timed relative to the event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitRecord {
    pub kind: HitRecordKind,
    pub flags: u8,
    pub channel_id: u16,
    pub utime: i64,
    pub data: Vec<u8>,
}

/// A trigger stored inline in a version-5 event, referencing hit records by index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRecord {
    pub trigger_type: i32,
    pub trigger_cfg_id: i32,
    pub srcid: u32,
    pub interval: Interval,
    pub hit_indices: Vec<u32>,
}

/// An event in any of the supported formats.
///
/// Versions 2-4 carry a trigger request and readout data payloads; version 5 carries
/// compact hit and trigger records instead. Fields absent in a version are zero/empty.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPayload {
    pub envelope: PayloadEnvelope,
    pub record_type: i16,
    pub uid: i32,
    pub srcid: i32,
    pub interval: Interval,
    pub event_type: i32,
    pub event_cfg_id: i32,
    pub year: i32,
    pub run_number: i32,
    pub subrun_number: i32,
    pub trigger_request: Option<Box<Payload>>,
    pub readout_data: Vec<Payload>,
    pub hit_records: Vec<HitRecord>,
    pub trigger_records: Vec<TriggerRecord>,
}

impl EventPayload {
    pub fn is_v5(&self) -> bool {
        self.envelope.payload_type == TYPE_EVENT_V5
    }

    /// (srcid, type, config id) of every trigger contributing to the event
    pub fn triggers(&self) -> Vec<(i32, i32, i32)> {
        if self.is_v5() {
            return self
                .trigger_records
                .iter()
                .map(|rec| (rec.srcid as i32, rec.trigger_type, rec.trigger_cfg_id))
                .collect();
        }
        match self.trigger_request.as_deref() {
            Some(Payload::TriggerRequest(request)) => request.triggers(),
            _ => Vec::new(),
        }
    }

    /// Decode every hit carried in the readout data, in order. Each hit decodes on its
    /// own, so one malformed hit does not hide the others.
    ///
    /// Version-5 hit records name their DOM by channel id rather than mainboard id, so
    /// they are reached through `hit_records` instead.
    pub fn hits(&self) -> impl Iterator<Item = Result<DecodedHit, HitError>> + '_ {
        self.readout_data
            .iter()
            .filter_map(|readout| match readout {
                Payload::ReadoutData(readout) => Some(readout.data.iter()),
                _ => None,
            })
            .flatten()
            .filter_map(|data| match data {
                Payload::EngHitData(hit) => Some(hit.hit().map(DecodedHit::Engineering)),
                Payload::DeltaCompressedHit(hit) => {
                    Some(hit.hit().map(DecodedHit::DeltaCompressed))
                }
                _ => None,
            })
    }

    /// The hit records referenced by a version-5 trigger record
    pub fn trigger_record_hits<'a>(
        &'a self,
        record: &'a TriggerRecord,
    ) -> impl Iterator<Item = &'a HitRecord> + 'a {
        record
            .hit_indices
            .iter()
            .filter_map(|idx| self.hit_records.get(*idx as usize))
    }
}

/// A decoded payload of any type
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    HitData(HitDataPayload),
    DeltaSenderHit(DeltaSenderHitPayload),
    MonitorRecord(MonitorRecordPayload),
    TriggerRequest(TriggerRequestPayload),
    EngHitData(EngHitDataPayload),
    ReadoutData(ReadoutDataPayload),
    Event(EventPayload),
    Supernova(SupernovaPayload),
    DeltaCompressedHit(DeltaCompressedHitPayload),
    Opaque {
        envelope: PayloadEnvelope,
        data: Vec<u8>,
    },
}

impl Payload {
    pub fn envelope(&self) -> &PayloadEnvelope {
        match self {
            Self::HitData(p) => &p.envelope,
            Self::DeltaSenderHit(p) => &p.envelope,
            Self::MonitorRecord(p) => &p.envelope,
            Self::TriggerRequest(p) => &p.envelope,
            Self::EngHitData(p) => &p.envelope,
            Self::ReadoutData(p) => &p.envelope,
            Self::Event(p) => &p.envelope,
            Self::Supernova(p) => &p.envelope,
            Self::DeltaCompressedHit(p) => &p.envelope,
            Self::Opaque { envelope, .. } => envelope,
        }
    }

    pub fn payload_type(&self) -> i32 {
        self.envelope().payload_type
    }

    pub fn utime(&self) -> i64 {
        self.envelope().utime
    }

    pub fn length(&self) -> i32 {
        self.envelope().length
    }

    pub fn as_event(&self) -> Option<&EventPayload> {
        match self {
            Self::Event(event) => Some(event),
            _ => None,
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HitData(hit) => write!(
                f,
                "HitData[{} @ {}: trigger {}/{} mode {} dom {:012x}]",
                SourceId(hit.srcid),
                hit.envelope.utime,
                hit.trigger_type,
                hit.trigger_cfg_id,
                hit.trigger_mode,
                hit.mbid
            ),
            Self::TriggerRequest(request) => {
                write!(
                    f,
                    "TriggerRequest[{} uid {} type {}/{} ({}, {}) with {} elements, {} hits]",
                    SourceId(request.srcid),
                    request.uid,
                    request.trigger_type,
                    request.trigger_cfg_id,
                    request.interval.0,
                    request.interval.1,
                    request.readout_request.elements.len(),
                    request.hits.len()
                )
            }
            Self::ReadoutData(readout) => write!(
                f,
                "ReadoutData[{} uid {} #{}{} with {} payloads]",
                SourceId(readout.srcid),
                readout.uid,
                readout.index,
                if readout.is_last != 0 { " (last)" } else { "" },
                readout.data.len()
            ),
            Self::Event(event) => write!(
                f,
                "Event[v{} uid {} run {}.{} ({}, {}) triggers {} readouts {} hits {}]",
                match event.envelope.payload_type {
                    TYPE_EVENT_V2 => 2,
                    TYPE_EVENT_V3 => 3,
                    TYPE_EVENT_V4 => 4,
                    _ => 5,
                },
                event.uid,
                event.run_number,
                event.subrun_number,
                event.interval.0,
                event.interval.1,
                event.triggers().len(),
                event.readout_data.len(),
                event.hit_records.len()
            ),
            Self::Supernova(sn) => write!(
                f,
                "Supernova[dom {:012x} ({}, {}) {} bins]",
                sn.mbid,
                sn.envelope.utime,
                sn.utc_end(),
                sn.scalers.len()
            ),
            other => {
                let envelope = other.envelope();
                write!(
                    f,
                    "Payload#{}[@{}, {} bytes]",
                    envelope.payload_type, envelope.utime, envelope.length
                )
            }
        }
    }
}

/// Per-DOM hit lists keyed by DOM id
pub type HitStack = FxHashMap<String, Vec<DecodedHit>>;

/// Collect the hits of many events into per-DOM lists. Hits that fail to decode are
/// logged and skipped; their number is returned alongside the stack.
pub fn hit_stack<'a, I>(events: I) -> (HitStack, u64)
where
    I: IntoIterator<Item = &'a EventPayload>,
{
    let mut stack = HitStack::default();
    let mut failures = 0;
    for event in events {
        for hit in event.hits() {
            match hit {
                Ok(hit) => stack.entry(hit.dom_id()).or_default().push(hit),
                Err(e) => {
                    log::warn!("Event {}: skipping hit: {e}", event.uid);
                    failures += 1;
                }
            }
        }
    }
    (stack, failures)
}
