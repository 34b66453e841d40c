use std::path::PathBuf;
use thiserror::Error;

use super::constants::*;
use super::worker_status::WorkerStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeltaCodecError {
    #[error("DeltaCodec escape received at the widest code width ({0} bits); stream is corrupt")]
    WidthOverflow(u32),
    #[error("DeltaCodec attempted to narrow below the narrowest code width ({0} bits); stream is corrupt")]
    WidthUnderflow(u32),
    #[error("DeltaCodec ran out of data after {decoded} of {requested} samples")]
    Exhausted { decoded: usize, requested: usize },
    #[error("DeltaEncoder cannot represent a delta of {0}; the widest code holds +/-1023")]
    DeltaOutOfRange(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HitError {
    #[error("Hit buffer too short: need {needed} bytes, got {actual}")]
    TooShort { needed: usize, actual: usize },
    #[error("Failed to decode compressed waveforms: {0}")]
    Codec(#[from] DeltaCodecError),
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Payload stream failed with IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Payload of type {payload_type} at offset {offset} declares {length} bytes but the stream ended early")]
    Truncated {
        offset: u64,
        payload_type: i32,
        length: i32,
    },
    #[error("Payload of type {payload_type} at offset {offset} declares an invalid length {length}; expected at least {min}", min=ENVELOPE_SIZE)]
    BadLength {
        offset: u64,
        payload_type: i32,
        length: i32,
    },
    #[error("Payload of type {payload_type} at offset {offset} declares {length} bytes, which is too short for its fixed header")]
    HeaderOverrun {
        offset: u64,
        payload_type: i32,
        length: i32,
    },
    #[error("Payload of type {payload_type} at offset {offset} declares {declared} bytes but {consumed} were consumed")]
    LengthMismatch {
        offset: u64,
        payload_type: i32,
        declared: usize,
        consumed: usize,
    },
    #[error("Composite at offset {offset} declares {declared} bytes but its {count} payloads occupy {consumed}")]
    CompositeLengthMismatch {
        offset: u64,
        count: usize,
        declared: usize,
        consumed: usize,
    },
    #[error("Composite at offset {offset} declares {declared} payloads but only {found} were present")]
    CompositeCountMismatch {
        offset: u64,
        declared: usize,
        found: usize,
    },
    #[error("Bad order-check {value} for DeltaSenderHit at offset {offset}; expected {exp}", exp=EXPECTED_ORDER_CHECK)]
    BadOrderCheck { offset: u64, value: u16 },
    #[error("Trigger record at offset {offset} references hit {index} but the event has only {count} hit records")]
    BadHitIndex {
        offset: u64,
        index: u32,
        count: usize,
    },
    #[error("Composite at offset {offset} is nested more than {max} levels deep", max=MAX_COMPOSITE_DEPTH)]
    NestingTooDeep { offset: u64 },
    #[error("Payload of type {payload_type} at offset {offset} has a time that does not fit in 64 bits")]
    TimeOverflow { offset: u64, payload_type: i32 },
}


#[derive(Debug, Error)]
pub enum RapcalError {
    #[error("RAPCal record failed to parse: {0}")]
    IOError(#[from] std::io::Error),
    #[error("No leading edge found in the first {window} samples of the {clock} waveform", window=RAPCAL_EDGE_WINDOW)]
    NoLeadingEdge { clock: &'static str },
    #[error("RAPCal records have identical DOM receive times; clock ratio is undefined")]
    DegenerateClockPair,
    #[error("RAPCal record used for translation before doRAPCal was performed")]
    NotCalibrated,
    #[error("RAPCal record carries no GPS time stamp")]
    NoGpsStamp,
    #[error("RAPCal record has an unreadable GPS string {0:?}")]
    BadGpsString(String),
    #[error("RAPCal GPS string does not form a valid date: {0}")]
    BadGpsDate(#[from] time::error::ComponentRange),
    #[error("RAPCal {field} reading {value} is outside the accepted clock range")]
    ClockOutOfRange { field: &'static str, value: i64 },
    #[error("RAPCal time translation overflowed")]
    ClockOverflow,
}

#[derive(Debug, Error)]
pub enum TimeCalibratorError {
    #[error("TimeCalibrator failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Unknown TCAL format version {0}")]
    UnknownFormat(u8),
    #[error("TimeCalibrator has no RAPCal records for DOM {0}")]
    UnknownDom(String),
    #[error("TimeCalibrator needs at least two RAPCal records for DOM {dom_id}, found {count}")]
    TooFewRecords { dom_id: String, count: usize },
    #[error("TimeCalibrator failed due to RAPCal error: {0}")]
    Rapcal(#[from] RapcalError),
}

#[derive(Debug, Error)]
pub enum HitStreamError {
    #[error("Hit stream failed with IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Hit record at offset {offset} declares invalid length {length}")]
    BadLength { offset: u64, length: i32 },
    #[error("Hit record at offset {offset} declares {length} bytes but the stream ended early")]
    Truncated { offset: u64, length: i32 },
    #[error("Hit stream record could not be decoded: {0}")]
    BadHit(#[from] HitError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config has no payload files to process")]
    NoPayloadFiles,
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to Payload error: {0}")]
    PayloadError(#[from] PayloadError),
    #[error("Processor failed due to TimeCalibrator error: {0}")]
    TimeCalibratorError(#[from] TimeCalibratorError),
    #[error("Processor failed due to HitStream error: {0}")]
    HitStreamError(#[from] HitStreamError),
    #[error("Processor failed due to Hit error: {0}")]
    HitError(#[from] HitError),
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor failed to write the summary as yaml: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Processor failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
    #[error("Processor failed due to IO error: {0}")]
    IoError(#[from] std::io::Error),
}
