// Payload envelope
pub const ENVELOPE_SIZE: usize = 16;
pub const COMPOSITE_ENVELOPE_SIZE: usize = 8;
/// Deepest composite nesting accepted; real events nest a handful of levels
pub const MAX_COMPOSITE_DEPTH: usize = 16;

// Payload type tags
pub const TYPE_HIT_DATA: i32 = 1;
pub const TYPE_DELTA_SENDER_HIT: i32 = 3;
pub const TYPE_MONITOR_RECORD: i32 = 5;
pub const TYPE_TRIGGER_REQUEST: i32 = 9;
pub const TYPE_ENG_HIT_DATA: i32 = 10;
pub const TYPE_READOUT_DATA: i32 = 11;
pub const TYPE_EVENT_V2: i32 = 13;
pub const TYPE_SUPERNOVA: i32 = 16;
pub const TYPE_DELTA_COMPRESSED_HIT: i32 = 18;
pub const TYPE_EVENT_V3: i32 = 19;
pub const TYPE_EVENT_V4: i32 = 20;
pub const TYPE_EVENT_V5: i32 = 21;

// Fixed header sizes following the envelope
pub const HIT_DATA_HEADER_SIZE: usize = 22;
pub const DELTA_SENDER_HEADER_SIZE: usize = 38;
pub const EVENT_HEADER_SIZE: usize = 38;
pub const EVENT_V5_HEADER_SIZE: usize = 22;
pub const EVENT_V5_HIT_RECORD_HEADER_SIZE: usize = 10;
pub const EVENT_V5_TRIGGER_RECORD_HEADER_SIZE: usize = 24;
pub const TRIGGER_REQUEST_HEADER_SIZE: usize = 34;
pub const READOUT_REQUEST_HEADER_SIZE: usize = 14;
pub const READOUT_REQUEST_ELEMENT_SIZE: usize = 32;
pub const ENG_HIT_HEADER_SIZE: usize = 40;
pub const READOUT_DATA_HEADER_SIZE: usize = 30;
pub const DELTA_COMPRESSED_HEADER_SIZE: usize = 26;
pub const DELTA_COMPRESSED_MBID_OFFSET: usize = 12;

/// The DeltaSenderHit byte-order check word must read as this value
pub const EXPECTED_ORDER_CHECK: u16 = 1;

// Compressed hit waveforms
pub const SLC_PREFIX_SIZE: usize = 16;
pub const FADC_SAMPLES: usize = 256;
pub const ATWD_SAMPLES: usize = 128;
pub const ATWD_CHANNELS: usize = 4;

// RAPCal
/// Software discriminator threshold above baseline, in ADC counts
pub const DISC_THRESHOLD: f64 = 50.0;
pub const RAPCAL_WAVEFORM_SAMPLES: usize = 64;
/// Only the first 48 waveform samples are searched for the leading edge
pub const RAPCAL_EDGE_WINDOW: usize = 48;
pub const RAPCAL_BASELINE_SAMPLES: usize = 10;
/// DOR clock tick in 0.1 ns units (20 MHz)
pub const DOR_TICK: i64 = 500;
/// DOM clock tick in 0.1 ns units (40 MHz)
pub const DOM_TICK: i64 = 250;
/// Waveform sample period in 0.1 ns units
pub const WAVEFORM_SAMPLE_PERIOD: f64 = 500.0;
pub const RAPCAL_BODY_SIZE: usize = 288;
pub const GPS_BLOCK_SIZE: usize = 22;
pub const TICKS_PER_SECOND: i64 = 10_000_000_000;
/// Largest raw clock reading accepted from a calibration record (about 7 years of DOR ticks)
pub const MAX_CLOCK_READING: i64 = i64::MAX / (4 * DOR_TICK);

// Calibration stream record layouts
pub const TCAL_V0_RECORD_SIZE: usize = 300;
pub const TCAL_V0_BODY_OFFSET: usize = 12;
pub const TCAL_V1_RECORD_SIZE: usize = 334;
pub const TCAL_V1_BODY_OFFSET: usize = 24;
pub const TCAL_V2_HEADER_SIZE: usize = 16;
pub const TCAL_V2_PREFIX_SIZE: usize = 4;
pub const TCAL_V2_FORMAT_ID: i32 = 201;

// GPS walk-back heuristic
pub const GPS_WALKBACK_FIRST: usize = 2;
pub const GPS_WALKBACK_LAST: usize = 5;
pub const GPS_MISMATCH_SCALE: f64 = 10e10;
pub const GPS_MISMATCH_LIMIT: f64 = 10.0;

// TestDAQ hit stream
pub const HIT_STREAM_HEADER_SIZE: usize = 32;
pub const HIT_STREAM_ENGINEERING: i32 = 2;
pub const HIT_STREAM_DELTA_COMPRESSED: i32 = 3;
pub const HIT_STREAM_DELTA_SKIP: usize = 6;

// Engineering hits
pub const ENGINEERING_HEADER_SIZE: usize = 16;

// Supernova scalers
pub const SUPERNOVA_HEADER_SIZE: usize = 10;
pub const SUPERNOVA_BIN_WIDTH: i64 = 16_384_000;

/// Source ids at multiples of 1000 identify the global trigger
pub const GLOBAL_TRIGGER_SOURCE: i32 = 6;
