use byteorder::{BigEndian, ByteOrder};
use time::macros::format_description;
use time::OffsetDateTime;

use super::constants::ENGINEERING_HEADER_SIZE;
use super::error::HitError;
use super::slc_hit::DeltaCompressedHit;

/// Render a mainboard id the way DOMs are named in every lookup table: 12 hex digits
pub fn format_mbid(mbid: u64) -> String {
    format!("{mbid:012x}")
}

/// The result of translating a hit's DOM clock into surface time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitCalibration {
    /// Hit time in DOR units (0.1 ns)
    pub utclk: i64,
    /// DOR clock (0.1 ns) at the last GPS string read
    pub gps_clock: i64,
    /// UNIX seconds of the GPS string, when the record carried one
    pub gps_time: Option<i64>,
    /// Set when the GPS snapshot was taken from an earlier RAPCal record
    pub gps_clock_suspect: bool,
}

impl HitCalibration {
    /// Offset of the hit from the GPS string time, in 0.1 ns. None when the GPS clock is
    /// invalid or too far from the hit to express.
    pub fn offset(&self) -> Option<i64> {
        if self.gps_clock != 0 {
            self.utclk.checked_sub(self.gps_clock)
        } else {
            None
        }
    }

    /// Format the GPS time as `YYYY-MM-DD HH:MM:SS` (UTC)
    pub fn utc_string(&self) -> Option<String> {
        let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
        OffsetDateTime::from_unix_timestamp(self.gps_time?)
            .ok()
            .and_then(|dt| dt.format(&format).ok())
    }
}

/// Anything carrying a DOM clock which the TimeCalibrator can translate.
pub trait DomHit {
    fn mbid(&self) -> u64;
    fn domclk(&self) -> i64;
    fn calibration(&self) -> Option<&HitCalibration>;
    fn set_calibration(&mut self, calibration: HitCalibration);

    fn dom_id(&self) -> String {
        format_mbid(self.mbid())
    }

    /// The calibrated hit time, if the hit has been translated
    fn utclk(&self) -> Option<i64> {
        self.calibration().map(|cal| cal.utclk)
    }
}

/// Number of ATWD samples and whether they are 16 bits wide, from a 4-bit format nibble
fn atwd_layout(nibble: u8) -> Option<(usize, bool)> {
    if nibble & 0x1 == 0 {
        return None;
    }
    let samples = match (nibble >> 2) & 0x3 {
        0 => 32,
        1 => 64,
        2 => 16,
        _ => 128,
    };
    Some((samples, nibble & 0x2 != 0))
}

/// An uncompressed engineering-format DOM hit.
///
/// Header is 16 bytes big-endian: record length, format id, ATWD chip, FADC sample
/// count, two ATWD format bytes (one nibble per channel), trigger flag, a spare byte,
/// and the 6-byte DOM clock.
#[derive(Debug, Clone)]
pub struct EngineeringHit {
    pub mbid: u64,
    pub utc: i64,
    pub record_length: u16,
    pub format_id: u16,
    pub atwd_chip: u8,
    pub trigger_flag: u8,
    pub domclk: i64,
    pub fadc: Vec<u16>,
    pub atwd: [Option<Vec<u16>>; 4],
    pub calibration: Option<HitCalibration>,
}

impl EngineeringHit {
    pub fn decode(mbid: u64, utc: i64, buf: &[u8]) -> Result<Self, HitError> {
        if buf.len() < ENGINEERING_HEADER_SIZE {
            return Err(HitError::TooShort {
                needed: ENGINEERING_HEADER_SIZE,
                actual: buf.len(),
            });
        }
        let record_length = BigEndian::read_u16(&buf[0..2]);
        let format_id = BigEndian::read_u16(&buf[2..4]);
        let atwd_chip = buf[4] & 0x1;
        let fadc_count = buf[5] as usize;
        let atwd_format = [buf[6] & 0x0f, buf[6] >> 4, buf[7] & 0x0f, buf[7] >> 4];
        let trigger_flag = buf[8];
        let domclk = BigEndian::read_u48(&buf[10..16]) as i64;

        let layouts = atwd_format.map(atwd_layout);
        let needed = ENGINEERING_HEADER_SIZE
            + 2 * fadc_count
            + layouts
                .iter()
                .flatten()
                .map(|(n, wide)| if *wide { 2 * n } else { *n })
                .sum::<usize>();
        if buf.len() < needed {
            return Err(HitError::TooShort {
                needed,
                actual: buf.len(),
            });
        }

        let mut pos = ENGINEERING_HEADER_SIZE;
        let fadc = (0..fadc_count)
            .map(|idx| BigEndian::read_u16(&buf[pos + 2 * idx..pos + 2 * idx + 2]))
            .collect();
        pos += 2 * fadc_count;

        let mut atwd: [Option<Vec<u16>>; 4] = Default::default();
        for (channel, layout) in layouts.iter().enumerate() {
            if let Some((samples, wide)) = layout {
                let data: Vec<u16> = if *wide {
                    let data = (0..*samples)
                        .map(|idx| BigEndian::read_u16(&buf[pos + 2 * idx..pos + 2 * idx + 2]))
                        .collect();
                    pos += 2 * samples;
                    data
                } else {
                    let data = buf[pos..pos + samples].iter().map(|b| *b as u16).collect();
                    pos += samples;
                    data
                };
                atwd[channel] = Some(data);
            }
        }

        Ok(Self {
            mbid,
            utc,
            record_length,
            format_id,
            atwd_chip,
            trigger_flag,
            domclk,
            fadc,
            atwd,
            calibration: None,
        })
    }

    /// Beacon hits are forced triggers flagged by the DOM
    pub fn is_beacon(&self) -> bool {
        self.trigger_flag == 1
    }
}

impl DomHit for EngineeringHit {
    fn mbid(&self) -> u64 {
        self.mbid
    }

    fn domclk(&self) -> i64 {
        self.domclk
    }

    fn calibration(&self) -> Option<&HitCalibration> {
        self.calibration.as_ref()
    }

    fn set_calibration(&mut self, calibration: HitCalibration) {
        self.calibration = Some(calibration);
    }
}

/// A hit decoded from an event, in either hit format
#[derive(Debug, Clone)]
pub enum DecodedHit {
    Engineering(EngineeringHit),
    DeltaCompressed(DeltaCompressedHit),
}

impl DecodedHit {
    /// Beacons are only flagged in the engineering format
    pub fn is_beacon(&self) -> bool {
        match self {
            Self::Engineering(hit) => hit.is_beacon(),
            Self::DeltaCompressed(_) => false,
        }
    }

    /// The UTC stamp assigned by the DAQ
    pub fn utc(&self) -> i64 {
        match self {
            Self::Engineering(hit) => hit.utc,
            Self::DeltaCompressed(hit) => hit.utc,
        }
    }
}

impl DomHit for DecodedHit {
    fn mbid(&self) -> u64 {
        match self {
            Self::Engineering(hit) => hit.mbid(),
            Self::DeltaCompressed(hit) => hit.mbid(),
        }
    }

    fn domclk(&self) -> i64 {
        match self {
            Self::Engineering(hit) => hit.domclk(),
            Self::DeltaCompressed(hit) => hit.domclk(),
        }
    }

    fn calibration(&self) -> Option<&HitCalibration> {
        match self {
            Self::Engineering(hit) => hit.calibration(),
            Self::DeltaCompressed(hit) => hit.calibration(),
        }
    }

    fn set_calibration(&mut self, calibration: HitCalibration) {
        match self {
            Self::Engineering(hit) => hit.set_calibration(calibration),
            Self::DeltaCompressed(hit) => hit.set_calibration(calibration),
        }
    }
}
