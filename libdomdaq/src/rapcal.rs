//! RAPCal (Reciprocal Active Pulsing Calibration) records.
//!
//! A RAPCal exchange sends a pulse from the DOR card to the DOM and back. Each record
//! holds the coarse transmit/receive clock readings of both ends plus the digitized
//! receive waveforms, which refine the receive times to sub-tick precision. Two
//! neighboring records give the ratio of the DOR and DOM clock rates and the one-way
//! cable delay, which is enough to map a DOM clock reading onto the DOR clock.
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use std::cell::OnceCell;
use std::io::{Cursor, Read};
use time::Date;

use super::constants::*;
use super::error::RapcalError;
use super::time_calibrator::TcalFormat;

/// The DOR card's GPS snapshot: day-of-year time string, quality flag, and the DOR clock
/// value at which the string was latched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpsStamp {
    pub day: u16,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub quality: u8,
    /// DOR clock in 0.1 ns units
    pub dor_gps_clock: i64,
}

fn parse_gps_field<T: std::str::FromStr>(text: &str, range: std::ops::Range<usize>) -> Result<T, RapcalError> {
    text.get(range)
        .and_then(|field| field.trim().parse::<T>().ok())
        .ok_or_else(|| RapcalError::BadGpsString(text.to_string()))
}

/// Reject raw clock readings too large to convert to 0.1 ns and compare
fn check_clock(field: &'static str, value: i64) -> Result<i64, RapcalError> {
    if (-MAX_CLOCK_READING..=MAX_CLOCK_READING).contains(&value) {
        Ok(value)
    } else {
        Err(RapcalError::ClockOutOfRange { field, value })
    }
}

impl GpsStamp {
    /// Parse the 22-byte block: SOH, "DDD:HH:MM:SS", quality, big-endian DOR clock in ticks
    pub fn parse(block: &[u8]) -> Result<Self, RapcalError> {
        if block.len() < GPS_BLOCK_SIZE {
            return Err(RapcalError::BadGpsString(
                String::from_utf8_lossy(block).into_owned(),
            ));
        }
        let raw = &block[1..13];
        let text = std::str::from_utf8(raw)
            .map_err(|_| RapcalError::BadGpsString(String::from_utf8_lossy(raw).into_owned()))?;
        Ok(Self {
            day: parse_gps_field(text, 0..3)?,
            hour: parse_gps_field(text, 4..6)?,
            minute: parse_gps_field(text, 7..9)?,
            second: parse_gps_field(text, 10..12)?,
            quality: block[13],
            dor_gps_clock: check_clock("GPS", BigEndian::read_i64(&block[14..22]))? * DOR_TICK,
        })
    }

    /// Seconds since the start of the (unknown) year
    pub fn seconds_into_year(&self) -> i64 {
        60 * (60 * (24 * (self.day as i64 - 1) + self.hour as i64) + self.minute as i64)
            + self.second as i64
    }

    /// Offset from DOR clock to time-of-year, in 0.1 ns
    pub fn offset(&self) -> i64 {
        TICKS_PER_SECOND * self.seconds_into_year() - self.dor_gps_clock
    }

    /// UNIX seconds of the GPS string. The string has no year so it must be supplied.
    pub fn unix_time(&self, year: i32) -> Result<i64, RapcalError> {
        let date = Date::from_ordinal_date(year, self.day)?;
        let datetime = date.with_hms(self.hour, self.minute, self.second)?;
        Ok(datetime.assume_utc().unix_timestamp())
    }
}

/// Clock ratio and cable delay derived from a pair of records
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockCalibration {
    /// DOR ticks per DOM tick, both in 0.1 ns
    pub clock_ratio: f64,
    /// One-way cable delay in 0.1 ns
    pub cable_length: i64,
}

/// Refine a coarse receive time using the received waveform.
///
/// The baseline is the mean of the first samples, and the edge is the first upward
/// crossing of baseline + threshold, linearly interpolated between samples.
fn leading_edge_offset(waveform: &[i16], clock: &'static str) -> Result<i64, RapcalError> {
    let window: Vec<f64> = waveform
        .iter()
        .take(RAPCAL_EDGE_WINDOW)
        .map(|sample| *sample as f64)
        .collect();
    let baseline = window.iter().take(RAPCAL_BASELINE_SAMPLES).sum::<f64>()
        / RAPCAL_BASELINE_SAMPLES as f64;
    let threshold = baseline + DISC_THRESHOLD;
    let fine = window
        .windows(2)
        .enumerate()
        .find(|(_, pair)| pair[0] <= threshold && pair[1] > threshold)
        .map(|(idx, pair)| (threshold - pair[0]) / (pair[1] - pair[0]) + idx as f64)
        .ok_or(RapcalError::NoLeadingEdge { clock })?;
    Ok((WAVEFORM_SAMPLE_PERIOD * (fine - RAPCAL_EDGE_WINDOW as f64)) as i64)
}

/// One RAPCal exchange between a DOR card and a DOM.
///
/// Raw clock fields are in native units (DOR: 50 ns, DOM: 25 ns); the accessors
/// return 0.1 ns. The corrected receive times and the pair calibration are computed
/// at most once.
#[derive(Debug, Clone)]
pub struct RapCal {
    pub dor_tx: i64,
    pub dor_rx: i64,
    pub dor_waveform: Vec<i16>,
    pub dom_rx: i64,
    pub dom_tx: i64,
    pub dom_waveform: Vec<i16>,
    pub gps: Option<GpsStamp>,
    dor_rx_c: OnceCell<i64>,
    dom_rx_c: OnceCell<i64>,
    calibration: Option<ClockCalibration>,
}

impl RapCal {
    /// Parse a record body. Legacy bodies carry no GPS block, the DOMHub format has a
    /// 4-byte prefix before the clocks.
    pub fn parse(buf: &[u8], format: TcalFormat) -> Result<Self, RapcalError> {
        let mut cursor = Cursor::new(buf);
        if format == TcalFormat::DomHub {
            let mut prefix = [0u8; TCAL_V2_PREFIX_SIZE];
            cursor.read_exact(&mut prefix)?;
        }
        let dor_tx = check_clock("DOR tx", cursor.read_i64::<LittleEndian>()?)?;
        let dor_rx = check_clock("DOR rx", cursor.read_i64::<LittleEndian>()?)?;
        let mut dor_waveform = vec![0i16; RAPCAL_WAVEFORM_SAMPLES];
        cursor.read_i16_into::<LittleEndian>(&mut dor_waveform)?;
        // DOM receive precedes DOM transmit on the wire
        let dom_rx = check_clock("DOM rx", cursor.read_i64::<LittleEndian>()?)?;
        let dom_tx = check_clock("DOM tx", cursor.read_i64::<LittleEndian>()?)?;
        let mut dom_waveform = vec![0i16; RAPCAL_WAVEFORM_SAMPLES];
        cursor.read_i16_into::<LittleEndian>(&mut dom_waveform)?;

        let gps = match format {
            TcalFormat::Legacy => None,
            TcalFormat::SouthPole | TcalFormat::DomHub => {
                let mut block = [0u8; GPS_BLOCK_SIZE];
                cursor.read_exact(&mut block)?;
                Some(GpsStamp::parse(&block)?)
            }
        };

        Ok(Self {
            dor_tx,
            dor_rx,
            dor_waveform,
            dom_rx,
            dom_tx,
            dom_waveform,
            gps,
            dor_rx_c: OnceCell::new(),
            dom_rx_c: OnceCell::new(),
            calibration: None,
        })
    }

    pub fn dor_tx_ticks(&self) -> i64 {
        self.dor_tx.saturating_mul(DOR_TICK)
    }

    pub fn dom_tx_ticks(&self) -> i64 {
        self.dom_tx.saturating_mul(DOM_TICK)
    }

    /// Corrected DOR receive time in 0.1 ns
    pub fn dor_rx_c(&self) -> Result<i64, RapcalError> {
        if let Some(value) = self.dor_rx_c.get() {
            return Ok(*value);
        }
        let value = DOR_TICK
            .saturating_mul(self.dor_rx)
            .saturating_add(leading_edge_offset(&self.dor_waveform, "DOR")?);
        Ok(*self.dor_rx_c.get_or_init(|| value))
    }

    /// Corrected DOM receive time in 0.1 ns
    pub fn dom_rx_c(&self) -> Result<i64, RapcalError> {
        if let Some(value) = self.dom_rx_c.get() {
            return Ok(*value);
        }
        let value = DOM_TICK
            .saturating_mul(self.dom_rx)
            .saturating_add(leading_edge_offset(&self.dom_waveform, "DOM")?);
        Ok(*self.dom_rx_c.get_or_init(|| value))
    }

    /// Calibrate against the preceding record. Only the first call has any effect.
    pub fn do_rapcal(&mut self, previous: &RapCal) -> Result<(), RapcalError> {
        if self.calibration.is_some() {
            return Ok(());
        }
        let dom_rx_c = self.dom_rx_c()?;
        let delta_dom = dom_rx_c as f64 - previous.dom_rx_c()? as f64;
        if delta_dom == 0.0 {
            return Err(RapcalError::DegenerateClockPair);
        }
        let clock_ratio = (self.dor_tx_ticks() as f64 - previous.dor_tx_ticks() as f64) / delta_dom;
        let dom_turnaround = (clock_ratio * (self.dom_tx_ticks() as f64 - dom_rx_c as f64)) as i64;
        let round_trip = self
            .dor_rx_c()?
            .checked_sub(self.dor_tx_ticks())
            .and_then(|value| value.checked_sub(dom_turnaround))
            .ok_or(RapcalError::ClockOverflow)?;
        self.calibration = Some(ClockCalibration {
            clock_ratio,
            cable_length: round_trip.div_euclid(2),
        });
        Ok(())
    }

    pub fn calibration(&self) -> Option<ClockCalibration> {
        self.calibration
    }

    /// Translate a DOM clock reading (25 ns units) to DOR time in 0.1 ns
    pub fn dom_to_dor(&self, domclk: i64) -> Result<i64, RapcalError> {
        let cal = self.calibration.ok_or(RapcalError::NotCalibrated)?;
        let dom_rx_c = self.dom_rx_c()?;
        let since_rx = domclk
            .checked_mul(DOM_TICK)
            .and_then(|ticks| ticks.checked_sub(dom_rx_c))
            .ok_or(RapcalError::ClockOverflow)?;
        let elapsed = (cal.clock_ratio * since_rx as f64) as i64;
        elapsed
            .checked_add(self.dor_tx_ticks())
            .and_then(|value| value.checked_add(cal.cable_length))
            .ok_or(RapcalError::ClockOverflow)
    }

    /// Translate a DOM clock reading to time-of-year in 0.1 ns
    pub fn dom_to_ut(&self, domclk: i64) -> Result<i64, RapcalError> {
        let gps = self.gps.ok_or(RapcalError::NoGpsStamp)?;
        self.dom_to_dor(domclk)?
            .checked_add(gps.offset())
            .ok_or(RapcalError::ClockOverflow)
    }

    /// DOR clock at the last GPS string, or -1 for records without one
    pub fn dor_gps_clock(&self) -> i64 {
        self.gps.map(|gps| gps.dor_gps_clock).unwrap_or(-1)
    }

    pub fn gps_time(&self, year: i32) -> Result<i64, RapcalError> {
        self.gps.ok_or(RapcalError::NoGpsStamp)?.unix_time(year)
    }
}
