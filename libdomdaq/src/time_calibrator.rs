use byteorder::{BigEndian, ByteOrder, LittleEndian};
use fxhash::FxHashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use super::constants::*;
use super::error::TimeCalibratorError;
use super::hits::{format_mbid, DomHit, HitCalibration};
use super::payload_reader::read_full;
use super::rapcal::RapCal;

/// Layout of a TCAL stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcalFormat {
    /// Fixed 300-byte records, no GPS
    Legacy,
    /// Fixed 334-byte records with the DOR GPS snapshot
    SouthPole,
    /// Length-prefixed records written by the DOMHub
    DomHub,
}

impl TryFrom<u8> for TcalFormat {
    type Error = TimeCalibratorError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Legacy),
            1 => Ok(Self::SouthPole),
            2 => Ok(Self::DomHub),
            _ => Err(TimeCalibratorError::UnknownFormat(value)),
        }
    }
}

/// TimeCalibrator holds the RAPCal records of every DOM in a TCAL stream and uses them
/// to translate hit times from DOM clock units to DOR (surface) time.
///
/// Records are kept per DOM in stream order.
#[derive(Debug, Default)]
pub struct TimeCalibrator {
    records: FxHashMap<String, Vec<RapCal>>,
}

impl TimeCalibrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every record of a TCAL stream. A short final record ends the stream.
    pub fn from_reader<R: Read>(reader: R, format: TcalFormat) -> Result<Self, TimeCalibratorError> {
        let mut calibrator = Self::new();
        calibrator.read_records(reader, format)?;
        Ok(calibrator)
    }

    pub fn from_file(path: &Path, format: TcalFormat) -> Result<Self, TimeCalibratorError> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file), format)
    }

    /// Append the records of a stream, returning how many were read
    pub fn read_records<R: Read>(
        &mut self,
        mut reader: R,
        format: TcalFormat,
    ) -> Result<usize, TimeCalibratorError> {
        let mut count = 0;
        match format {
            TcalFormat::DomHub => loop {
                let mut header = [0u8; TCAL_V2_HEADER_SIZE];
                if read_full(&mut reader, &mut header)? < TCAL_V2_HEADER_SIZE {
                    break;
                }
                let record_length = BigEndian::read_i32(&header[0..4]);
                let format_id = BigEndian::read_i32(&header[4..8]);
                let mbid = BigEndian::read_u64(&header[8..16]);
                let body_length = (record_length as i64 - TCAL_V2_HEADER_SIZE as i64).max(0) as u64;
                let mut body = Vec::new();
                (&mut reader).take(body_length).read_to_end(&mut body)?;
                if (body.len() as u64) < body_length {
                    break;
                }
                if format_id != TCAL_V2_FORMAT_ID {
                    log::debug!("Skipping TCAL record with format id {format_id}");
                    continue;
                }
                self.append(format_mbid(mbid), RapCal::parse(&body, format)?);
                count += 1;
            },
            TcalFormat::Legacy | TcalFormat::SouthPole => {
                let (record_size, body_offset) = if format == TcalFormat::Legacy {
                    (TCAL_V0_RECORD_SIZE, TCAL_V0_BODY_OFFSET)
                } else {
                    (TCAL_V1_RECORD_SIZE, TCAL_V1_BODY_OFFSET)
                };
                let mut buffer = vec![0u8; record_size];
                while read_full(&mut reader, &mut buffer)? == record_size {
                    let mbid = LittleEndian::read_u64(&buffer[0..8]);
                    self.append(format_mbid(mbid), RapCal::parse(&buffer[body_offset..], format)?);
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Add a record to the end of a DOM's list
    pub fn append(&mut self, dom_id: String, record: RapCal) {
        self.records.entry(dom_id).or_default().push(record);
    }

    pub fn records(&self, dom_id: &str) -> Option<&[RapCal]> {
        self.records.get(dom_id).map(|list| list.as_slice())
    }

    pub fn dom_ids(&self) -> impl Iterator<Item = &String> {
        self.records.keys()
    }

    pub fn len(&self) -> usize {
        self.records.values().map(|list| list.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Translate a hit's DOM clock to DOR time and attach the result to the hit.
    ///
    /// The record pair is the first record whose DOM receive time is later than the hit,
    /// together with its predecessor; hits past the last record use the final pair. The
    /// hit time is not checked against the span of the records. When the GPS snapshot of
    /// the chosen record disagrees with the hit by more than 100 s, earlier records are
    /// tried and the result is marked suspect.
    pub fn translate_dom_to_dor<H: DomHit + ?Sized>(
        &mut self,
        hit: &mut H,
        year: i32,
    ) -> Result<HitCalibration, TimeCalibratorError> {
        let dom_id = hit.dom_id();
        let records = self
            .records
            .get_mut(&dom_id)
            .ok_or_else(|| TimeCalibratorError::UnknownDom(dom_id.clone()))?;
        if records.len() < 2 {
            return Err(TimeCalibratorError::TooFewRecords {
                dom_id,
                count: records.len(),
            });
        }

        let domclk = hit.domclk();
        let mut ixrc = records
            .iter()
            .position(|rc| rc.dom_rx > domclk)
            .unwrap_or(records.len() - 1);
        if ixrc == 0 {
            ixrc = 1;
        }

        let (earlier, later) = records.split_at_mut(ixrc);
        let rc1 = &mut later[0];
        rc1.do_rapcal(&earlier[ixrc - 1])?;
        let utclk = rc1.dom_to_dor(domclk)?;
        let mut gps_clock = rc1.dor_gps_clock();
        let gps_time = rc1.gps_time(year).ok();

        let mut suspect = false;
        let count = records.len() as isize;
        for previous in GPS_WALKBACK_FIRST..=GPS_WALKBACK_LAST {
            let mismatch = utclk.abs_diff(gps_clock) as f64 / GPS_MISMATCH_SCALE;
            if mismatch <= GPS_MISMATCH_LIMIT {
                break;
            }
            // Negative indices count back from the end of the list
            let index = ixrc as isize - previous as isize;
            if index < -count {
                break;
            }
            let fallback = records[index.rem_euclid(count) as usize].dor_gps_clock();
            log::warn!(
                "DOM {dom_id}: GPS clock {gps_clock} is {mismatch:.1} x 10 s from hit time {utclk}; using record {} instead",
                index.rem_euclid(count)
            );
            gps_clock = fallback;
            suspect = true;
        }

        let calibration = HitCalibration {
            utclk,
            gps_clock,
            gps_time,
            gps_clock_suspect: suspect,
        };
        hit.set_calibration(calibration);
        Ok(calibration)
    }
}
