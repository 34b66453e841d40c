//! Compressed (Soft Local Coincidence) hit formats.
//!
//! All compressed hits share a 16-byte prefix: the 48-bit DOM clock followed by two
//! header words. The remainder of the record is the delta-compressed waveform data,
//! which is only decoded when asked for.
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::cell::OnceCell;

use super::constants::{ATWD_CHANNELS, ATWD_SAMPLES, FADC_SAMPLES, SLC_PREFIX_SIZE};
use super::delta_codec::DeltaCodec;
use super::error::HitError;
use super::hits::{DomHit, HitCalibration};

const DOMCLK_MASK: i64 = 0xffff_ffff_ffff;

/// Peak position and the three FADC amplitudes around the peak
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeStamp {
    pub peak_position: u8,
    pub pre_peak: u16,
    pub peak: u16,
    pub post_peak: u16,
}

/// The two header words shared by all compressed hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlcHeader {
    pub domclk: i64,
    pub words: [u32; 2],
}

impl SlcHeader {
    fn parse<B: ByteOrder>(buf: &[u8]) -> Result<Self, HitError> {
        if buf.len() < SLC_PREFIX_SIZE {
            return Err(HitError::TooShort {
                needed: SLC_PREFIX_SIZE,
                actual: buf.len(),
            });
        }
        Ok(Self {
            domclk: B::read_i64(&buf[0..8]) & DOMCLK_MASK,
            words: [B::read_u32(&buf[8..12]), B::read_u32(&buf[12..16])],
        })
    }

    pub fn trigger(&self) -> u32 {
        (self.words[0] & 0x7ffe_0000) >> 18
    }

    pub fn lc(&self) -> u32 {
        (self.words[0] & 0x3_0000) >> 16
    }

    pub fn fadc_avail(&self) -> bool {
        self.words[0] & 0x8000 != 0
    }

    pub fn atwd_avail(&self) -> bool {
        self.words[0] & 0x4000 != 0
    }

    /// Raw channel field; the number of ATWD channels read out is this plus one
    pub fn atwd_channels(&self) -> u32 {
        (self.words[0] & 0x3000) >> 12
    }

    pub fn atwd_chip(&self) -> u32 {
        (self.words[0] & 0x800) >> 11
    }

    /// Record length in bytes
    pub fn hit_size(&self) -> u32 {
        self.words[0] & 0x7ff
    }

    /// The amplitudes are stored with one bit less when the high-range flag is set
    pub fn charge_stamp(&self) -> ChargeStamp {
        let word = self.words[1];
        let shift = if word & 0x8000_0000 != 0 { 1 } else { 0 };
        ChargeStamp {
            peak_position: ((word >> 27) & 0xf) as u8,
            pre_peak: (((word >> 18) & 0x1ff) << shift) as u16,
            peak: (((word >> 9) & 0x1ff) << shift) as u16,
            post_peak: ((word & 0x1ff) << shift) as u16,
        }
    }
}

/// Decoded FADC and ATWD samples of a compressed hit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Waveforms {
    pub fadc: Vec<i32>,
    pub atwd: [Vec<i32>; ATWD_CHANNELS],
}

/// A delta-compressed DOM hit.
///
/// The compressed buffer is kept as is; [`DeltaCompressedHit::decode_waveforms`]
/// expands it once and caches the result.
#[derive(Debug, Clone)]
pub struct DeltaCompressedHit {
    pub mbid: u64,
    pub utc: i64,
    pub header: SlcHeader,
    compressed: Vec<u8>,
    waveforms: OnceCell<Waveforms>,
    pub calibration: Option<HitCalibration>,
}

impl DeltaCompressedHit {
    /// Build a hit from big-endian record data (as carried in payloads)
    pub fn new(buf: &[u8], mbid: u64, utc: i64) -> Result<Self, HitError> {
        Self::from_bytes::<BigEndian>(buf, mbid, utc)
    }

    /// Build a hit from little-endian record data (as written by TestDAQ)
    pub fn new_le(buf: &[u8], mbid: u64, utc: i64) -> Result<Self, HitError> {
        Self::from_bytes::<LittleEndian>(buf, mbid, utc)
    }

    fn from_bytes<B: ByteOrder>(buf: &[u8], mbid: u64, utc: i64) -> Result<Self, HitError> {
        let header = SlcHeader::parse::<B>(buf)?;
        Ok(Self {
            mbid,
            utc,
            header,
            compressed: buf[SLC_PREFIX_SIZE..].to_vec(),
            waveforms: OnceCell::new(),
            calibration: None,
        })
    }

    /// The compressed waveform bytes following the header
    pub fn compressed(&self) -> &[u8] {
        &self.compressed
    }

    /// Expand the compressed waveforms, or return them if that was already done.
    ///
    /// 256 FADC samples are present when `fadc_avail` is set, followed by 128 samples
    /// for each ATWD channel read out. A corrupt stream leaves the hit undecoded.
    pub fn decode_waveforms(&self) -> Result<&Waveforms, HitError> {
        if let Some(waveforms) = self.waveforms.get() {
            return Ok(waveforms);
        }
        let mut codec = DeltaCodec::new(&self.compressed);
        let mut waveforms = Waveforms::default();
        if self.header.fadc_avail() {
            waveforms.fadc = codec.decode(FADC_SAMPLES)?;
        }
        if self.header.atwd_avail() {
            let channels = self.header.atwd_channels() as usize + 1;
            for channel in waveforms.atwd.iter_mut().take(channels) {
                *channel = codec.decode(ATWD_SAMPLES)?;
            }
        }
        Ok(self.waveforms.get_or_init(|| waveforms))
    }

    /// Waveforms if they have been decoded
    pub fn waveforms(&self) -> Option<&Waveforms> {
        self.waveforms.get()
    }

    pub fn is_decoded(&self) -> bool {
        self.waveforms.get().is_some()
    }
}

impl DomHit for DeltaCompressedHit {
    fn mbid(&self) -> u64 {
        self.mbid
    }

    fn domclk(&self) -> i64 {
        self.header.domclk
    }

    fn calibration(&self) -> Option<&HitCalibration> {
        self.calibration.as_ref()
    }

    fn set_calibration(&mut self, calibration: HitCalibration) {
        self.calibration = Some(calibration);
    }
}
