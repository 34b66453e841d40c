use byteorder::{BigEndian, ByteOrder};
use std::io::Read;

use super::constants::*;
use super::error::HitStreamError;
use super::hits::{DecodedHit, DomHit, EngineeringHit};
use super::payload::HitStack;
use super::payload_reader::read_full;
use super::slc_hit::DeltaCompressedHit;

/// Reader for the flat hit files written by TestDAQ.
///
/// Each record has a 32-byte big-endian header (record length, format, mbid, 8 spare
/// bytes, UTC) followed by the hit. Engineering (format 2) and delta-compressed
/// (format 3) hits are decoded, anything else is skipped. A hit that fails to decode
/// is reported without losing the records after it; only a broken record header ends
/// iteration.
#[derive(Debug)]
pub struct HitStreamReader<R: Read> {
    stream: R,
    offset: u64,
    done: bool,
}

impl<R: Read> HitStreamReader<R> {
    pub fn new(stream: R) -> Self {
        Self {
            stream,
            offset: 0,
            done: false,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next decodable hit. A short header ends the stream.
    pub fn next_hit(&mut self) -> Result<Option<DecodedHit>, HitStreamError> {
        loop {
            let start = self.offset;
            let mut header = [0u8; HIT_STREAM_HEADER_SIZE];
            let got = read_full(&mut self.stream, &mut header)?;
            self.offset += got as u64;
            if got < HIT_STREAM_HEADER_SIZE {
                return Ok(None);
            }
            let record_length = BigEndian::read_i32(&header[0..4]);
            let format = BigEndian::read_i32(&header[4..8]);
            let mbid = BigEndian::read_u64(&header[8..16]);
            let utc = BigEndian::read_i64(&header[24..32]);
            if record_length < HIT_STREAM_HEADER_SIZE as i32 {
                return Err(HitStreamError::BadLength {
                    offset: start,
                    length: record_length,
                });
            }

            let body_length = record_length as usize - HIT_STREAM_HEADER_SIZE;
            let mut body = Vec::new();
            (&mut self.stream)
                .take(body_length as u64)
                .read_to_end(&mut body)?;
            self.offset += body.len() as u64;
            if body.len() < body_length {
                return Err(HitStreamError::Truncated {
                    offset: start,
                    length: record_length,
                });
            }

            match format {
                HIT_STREAM_ENGINEERING => {
                    return Ok(Some(DecodedHit::Engineering(EngineeringHit::decode(
                        mbid, utc, &body,
                    )?)))
                }
                HIT_STREAM_DELTA_COMPRESSED => {
                    let data = body.get(HIT_STREAM_DELTA_SKIP..).unwrap_or_default();
                    return Ok(Some(DecodedHit::DeltaCompressed(DeltaCompressedHit::new_le(
                        data, mbid, utc,
                    )?)));
                }
                other => log::debug!("Skipping hit record with format {other} at offset {start}"),
            }
        }
    }

    /// Read up to `count` hit records into per-DOM lists. Records whose hit fails to
    /// decode are logged and skipped; their number is returned with the lists.
    pub fn hits_by_dom(&mut self, count: usize) -> Result<(HitStack, u64), HitStreamError> {
        let mut hits = HitStack::default();
        let mut failures = 0;
        for _ in 0..count {
            match self.next_hit() {
                Ok(Some(hit)) => hits.entry(hit.dom_id()).or_default().push(hit),
                Ok(None) => break,
                Err(HitStreamError::BadHit(e)) => {
                    log::warn!("Skipping hit record before offset {}: {e}", self.offset);
                    failures += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok((hits, failures))
    }
}

impl<R: Read> Iterator for HitStreamReader<R> {
    type Item = Result<DecodedHit, HitStreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = self.next_hit().transpose();
        if !matches!(result, Some(Ok(_)) | Some(Err(HitStreamError::BadHit(_)))) {
            self.done = true;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HitError;
    use byteorder::{LittleEndian, WriteBytesExt};

    fn record(format: i32, mbid: u64, utc: i64, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_i32::<BigEndian>((HIT_STREAM_HEADER_SIZE + body.len()) as i32)
            .unwrap();
        buf.write_i32::<BigEndian>(format).unwrap();
        buf.write_u64::<BigEndian>(mbid).unwrap();
        buf.write_u64::<BigEndian>(0).unwrap();
        buf.write_i64::<BigEndian>(utc).unwrap();
        buf.extend_from_slice(body);
        buf
    }

    fn engineering_body(domclk: u64) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_u16::<BigEndian>(16).unwrap();
        body.write_u16::<BigEndian>(2).unwrap();
        body.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        body.write_u48::<BigEndian>(domclk).unwrap();
        body
    }

    fn compressed_body(domclk: i64) -> Vec<u8> {
        let mut body = vec![0u8; HIT_STREAM_DELTA_SKIP];
        body.write_i64::<LittleEndian>(domclk).unwrap();
        body.write_u32::<LittleEndian>(0).unwrap();
        body.write_u32::<LittleEndian>(0).unwrap();
        body
    }

    #[test]
    fn test_read_mixed_stream() {
        let mut stream = record(2, 0xabc, 100, &engineering_body(55));
        stream.extend(record(7, 0xabc, 150, &[1, 2, 3]));
        stream.extend(record(3, 0xdef, 200, &compressed_body(66)));
        stream.extend(record(2, 0xabc, 300, &engineering_body(77)));

        let hits: Vec<DecodedHit> = HitStreamReader::new(stream.as_slice())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert!(matches!(hits[0], DecodedHit::Engineering(_)));
        assert_eq!(hits[0].domclk(), 55);
        assert!(matches!(hits[1], DecodedHit::DeltaCompressed(_)));
        assert_eq!(hits[1].domclk(), 66);
        assert_eq!(hits[1].dom_id(), "000000000def");
        assert_eq!(hits[2].domclk(), 77);
    }

    #[test]
    fn test_hits_by_dom() {
        let mut stream = record(2, 0xabc, 100, &engineering_body(1));
        stream.extend(record(3, 0xdef, 200, &compressed_body(2)));
        stream.extend(record(2, 0xabc, 300, &engineering_body(3)));

        let mut reader = HitStreamReader::new(stream.as_slice());
        let (hits, failures) = reader.hits_by_dom(2).unwrap();
        assert_eq!(hits["000000000abc"].len(), 1);
        assert_eq!(hits["000000000def"].len(), 1);
        assert_eq!(failures, 0);
        let (rest, _) = reader.hits_by_dom(10).unwrap();
        assert_eq!(rest["000000000abc"][0].domclk(), 3);
    }

    #[test]
    fn test_truncated_and_bad_records() {
        let stream = record(2, 0xabc, 100, &engineering_body(1));
        let mut reader = HitStreamReader::new(&stream[..40]);
        assert!(matches!(
            reader.next_hit().unwrap_err(),
            HitStreamError::Truncated { offset: 0, length: 48 }
        ));

        let stream = record(2, 0xabc, 100, &[0u8; 4]);
        let mut reader = HitStreamReader::new(stream.as_slice());
        assert!(matches!(
            reader.next_hit().unwrap_err(),
            HitStreamError::BadHit(HitError::TooShort { .. })
        ));

        let mut iter = HitStreamReader::new(stream.as_slice());
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_bad_hit_does_not_end_the_stream() {
        let mut stream = record(2, 0xabc, 100, &engineering_body(1));
        stream.extend(record(2, 0xabc, 200, &[0u8; 4]));
        stream.extend(record(2, 0xdef, 300, &engineering_body(3)));

        let results: Vec<_> = HitStreamReader::new(stream.as_slice()).collect();
        assert_eq!(results.len(), 3);
        assert!(matches!(results[1], Err(HitStreamError::BadHit(_))));
        assert_eq!(results[2].as_ref().unwrap().domclk(), 3);

        let mut reader = HitStreamReader::new(stream.as_slice());
        let (hits, failures) = reader.hits_by_dom(10).unwrap();
        assert_eq!(failures, 1);
        assert_eq!(hits["000000000abc"].len(), 1);
        assert_eq!(hits["000000000def"][0].domclk(), 3);
    }
}
