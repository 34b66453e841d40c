use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::{Cursor, ErrorKind, Read};

use super::constants::*;
use super::error::PayloadError;
use super::payload::*;

/// Fill as much of `buf` as the reader can supply. Returns the number of bytes read,
/// which is less than the buffer only at end of stream.
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

type BodyCursor<'a> = Cursor<&'a [u8]>;

fn read_rest(cursor: &mut BodyCursor) -> Result<Vec<u8>, PayloadError> {
    let mut rest = Vec::new();
    cursor.read_to_end(&mut rest)?;
    Ok(rest)
}

fn read_bytes(cursor: &mut BodyCursor, count: usize) -> Result<Vec<u8>, PayloadError> {
    let mut data = vec![0u8; count];
    cursor.read_exact(&mut data)?;
    Ok(data)
}

fn read_interval(cursor: &mut BodyCursor) -> Result<Interval, PayloadError> {
    Ok((cursor.read_i64::<BigEndian>()?, cursor.read_i64::<BigEndian>()?))
}

/// The payload time shifted by `delta`, for records timed relative to their envelope
fn relative_time(envelope: &PayloadEnvelope, delta: i64, offset: u64) -> Result<i64, PayloadError> {
    envelope
        .utime
        .checked_add(delta)
        .ok_or(PayloadError::TimeOverflow {
            offset,
            payload_type: envelope.payload_type,
        })
}

/// PayloadReader decodes a stream of DAQ payloads one at a time.
///
/// The reader tracks its byte offset so that errors can point at the offending record.
/// Each payload body is read in full before it is decoded, so a malformed body never
/// leaves the stream mid-record and the next payload can still be read.
#[derive(Debug)]
pub struct PayloadReader<R: Read> {
    stream: R,
    offset: u64,
    depth: usize,
    aligned: bool,
}

impl<R: Read> PayloadReader<R> {
    pub fn new(stream: R) -> Self {
        Self::nested(stream, 0, 0)
    }

    fn nested(stream: R, offset: u64, depth: usize) -> Self {
        Self {
            stream,
            offset,
            depth,
            aligned: true,
        }
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// False once a framing error (short body, impossible length, IO failure) has left
    /// the stream somewhere other than the start of a payload
    pub fn is_aligned(&self) -> bool {
        self.aligned
    }

    pub fn into_inner(self) -> R {
        self.stream
    }

    /// Decode the next payload. A stream holding less than a full envelope is at its end.
    pub fn decode_payload(&mut self) -> Result<Option<Payload>, PayloadError> {
        let start = self.offset;
        let (envelope, body) = match self.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.aligned = false;
                return Err(e);
            }
        };
        let body_length = body.len();

        let body_offset = start + ENVELOPE_SIZE as u64;
        let mut cursor = Cursor::new(body.as_slice());
        let payload =
            decode_body(envelope, &mut cursor, body_offset, self.depth).map_err(|e| match e {
                PayloadError::IOError(io) if io.kind() == ErrorKind::UnexpectedEof => {
                    PayloadError::HeaderOverrun {
                        offset: start,
                        payload_type: envelope.payload_type,
                        length: envelope.length,
                    }
                }
                other => other,
            })?;

        let consumed = cursor.position() as usize;
        if consumed != body_length {
            return Err(PayloadError::LengthMismatch {
                offset: start,
                payload_type: envelope.payload_type,
                declared: envelope.length as usize,
                consumed: consumed + ENVELOPE_SIZE,
            });
        }
        Ok(Some(payload))
    }

    /// Read one envelope and the body it declares
    fn read_frame(&mut self) -> Result<Option<(PayloadEnvelope, Vec<u8>)>, PayloadError> {
        let start = self.offset;
        let mut raw_envelope = [0u8; ENVELOPE_SIZE];
        let got = read_full(&mut self.stream, &mut raw_envelope)?;
        self.offset += got as u64;
        if got < ENVELOPE_SIZE {
            return Ok(None);
        }
        let envelope = PayloadEnvelope {
            length: BigEndian::read_i32(&raw_envelope[0..4]),
            payload_type: BigEndian::read_i32(&raw_envelope[4..8]),
            utime: BigEndian::read_i64(&raw_envelope[8..16]),
        };
        if envelope.length < ENVELOPE_SIZE as i32 {
            return Err(PayloadError::BadLength {
                offset: start,
                payload_type: envelope.payload_type,
                length: envelope.length,
            });
        }

        let body_length = envelope.length as usize - ENVELOPE_SIZE;
        let mut body = Vec::new();
        (&mut self.stream)
            .take(body_length as u64)
            .read_to_end(&mut body)?;
        self.offset += body.len() as u64;
        if body.len() < body_length {
            return Err(PayloadError::Truncated {
                offset: start,
                payload_type: envelope.payload_type,
                length: envelope.length,
            });
        }
        Ok(Some((envelope, body)))
    }
}

/// Decode the next payload from a stream
pub fn decode_payload<R: Read>(stream: &mut R) -> Result<Option<Payload>, PayloadError> {
    PayloadReader::new(stream).decode_payload()
}

/// Lazy sequence of payloads.
///
/// A payload that fails to decode is yielded as an error and iteration goes on with the
/// next one. Iteration stops after a framing error, since the following record can no
/// longer be found.
#[derive(Debug)]
pub struct Payloads<R: Read> {
    reader: PayloadReader<R>,
    done: bool,
}

impl<R: Read> Payloads<R> {
    pub fn offset(&self) -> u64 {
        self.reader.offset()
    }

    pub fn is_aligned(&self) -> bool {
        self.reader.is_aligned()
    }
}

impl<R: Read> Iterator for Payloads<R> {
    type Item = Result<Payload, PayloadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.decode_payload() {
            Ok(Some(payload)) => Some(Ok(payload)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = !self.reader.is_aligned();
                Some(Err(e))
            }
        }
    }
}

impl<R: Read> std::iter::FusedIterator for Payloads<R> {}

pub fn read_payloads<R: Read>(stream: R) -> Payloads<R> {
    Payloads {
        reader: PayloadReader::new(stream),
        done: false,
    }
}

fn decode_body(
    envelope: PayloadEnvelope,
    cursor: &mut BodyCursor,
    body_offset: u64,
    depth: usize,
) -> Result<Payload, PayloadError> {
    let payload = match envelope.payload_type {
        TYPE_HIT_DATA => Payload::HitData(HitDataPayload {
            envelope,
            trigger_type: cursor.read_i32::<BigEndian>()?,
            trigger_cfg_id: cursor.read_i32::<BigEndian>()?,
            srcid: cursor.read_i32::<BigEndian>()?,
            mbid: cursor.read_u64::<BigEndian>()?,
            trigger_mode: cursor.read_i16::<BigEndian>()?,
        }),
        TYPE_DELTA_SENDER_HIT => decode_delta_sender_hit(envelope, cursor, body_offset)?,
        TYPE_MONITOR_RECORD => Payload::MonitorRecord(MonitorRecordPayload {
            envelope,
            mbid: cursor.read_u64::<BigEndian>()?,
            record: read_rest(cursor)?,
        }),
        TYPE_TRIGGER_REQUEST => Payload::TriggerRequest(decode_trigger_request(
            envelope,
            cursor,
            body_offset,
            depth,
        )?),
        TYPE_ENG_HIT_DATA => Payload::EngHitData(EngHitDataPayload {
            envelope,
            trigger_cfg_id: cursor.read_i32::<BigEndian>()?,
            srcid: cursor.read_i32::<BigEndian>()?,
            data_length: cursor.read_i32::<BigEndian>()?,
            format_id: cursor.read_i32::<BigEndian>()?,
            mbid: cursor.read_u64::<BigEndian>()?,
            utc: {
                cursor.read_u64::<BigEndian>()?;
                cursor.read_i64::<BigEndian>()?
            },
            data: read_rest(cursor)?,
        }),
        TYPE_READOUT_DATA => Payload::ReadoutData(ReadoutDataPayload {
            envelope,
            record_type: cursor.read_i16::<BigEndian>()?,
            uid: cursor.read_i32::<BigEndian>()?,
            index: cursor.read_i16::<BigEndian>()?,
            is_last: cursor.read_i16::<BigEndian>()?,
            srcid: cursor.read_i32::<BigEndian>()?,
            interval: read_interval(cursor)?,
            data: decode_composite(cursor, body_offset, depth)?,
        }),
        TYPE_EVENT_V2 | TYPE_EVENT_V3 | TYPE_EVENT_V4 => {
            Payload::Event(decode_event(envelope, cursor, body_offset, depth)?)
        }
        TYPE_EVENT_V5 => Payload::Event(decode_event_v5(envelope, cursor, body_offset)?),
        TYPE_SUPERNOVA => decode_supernova(envelope, cursor, body_offset)?,
        TYPE_DELTA_COMPRESSED_HIT => {
            cursor.set_position(DELTA_COMPRESSED_MBID_OFFSET as u64);
            Payload::DeltaCompressedHit(DeltaCompressedHitPayload {
                envelope,
                mbid: cursor.read_u64::<BigEndian>()?,
                order_check: cursor.read_i16::<BigEndian>()?,
                version: cursor.read_i16::<BigEndian>()?,
                pedestal: cursor.read_i16::<BigEndian>()?,
                data: read_rest(cursor)?,
            })
        }
        other => {
            log::debug!("Payload type {other} at offset {body_offset} is not decoded; keeping raw bytes");
            Payload::Opaque {
                envelope,
                data: read_rest(cursor)?,
            }
        }
    };
    Ok(payload)
}

/// Read a composite sub-envelope and its nested payloads. `depth` is the nesting level
/// of the payload holding the composite.
fn decode_composite(
    cursor: &mut BodyCursor,
    body_offset: u64,
    depth: usize,
) -> Result<Vec<Payload>, PayloadError> {
    let composite_offset = body_offset + cursor.position();
    if depth >= MAX_COMPOSITE_DEPTH {
        return Err(PayloadError::NestingTooDeep {
            offset: composite_offset,
        });
    }
    let declared_length = cursor.read_i32::<BigEndian>()?;
    let _composite_type = cursor.read_i16::<BigEndian>()?;
    let count = cursor.read_u16::<BigEndian>()? as usize;

    let nested_offset = body_offset + cursor.position();
    let mut reader = PayloadReader::nested(&mut *cursor, nested_offset, depth + 1);
    let mut payloads = Vec::with_capacity(count);
    for _ in 0..count {
        match reader.decode_payload()? {
            Some(payload) => payloads.push(payload),
            None => {
                return Err(PayloadError::CompositeCountMismatch {
                    offset: composite_offset,
                    declared: count,
                    found: payloads.len(),
                })
            }
        }
    }

    let consumed = (reader.offset() - composite_offset) as usize;
    if declared_length < 0 || consumed != declared_length as usize {
        return Err(PayloadError::CompositeLengthMismatch {
            offset: composite_offset,
            count,
            declared: declared_length.max(0) as usize,
            consumed,
        });
    }
    Ok(payloads)
}

fn decode_delta_sender_hit(
    envelope: PayloadEnvelope,
    cursor: &mut BodyCursor,
    body_offset: u64,
) -> Result<Payload, PayloadError> {
    cursor.read_u64::<BigEndian>()?;
    let utime = cursor.read_u64::<BigEndian>()?;
    let order_check = cursor.read_u16::<BigEndian>()?;
    if order_check != EXPECTED_ORDER_CHECK {
        return Err(PayloadError::BadOrderCheck {
            offset: body_offset - ENVELOPE_SIZE as u64,
            value: order_check,
        });
    }
    Ok(Payload::DeltaSenderHit(DeltaSenderHitPayload {
        envelope,
        mbid: envelope.utime as u64,
        utime,
        version: cursor.read_u16::<BigEndian>()?,
        pedestal: cursor.read_u16::<BigEndian>()?,
        domclk: cursor.read_u64::<BigEndian>()?,
        word0: cursor.read_u32::<BigEndian>()?,
        word2: cursor.read_u32::<BigEndian>()?,
        data: read_rest(cursor)?,
    }))
}

fn decode_trigger_request(
    envelope: PayloadEnvelope,
    cursor: &mut BodyCursor,
    body_offset: u64,
    depth: usize,
) -> Result<TriggerRequestPayload, PayloadError> {
    let record_type = cursor.read_i16::<BigEndian>()?;
    let uid = cursor.read_i32::<BigEndian>()?;
    let trigger_type = cursor.read_i32::<BigEndian>()?;
    let trigger_cfg_id = cursor.read_i32::<BigEndian>()?;
    let srcid = cursor.read_i32::<BigEndian>()?;
    let interval = read_interval(cursor)?;

    let request_type = cursor.read_i16::<BigEndian>()?;
    let trigger_uid = cursor.read_i32::<BigEndian>()?;
    let request_srcid = cursor.read_i32::<BigEndian>()?;
    let element_count = cursor.read_i32::<BigEndian>()?.max(0) as usize;
    let mut elements = Vec::new();
    for _ in 0..element_count {
        elements.push(ReadoutRequestElement {
            readout_type: cursor.read_i32::<BigEndian>()?,
            srcid: cursor.read_i32::<BigEndian>()?,
            interval: read_interval(cursor)?,
            mbid: cursor.read_i64::<BigEndian>()?,
        });
    }

    Ok(TriggerRequestPayload {
        envelope,
        record_type,
        uid,
        trigger_type,
        trigger_cfg_id,
        srcid,
        interval,
        readout_request: ReadoutRequest {
            request_type,
            trigger_uid,
            srcid: request_srcid,
            elements,
        },
        hits: decode_composite(cursor, body_offset, depth)?,
    })
}

fn decode_event(
    envelope: PayloadEnvelope,
    cursor: &mut BodyCursor,
    body_offset: u64,
    depth: usize,
) -> Result<EventPayload, PayloadError> {
    let record_type = cursor.read_i16::<BigEndian>()?;
    let uid = cursor.read_i32::<BigEndian>()?;
    let srcid = cursor.read_i32::<BigEndian>()?;
    let interval = read_interval(cursor)?;
    let h5 = cursor.read_i32::<BigEndian>()?;
    let h6 = cursor.read_i32::<BigEndian>()?;
    let h7 = cursor.read_i32::<BigEndian>()?;

    // The last three words were repurposed as the format evolved
    let (event_type, event_cfg_id, year, run_number, subrun_number) = match envelope.payload_type {
        TYPE_EVENT_V2 => (h5, h6, 0, h7, 0),
        TYPE_EVENT_V3 => (h5, 0, 0, h6, h7),
        _ => (0, 0, (h5 >> 16) & 0xffff, h6, h7),
    };

    let mut composite = decode_composite(cursor, body_offset, depth)?.into_iter();
    let trigger_request = composite.next().map(Box::new);
    Ok(EventPayload {
        envelope,
        record_type,
        uid,
        srcid,
        interval,
        event_type,
        event_cfg_id,
        year,
        run_number,
        subrun_number,
        trigger_request,
        readout_data: composite.collect(),
        hit_records: Vec::new(),
        trigger_records: Vec::new(),
    })
}

fn decode_event_v5(
    envelope: PayloadEnvelope,
    cursor: &mut BodyCursor,
    body_offset: u64,
) -> Result<EventPayload, PayloadError> {
    let interval_length = cursor.read_u32::<BigEndian>()?;
    let year = cursor.read_u16::<BigEndian>()?;
    let uid = cursor.read_u32::<BigEndian>()?;
    let run_number = cursor.read_u32::<BigEndian>()?;
    let subrun_number = cursor.read_u32::<BigEndian>()?;
    let hit_count = cursor.read_u32::<BigEndian>()?;

    // Trigger records index the hits of known kinds only
    let mut hit_records = Vec::new();
    for _ in 0..hit_count {
        let record_offset = body_offset + cursor.position();
        let record_length = cursor.read_u16::<BigEndian>()? as usize;
        let tag = cursor.read_u8()?;
        let flags = cursor.read_u8()?;
        let channel_id = cursor.read_u16::<BigEndian>()?;
        let time_offset = cursor.read_u32::<BigEndian>()?;
        if record_length < EVENT_V5_HIT_RECORD_HEADER_SIZE {
            return Err(PayloadError::BadLength {
                offset: record_offset,
                payload_type: envelope.payload_type,
                length: record_length as i32,
            });
        }
        let data = read_bytes(cursor, record_length - EVENT_V5_HIT_RECORD_HEADER_SIZE)?;
        let Some(kind) = HitRecordKind::from_tag(tag) else {
            log::debug!("Dropping hit record of kind {tag} at offset {record_offset}");
            continue;
        };
        hit_records.push(HitRecord {
            kind,
            flags,
            channel_id,
            utime: relative_time(&envelope, time_offset as i64, record_offset)?,
            data,
        });
    }

    let trigger_count = cursor.read_u32::<BigEndian>()?;
    let mut trigger_records = Vec::new();
    for _ in 0..trigger_count {
        let record_offset = body_offset + cursor.position();
        let trigger_type = cursor.read_i32::<BigEndian>()?;
        let trigger_cfg_id = cursor.read_i32::<BigEndian>()?;
        let srcid = cursor.read_u32::<BigEndian>()?;
        let first = cursor.read_u32::<BigEndian>()? as i64;
        let last = cursor.read_u32::<BigEndian>()? as i64;
        let index_count = cursor.read_u32::<BigEndian>()?;
        let mut hit_indices = Vec::new();
        for _ in 0..index_count {
            let index = cursor.read_u32::<BigEndian>()?;
            if index as usize >= hit_records.len() {
                return Err(PayloadError::BadHitIndex {
                    offset: record_offset,
                    index,
                    count: hit_records.len(),
                });
            }
            hit_indices.push(index);
        }
        trigger_records.push(TriggerRecord {
            trigger_type,
            trigger_cfg_id,
            srcid,
            interval: (
                relative_time(&envelope, first, record_offset)?,
                relative_time(&envelope, last, record_offset)?,
            ),
            hit_indices,
        });
    }

    let event_end = relative_time(&envelope, interval_length as i64, body_offset)?;
    Ok(EventPayload {
        envelope,
        record_type: 0,
        uid: uid as i32,
        srcid: 0,
        interval: (envelope.utime, event_end),
        event_type: 0,
        event_cfg_id: 0,
        year: year as i32,
        run_number: run_number as i32,
        subrun_number: subrun_number as i32,
        trigger_request: None,
        readout_data: Vec::new(),
        hit_records,
        trigger_records,
    })
}

fn decode_supernova(
    envelope: PayloadEnvelope,
    cursor: &mut BodyCursor,
    body_offset: u64,
) -> Result<Payload, PayloadError> {
    let mbid = cursor.read_u64::<BigEndian>()?;
    let record_length = cursor.read_i16::<BigEndian>()?;
    let format_id = cursor.read_i16::<BigEndian>()?;
    let domclk = cursor.read_u48::<BigEndian>()? as i64;
    let scalers = read_rest(cursor)?;
    (scalers.len() as i64)
        .checked_mul(SUPERNOVA_BIN_WIDTH)
        .and_then(|width| envelope.utime.checked_add(width))
        .ok_or(PayloadError::TimeOverflow {
            offset: body_offset - ENVELOPE_SIZE as u64,
            payload_type: envelope.payload_type,
        })?;
    let expected = record_length as i64 - SUPERNOVA_HEADER_SIZE as i64;
    if scalers.len() as i64 != expected {
        return Err(PayloadError::LengthMismatch {
            offset: body_offset - ENVELOPE_SIZE as u64,
            payload_type: envelope.payload_type,
            declared: record_length.max(0) as usize,
            consumed: scalers.len() + SUPERNOVA_HEADER_SIZE,
        });
    }
    Ok(Payload::Supernova(SupernovaPayload {
        envelope,
        mbid,
        record_length,
        format_id,
        domclk,
        scalers,
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::HitError;
    use crate::hits::DomHit;
    use byteorder::WriteBytesExt;

    pub(crate) fn envelope(buf: &mut Vec<u8>, length: usize, payload_type: i32, utime: i64) {
        buf.write_i32::<BigEndian>(length as i32).unwrap();
        buf.write_i32::<BigEndian>(payload_type).unwrap();
        buf.write_i64::<BigEndian>(utime).unwrap();
    }

    pub(crate) fn hit_data(utime: i64, srcid: i32, mbid: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        envelope(&mut buf, ENVELOPE_SIZE + HIT_DATA_HEADER_SIZE, TYPE_HIT_DATA, utime);
        buf.write_i32::<BigEndian>(2).unwrap();
        buf.write_i32::<BigEndian>(-1).unwrap();
        buf.write_i32::<BigEndian>(srcid).unwrap();
        buf.write_u64::<BigEndian>(mbid).unwrap();
        buf.write_i16::<BigEndian>(3).unwrap();
        buf
    }

    pub(crate) fn composite(payloads: &[Vec<u8>]) -> Vec<u8> {
        let total: usize = payloads.iter().map(|p| p.len()).sum();
        let mut buf = Vec::new();
        buf.write_i32::<BigEndian>((COMPOSITE_ENVELOPE_SIZE + total) as i32).unwrap();
        buf.write_i16::<BigEndian>(1).unwrap();
        buf.write_u16::<BigEndian>(payloads.len() as u16).unwrap();
        for payload in payloads {
            buf.extend_from_slice(payload);
        }
        buf
    }

    pub(crate) fn trigger_request(uid: i32, trigger_type: i32, srcid: i32, hits: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_i16::<BigEndian>(0).unwrap();
        body.write_i32::<BigEndian>(uid).unwrap();
        body.write_i32::<BigEndian>(trigger_type).unwrap();
        body.write_i32::<BigEndian>(-1).unwrap();
        body.write_i32::<BigEndian>(srcid).unwrap();
        body.write_i64::<BigEndian>(100).unwrap();
        body.write_i64::<BigEndian>(200).unwrap();
        // readout request with one element
        body.write_i16::<BigEndian>(0).unwrap();
        body.write_i32::<BigEndian>(uid).unwrap();
        body.write_i32::<BigEndian>(srcid).unwrap();
        body.write_i32::<BigEndian>(1).unwrap();
        body.write_i32::<BigEndian>(0).unwrap();
        body.write_i32::<BigEndian>(-1).unwrap();
        body.write_i64::<BigEndian>(100).unwrap();
        body.write_i64::<BigEndian>(200).unwrap();
        body.write_i64::<BigEndian>(-1).unwrap();
        body.extend(composite(hits));

        let mut buf = Vec::new();
        envelope(&mut buf, ENVELOPE_SIZE + body.len(), TYPE_TRIGGER_REQUEST, 100);
        buf.extend(body);
        buf
    }

    #[test]
    fn test_empty_stream() {
        let mut stream: &[u8] = &[];
        assert!(decode_payload(&mut stream).unwrap().is_none());

        // a partial envelope is also the end
        let mut short: &[u8] = &[0, 0, 0, 38, 0, 0];
        assert!(decode_payload(&mut short).unwrap().is_none());
    }

    #[test]
    fn test_hit_data() {
        let buf = hit_data(1000, 4000, 0x1234_5678_9abc);
        assert_eq!(buf.len(), 38);
        let mut reader = PayloadReader::new(buf.as_slice());
        let payload = reader.decode_payload().unwrap().unwrap();
        assert_eq!(payload.length(), 38);
        assert_eq!(payload.utime(), 1000);
        let Payload::HitData(hit) = &payload else {
            panic!("expected HitData, got {payload:?}");
        };
        assert_eq!(hit.srcid, 4000);
        assert_eq!(hit.mbid, 0x1234_5678_9abc);
        assert_eq!(hit.trigger_type, 2);
        assert_eq!(hit.trigger_mode, 3);
        assert_eq!(reader.offset(), 38);
        assert!(reader.decode_payload().unwrap().is_none());
        assert_eq!(
            payload.to_string(),
            "HitData[inIceTrig @ 1000: trigger 2/-1 mode 3 dom 123456789abc]"
        );
    }

    #[test]
    fn test_trigger_request_nested_hits() {
        let hits: Vec<Vec<u8>> = (0..3).map(|i| hit_data(1000 + i, 12001, 0xabc + i as u64)).collect();
        let mut stream = trigger_request(7, 0, 4000, &hits);
        let first_length = stream.len();
        stream.extend(hit_data(5000, 4000, 1));

        let mut reader = PayloadReader::new(stream.as_slice());
        let payload = reader.decode_payload().unwrap().unwrap();
        assert_eq!(reader.offset(), first_length as u64);
        let Payload::TriggerRequest(request) = payload else {
            panic!("expected a TriggerRequest");
        };
        assert_eq!(request.uid, 7);
        assert_eq!(request.interval, (100, 200));
        assert_eq!(request.readout_request.elements.len(), 1);
        assert_eq!(request.hits.len(), 3);
        assert_eq!(request.hit_data()[2].mbid, 0xabc + 2);

        // the cursor sits on the following record
        let next = reader.decode_payload().unwrap().unwrap();
        assert_eq!(next.utime(), 5000);
    }

    #[test]
    fn test_merged_trigger_request() {
        let inner_a = trigger_request(1, 0, 4000, &[hit_data(1, 12001, 1)]);
        let inner_b = trigger_request(2, 3, 4000, &[hit_data(2, 12002, 2), hit_data(3, 12002, 3)]);
        let outer = trigger_request(3, -1, 6000, &[inner_a, inner_b]);
        let payload = decode_payload(&mut outer.as_slice()).unwrap().unwrap();
        let Payload::TriggerRequest(request) = payload else {
            panic!("expected a TriggerRequest");
        };
        assert_eq!(
            request.triggers(),
            vec![(6000, -1, -1), (4000, 0, -1), (4000, 3, -1)]
        );
        assert_eq!(request.hit_data().len(), 3);
    }

    #[test]
    fn test_unknown_type_is_opaque() {
        let mut buf = Vec::new();
        envelope(&mut buf, ENVELOPE_SIZE + 5, 99, 42);
        buf.extend_from_slice(&[1, 2, 3, 4, 5]);
        let payload = decode_payload(&mut buf.as_slice()).unwrap().unwrap();
        assert_eq!(
            payload,
            Payload::Opaque {
                envelope: PayloadEnvelope {
                    length: 21,
                    payload_type: 99,
                    utime: 42
                },
                data: vec![1, 2, 3, 4, 5],
            }
        );
        assert_eq!(payload.to_string(), "Payload#99[@42, 21 bytes]");
    }

    pub(crate) fn delta_sender_hit(order_check: u16) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_u64::<BigEndian>(0).unwrap();
        body.write_u64::<BigEndian>(123_456).unwrap();
        body.write_u16::<BigEndian>(order_check).unwrap();
        body.write_u16::<BigEndian>(2).unwrap();
        body.write_u16::<BigEndian>(0).unwrap();
        body.write_u64::<BigEndian>(0x1234).unwrap();
        body.write_u32::<BigEndian>(0x8000).unwrap();
        body.write_u32::<BigEndian>(0).unwrap();
        body.extend_from_slice(&[9, 9]);
        let mut buf = Vec::new();
        envelope(&mut buf, ENVELOPE_SIZE + body.len(), TYPE_DELTA_SENDER_HIT, 0xabcdef);
        buf.extend(body);
        buf
    }

    #[test]
    fn test_delta_sender_hit() {
        let buf = delta_sender_hit(1);
        let payload = decode_payload(&mut buf.as_slice()).unwrap().unwrap();
        let Payload::DeltaSenderHit(hit) = payload else {
            panic!("expected a DeltaSenderHit");
        };
        assert_eq!(hit.mbid, 0xabcdef);
        assert_eq!(hit.utime, 123_456);
        assert_eq!(hit.domclk, 0x1234);
        assert_eq!(hit.data, vec![9, 9]);
    }

    #[test]
    fn test_bad_order_check() {
        let mut stream = hit_data(1, 4000, 1);
        stream.extend(delta_sender_hit(256));
        stream.extend(hit_data(2, 4000, 2));
        let mut payloads = read_payloads(stream.as_slice());
        let results: Vec<_> = payloads.by_ref().collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(PayloadError::BadOrderCheck {
                offset: 38,
                value: 256
            })
        ));
        // only the bad record is lost
        assert_eq!(results[2].as_ref().unwrap().utime(), 2);
        assert!(payloads.is_aligned());
    }

    #[test]
    fn test_framing_error_ends_iteration() {
        let mut stream = hit_data(1, 4000, 1);
        envelope(&mut stream, 4, TYPE_HIT_DATA, 2);
        stream.extend(hit_data(3, 4000, 3));
        let mut payloads = read_payloads(stream.as_slice());
        let results: Vec<_> = payloads.by_ref().collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[1],
            Err(PayloadError::BadLength {
                offset: 38,
                length: 4,
                ..
            })
        ));
        assert!(!payloads.is_aligned());
        assert!(payloads.next().is_none());
    }

    fn nested_trigger_requests(levels: i32) -> Vec<u8> {
        let mut payload = hit_data(1, 12001, 0xabc);
        for uid in 0..levels {
            payload = trigger_request(uid, 0, 4000, &[payload]);
        }
        payload
    }

    #[test]
    fn test_composite_nesting_limit() {
        let deepest = nested_trigger_requests(MAX_COMPOSITE_DEPTH as i32);
        let payload = decode_payload(&mut deepest.as_slice()).unwrap().unwrap();
        let Payload::TriggerRequest(request) = payload else {
            panic!("expected a TriggerRequest");
        };
        assert_eq!(request.hit_data().len(), 1);

        let mut stream = nested_trigger_requests(MAX_COMPOSITE_DEPTH as i32 + 1);
        stream.extend(hit_data(5, 4000, 5));
        let results: Vec<_> = read_payloads(stream.as_slice()).collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[0],
            Err(PayloadError::NestingTooDeep { .. })
        ));
        assert_eq!(results[1].as_ref().unwrap().utime(), 5);
    }

    #[test]
    fn test_truncated_record() {
        let buf = hit_data(1, 4000, 1);
        let err = decode_payload(&mut &buf[..30]).unwrap_err();
        assert!(matches!(
            err,
            PayloadError::Truncated {
                offset: 0,
                payload_type: TYPE_HIT_DATA,
                length: 38
            }
        ));
    }

    #[test]
    fn test_bad_length() {
        let mut buf = Vec::new();
        envelope(&mut buf, 8, TYPE_HIT_DATA, 0);
        assert!(matches!(
            decode_payload(&mut buf.as_slice()).unwrap_err(),
            PayloadError::BadLength { length: 8, .. }
        ));
    }

    #[test]
    fn test_length_mismatch_and_overrun() {
        // two bytes longer than the HitData layout
        let mut long = hit_data(1, 4000, 1);
        long[3] = 40;
        long.extend_from_slice(&[0, 0]);
        assert!(matches!(
            decode_payload(&mut long.as_slice()).unwrap_err(),
            PayloadError::LengthMismatch {
                declared: 40,
                consumed: 38,
                ..
            }
        ));

        // shorter than the HitData layout
        let mut short = hit_data(1, 4000, 1);
        short[3] = 30;
        short.truncate(30);
        assert!(matches!(
            decode_payload(&mut short.as_slice()).unwrap_err(),
            PayloadError::HeaderOverrun { length: 30, .. }
        ));
    }

    #[test]
    fn test_composite_count_mismatch() {
        let mut stream = trigger_request(7, 0, 4000, &[hit_data(1, 12001, 1)]);
        // claim two nested payloads where there is one; the composite count is the
        // last field before the nested hit
        let count_pos = stream.len() - 38 - 2;
        stream[count_pos + 1] = 2;
        assert!(matches!(
            decode_payload(&mut stream.as_slice()).unwrap_err(),
            PayloadError::CompositeCountMismatch {
                declared: 2,
                found: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_composite_length_mismatch() {
        let mut stream = trigger_request(7, 0, 4000, &[hit_data(1, 12001, 1)]);
        let length_pos = stream.len() - 38 - 8;
        stream[length_pos + 3] += 4;
        assert!(matches!(
            decode_payload(&mut stream.as_slice()).unwrap_err(),
            PayloadError::CompositeLengthMismatch {
                declared: 50,
                consumed: 46,
                ..
            }
        ));
    }

    pub(crate) fn readout_data(uid: i32, payloads: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_i16::<BigEndian>(0).unwrap();
        body.write_i32::<BigEndian>(uid).unwrap();
        body.write_i16::<BigEndian>(0).unwrap();
        body.write_i16::<BigEndian>(1).unwrap();
        body.write_i32::<BigEndian>(12001).unwrap();
        body.write_i64::<BigEndian>(100).unwrap();
        body.write_i64::<BigEndian>(200).unwrap();
        body.extend(composite(payloads));
        let mut buf = Vec::new();
        envelope(&mut buf, ENVELOPE_SIZE + body.len(), TYPE_READOUT_DATA, 100);
        buf.extend(body);
        buf
    }

    pub(crate) fn eng_hit(utime: i64, mbid: u64, domclk: i64) -> Vec<u8> {
        // engineering record with 2 FADC samples and no ATWD
        let mut record = Vec::new();
        record.write_u16::<BigEndian>(20).unwrap();
        record.write_u16::<BigEndian>(2).unwrap();
        record.extend_from_slice(&[0, 2, 0, 0, 1, 0]);
        record.write_u48::<BigEndian>(domclk as u64).unwrap();
        record.write_u16::<BigEndian>(11).unwrap();
        record.write_u16::<BigEndian>(12).unwrap();

        let mut body = Vec::new();
        body.write_i32::<BigEndian>(0).unwrap();
        body.write_i32::<BigEndian>(12001).unwrap();
        body.write_i32::<BigEndian>(record.len() as i32).unwrap();
        body.write_i32::<BigEndian>(2).unwrap();
        body.write_u64::<BigEndian>(mbid).unwrap();
        body.write_u64::<BigEndian>(0).unwrap();
        body.write_i64::<BigEndian>(utime).unwrap();
        body.extend(record);
        let mut buf = Vec::new();
        envelope(&mut buf, ENVELOPE_SIZE + body.len(), TYPE_ENG_HIT_DATA, utime);
        buf.extend(body);
        buf
    }

    /// Version-4 event of run 110000.3 in 2007; the first payload is the trigger request
    pub(crate) fn event_v4(utime: i64, uid: i32, payloads: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_i16::<BigEndian>(0).unwrap();
        body.write_i32::<BigEndian>(uid).unwrap();
        body.write_i32::<BigEndian>(7000).unwrap();
        body.write_i64::<BigEndian>(utime).unwrap();
        body.write_i64::<BigEndian>(utime + 100).unwrap();
        body.write_i32::<BigEndian>(2007 << 16).unwrap();
        body.write_i32::<BigEndian>(110_000).unwrap();
        body.write_i32::<BigEndian>(3).unwrap();
        body.extend(composite(payloads));
        let mut buf = Vec::new();
        envelope(&mut buf, ENVELOPE_SIZE + body.len(), TYPE_EVENT_V4, utime);
        buf.extend(body);
        buf
    }

    #[test]
    fn test_event_v4() {
        let request = trigger_request(9, 2, 6000, &[trigger_request(8, 0, 4000, &[])]);
        let readout = readout_data(9, &[eng_hit(150, 0xabc, 777), eng_hit(160, 0xdef, 778)]);
        let buf = event_v4(100, 9, &[request, readout]);

        let payload = decode_payload(&mut buf.as_slice()).unwrap().unwrap();
        let event = payload.as_event().unwrap();
        assert_eq!(event.year, 2007);
        assert_eq!(event.run_number, 110_000);
        assert_eq!(event.subrun_number, 3);
        assert_eq!(event.readout_data.len(), 1);
        assert_eq!(event.triggers(), vec![(6000, 2, -1), (4000, 0, -1)]);

        let hits: Vec<_> = event.hits().collect::<Result<_, _>>().unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].dom_id(), "000000000abc");
        assert_eq!(hits[1].domclk(), 778);
        assert!(hits[0].is_beacon());

        let (stack, failures) = hit_stack([event]);
        assert_eq!(stack.len(), 2);
        assert_eq!(stack["000000000def"].len(), 1);
        assert_eq!(failures, 0);
    }

    #[test]
    fn test_bad_hit_keeps_the_rest_of_the_event() {
        // the middle hit is shorter than the compressed-hit prefix
        let readout = readout_data(
            4,
            &[
                eng_hit(150, 0xabc, 777),
                delta_compressed_hit(155, 0x123, &[0u8; 4]),
                eng_hit(160, 0xdef, 778),
            ],
        );
        let buf = event_v4(100, 4, &[trigger_request(4, 0, 4000, &[]), readout]);
        let payload = decode_payload(&mut buf.as_slice()).unwrap().unwrap();
        let event = payload.as_event().unwrap();

        let hits: Vec<_> = event.hits().collect();
        assert_eq!(hits.len(), 3);
        assert!(hits[0].is_ok());
        assert_eq!(
            hits[1].as_ref().unwrap_err(),
            &HitError::TooShort {
                needed: SLC_PREFIX_SIZE,
                actual: 4
            }
        );
        assert!(hits[2].is_ok());

        let (stack, failures) = hit_stack([event]);
        assert_eq!(failures, 1);
        assert_eq!(stack.len(), 2);
        assert!(!stack.contains_key("000000000123"));
    }

    /// Version-5 event with one hit record per (kind, time offset) and one trigger
    /// record pointing at `trigger_index`
    fn event_v5_records(utime: i64, hits: &[(u8, u32)], trigger_index: u32) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_u32::<BigEndian>(5000).unwrap();
        body.write_u16::<BigEndian>(2008).unwrap();
        body.write_u32::<BigEndian>(44).unwrap();
        body.write_u32::<BigEndian>(111_000).unwrap();
        body.write_u32::<BigEndian>(2).unwrap();
        body.write_u32::<BigEndian>(hits.len() as u32).unwrap();
        for &(kind, offset) in hits {
            body.write_u16::<BigEndian>(14).unwrap();
            body.write_u8(kind).unwrap();
            body.write_u8(0).unwrap();
            body.write_u16::<BigEndian>(5).unwrap();
            body.write_u32::<BigEndian>(offset).unwrap();
            body.write_u32::<BigEndian>(0xdead_beef).unwrap();
        }
        body.write_u32::<BigEndian>(1).unwrap();
        body.write_i32::<BigEndian>(0).unwrap();
        body.write_i32::<BigEndian>(-1).unwrap();
        body.write_u32::<BigEndian>(4000).unwrap();
        body.write_u32::<BigEndian>(5).unwrap();
        body.write_u32::<BigEndian>(25).unwrap();
        body.write_u32::<BigEndian>(1).unwrap();
        body.write_u32::<BigEndian>(trigger_index).unwrap();
        let mut buf = Vec::new();
        envelope(&mut buf, ENVELOPE_SIZE + body.len(), TYPE_EVENT_V5, utime);
        buf.extend(body);
        buf
    }

    fn event_v5(trigger_index: u32) -> Vec<u8> {
        event_v5_records(1_000_000, &[(1, 10), (0, 20)], trigger_index)
    }

    #[test]
    fn test_event_v5() {
        let buf = event_v5(1);
        let payload = decode_payload(&mut buf.as_slice()).unwrap().unwrap();
        let event = payload.as_event().unwrap();
        assert!(event.is_v5());
        assert_eq!(event.interval, (1_000_000, 1_005_000));
        assert_eq!(event.year, 2008);
        assert_eq!(event.uid, 44);
        assert_eq!(event.run_number, 111_000);
        assert_eq!(event.subrun_number, 2);
        assert_eq!(event.hit_records.len(), 2);
        assert_eq!(event.hit_records[0].kind, HitRecordKind::DeltaCompressed);
        assert_eq!(event.hit_records[1].utime, 1_000_020);
        assert_eq!(event.hit_records[1].data.len(), 4);

        let record = &event.trigger_records[0];
        assert_eq!(record.interval, (1_000_005, 1_000_025));
        let referenced: Vec<_> = event.trigger_record_hits(record).collect();
        assert_eq!(referenced.len(), 1);
        assert_eq!(referenced[0].kind, HitRecordKind::Engineering);
        assert_eq!(event.triggers(), vec![(4000, 0, -1)]);
    }

    #[test]
    fn test_event_v5_drops_unknown_hit_kinds() {
        // the kind 7 record is skipped, so index 1 names the engineering hit
        let buf = event_v5_records(1_000_000, &[(1, 10), (7, 15), (0, 20)], 1);
        let payload = decode_payload(&mut buf.as_slice()).unwrap().unwrap();
        let event = payload.as_event().unwrap();
        assert_eq!(event.hit_records.len(), 2);
        let referenced: Vec<_> = event
            .trigger_record_hits(&event.trigger_records[0])
            .collect();
        assert_eq!(referenced[0].kind, HitRecordKind::Engineering);
        assert_eq!(referenced[0].utime, 1_000_020);
    }

    #[test]
    fn test_event_v5_time_overflow() {
        let buf = event_v5_records(i64::MAX - 5, &[(1, 10)], 0);
        assert!(matches!(
            decode_payload(&mut buf.as_slice()).unwrap_err(),
            PayloadError::TimeOverflow {
                payload_type: TYPE_EVENT_V5,
                ..
            }
        ));
    }

    #[test]
    fn test_event_v5_bad_hit_index() {
        let buf = event_v5(2);
        assert!(matches!(
            decode_payload(&mut buf.as_slice()).unwrap_err(),
            PayloadError::BadHitIndex {
                index: 2,
                count: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_supernova() {
        let mut body = Vec::new();
        body.write_u64::<BigEndian>(0xabc).unwrap();
        body.write_i16::<BigEndian>(14).unwrap();
        body.write_i16::<BigEndian>(300).unwrap();
        body.write_u48::<BigEndian>(99).unwrap();
        body.extend_from_slice(&[1, 0, 2, 0]);
        let mut buf = Vec::new();
        envelope(&mut buf, ENVELOPE_SIZE + body.len(), TYPE_SUPERNOVA, 1000);
        buf.extend(body);

        let payload = decode_payload(&mut buf.as_slice()).unwrap().unwrap();
        let Payload::Supernova(sn) = payload else {
            panic!("expected a Supernova payload");
        };
        assert_eq!(sn.domclk, 99);
        assert_eq!(sn.scalers, vec![1, 0, 2, 0]);
        assert_eq!(sn.utc_end(), 1000 + 4 * SUPERNOVA_BIN_WIDTH);

        // a window ending past the representable time is rejected
        buf[8..16].copy_from_slice(&i64::MAX.to_be_bytes());
        assert!(matches!(
            decode_payload(&mut buf.as_slice()).unwrap_err(),
            PayloadError::TimeOverflow {
                offset: 0,
                payload_type: TYPE_SUPERNOVA
            }
        ));
    }

    /// Delta-compressed hit payload wrapping the given record bytes
    pub(crate) fn delta_compressed_hit(utime: i64, mbid: u64, record: &[u8]) -> Vec<u8> {
        let mut body = vec![0u8; DELTA_COMPRESSED_MBID_OFFSET];
        body.write_u64::<BigEndian>(mbid).unwrap();
        body.write_i16::<BigEndian>(1).unwrap();
        body.write_i16::<BigEndian>(1).unwrap();
        body.write_i16::<BigEndian>(0).unwrap();
        body.extend_from_slice(record);
        let mut buf = Vec::new();
        envelope(&mut buf, ENVELOPE_SIZE + body.len(), TYPE_DELTA_COMPRESSED_HIT, utime);
        buf.extend(body);
        buf
    }

    #[test]
    fn test_delta_compressed_hit_payload() {
        let mut record = Vec::new();
        record.write_i64::<BigEndian>(4242).unwrap();
        record.write_u32::<BigEndian>(0).unwrap();
        record.write_u32::<BigEndian>(0).unwrap();
        let buf = delta_compressed_hit(7, 0x1234_5678_9abc, &record);

        let payload = decode_payload(&mut buf.as_slice()).unwrap().unwrap();
        let Payload::DeltaCompressedHit(hit) = payload else {
            panic!("expected a DeltaCompressedHit payload");
        };
        assert_eq!(hit.data.len(), 16);
        let decoded = hit.hit().unwrap();
        assert_eq!(decoded.domclk(), 4242);
        assert_eq!(decoded.dom_id(), "123456789abc");
    }

    #[test]
    fn test_read_payloads_sequence() {
        let mut stream = Vec::new();
        for idx in 0..4 {
            stream.extend(hit_data(idx, 4000, 1));
        }
        let times: Vec<i64> = read_payloads(stream.as_slice())
            .map(|p| p.unwrap().utime())
            .collect();
        assert_eq!(times, vec![0, 1, 2, 3]);
    }
}
