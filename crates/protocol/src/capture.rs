//! Capture file format
//!
//! The engine can record every client-facing call and every slot state
//! transition into a capture file for offline analysis. Records are
//! serialized with postcard and framed so that a reader can walk the file
//! without an index:
//!
//! ```text
//! [Length: u32 (big-endian)][CRC32: u32 (big-endian)][Record bytes (postcard)]
//! ```
//!
//! Maximum payload size is 64 KiB; no single record comes close since packet
//! payloads are bounded by one page.

use crate::error::{ProtocolError, Result};
use crate::integrity::{compute_checksum, verify_checksum};
use crate::types::{ClientProcess, ControlSetup, SlotId, SlotState, TransferReport};
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};

/// Maximum allowed payload size of one frame
pub const MAX_CAPTURE_PAYLOAD: usize = 64 * 1024;

/// Length prefix plus checksum
pub const FRAME_HEADER_LEN: usize = 8;

/// One captured event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRecord {
    /// Microseconds since the recorder was created
    pub elapsed_us: u64,
    /// Slot the event belongs to
    pub slot: SlotId,
    pub call: CapturedCall,
}

/// What happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapturedCall {
    /// A client acquired the slot
    Opened { client: ClientProcess },
    /// The client asked to close the slot
    CloseRequested,
    /// The dispatcher finished tearing the slot down
    Released,
    StateChanged { from: SlotState, to: SlotState },
    /// A client control transfer and its answer
    ControlTransfer {
        setup: ControlSetup,
        report: TransferReport,
        /// Answered from the control cache rather than hardware
        replayed: bool,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    ReadPacket {
        report: TransferReport,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    WritePacket {
        report: TransferReport,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
}

/// Encode a record into one frame
pub fn encode_frame(record: &CaptureRecord) -> Result<Bytes> {
    let payload = postcard::to_allocvec(record)?;
    if payload.len() > MAX_CAPTURE_PAYLOAD {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_CAPTURE_PAYLOAD,
        });
    }

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.put_u32(compute_checksum(&payload));
    frame.put_slice(&payload);
    Ok(frame.freeze())
}

/// Decode the frame at the start of `frame`
///
/// Returns the record and the number of bytes consumed.
pub fn decode_frame(frame: &[u8]) -> Result<(CaptureRecord, usize)> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(ProtocolError::IncompleteFrame {
            expected: FRAME_HEADER_LEN,
            actual: frame.len(),
        });
    }

    let length = BigEndian::read_u32(&frame[0..4]) as usize;
    let stored = BigEndian::read_u32(&frame[4..8]);
    if length > MAX_CAPTURE_PAYLOAD {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_CAPTURE_PAYLOAD,
        });
    }
    if frame.len() < FRAME_HEADER_LEN + length {
        return Err(ProtocolError::IncompleteFrame {
            expected: FRAME_HEADER_LEN + length,
            actual: frame.len(),
        });
    }

    let payload = &frame[FRAME_HEADER_LEN..FRAME_HEADER_LEN + length];
    let record = decode_payload(payload, stored)?;
    Ok((record, FRAME_HEADER_LEN + length))
}

/// Write one framed record
pub fn write_frame<W: Write>(writer: &mut W, record: &CaptureRecord) -> Result<()> {
    let frame = encode_frame(record)?;
    writer.write_all(&frame)?;
    Ok(())
}

/// Read one framed record
///
/// Returns `Ok(None)` at a clean end of stream. A stream that ends inside a
/// frame is an [`ProtocolError::IncompleteFrame`].
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<CaptureRecord>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let got = fill(reader, &mut header)?;
    if got == 0 {
        return Ok(None);
    }
    if got < FRAME_HEADER_LEN {
        return Err(ProtocolError::IncompleteFrame {
            expected: FRAME_HEADER_LEN,
            actual: got,
        });
    }

    let length = BigEndian::read_u32(&header[0..4]) as usize;
    let stored = BigEndian::read_u32(&header[4..8]);
    if length > MAX_CAPTURE_PAYLOAD {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_CAPTURE_PAYLOAD,
        });
    }

    let mut payload = vec![0u8; length];
    let got = fill(reader, &mut payload)?;
    if got < length {
        return Err(ProtocolError::IncompleteFrame {
            expected: length,
            actual: got,
        });
    }

    decode_payload(&payload, stored).map(Some)
}

/// Iterator over the records of a capture stream
pub struct CaptureReader<R> {
    reader: R,
    failed: bool,
}

impl<R: Read> CaptureReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            failed: false,
        }
    }
}

impl<R: Read> Iterator for CaptureReader<R> {
    type Item = Result<CaptureRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match read_frame(&mut self.reader) {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => {
                // Framing is lost after a bad frame
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

fn decode_payload(payload: &[u8], stored: u32) -> Result<CaptureRecord> {
    if !verify_checksum(payload, stored) {
        return Err(ProtocolError::ChecksumMismatch {
            stored,
            computed: compute_checksum(payload),
        });
    }
    Ok(postcard::from_bytes(payload)?)
}

/// Read until `buf` is full or the stream ends
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{XferId, XferStatus};
    use std::io::Cursor;

    fn read_record(slot: u32, data: &[u8]) -> CaptureRecord {
        CaptureRecord {
            elapsed_us: 1_500,
            slot: SlotId(slot),
            call: CapturedCall::ReadPacket {
                report: TransferReport {
                    xfer_id: XferId(3),
                    status: XferStatus::SUCCESS,
                    requested_size: 0x25,
                    transferred_size: data.len() as u32,
                },
                data: data.to_vec(),
            },
        }
    }

    #[test]
    fn test_frame_header_layout() {
        let record = read_record(1, &[0x21; 0x25]);
        let frame = encode_frame(&record).unwrap();

        let length = BigEndian::read_u32(&frame[0..4]) as usize;
        assert_eq!(length, frame.len() - FRAME_HEADER_LEN);
        assert_eq!(
            BigEndian::read_u32(&frame[4..8]),
            compute_checksum(&frame[FRAME_HEADER_LEN..])
        );
    }

    #[test]
    fn test_corrupted_payload_rejected() {
        let record = read_record(0, &[0x21; 0x25]);
        let mut frame = encode_frame(&record).unwrap().to_vec();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        match decode_frame(&frame) {
            Err(ProtocolError::ChecksumMismatch { .. }) => {}
            other => panic!("expected checksum mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_frame() {
        let record = read_record(0, &[0x21; 0x25]);
        let frame = encode_frame(&record).unwrap();

        let result = decode_frame(&frame[..frame.len() - 4]);
        assert!(matches!(result, Err(ProtocolError::IncompleteFrame { .. })));

        let result = decode_frame(&frame[..3]);
        assert!(matches!(
            result,
            Err(ProtocolError::IncompleteFrame { expected: 8, actual: 3 })
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut frame = vec![0u8; FRAME_HEADER_LEN];
        BigEndian::write_u32(&mut frame[0..4], (MAX_CAPTURE_PAYLOAD + 1) as u32);
        assert!(matches!(
            decode_frame(&frame),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_reader_walks_stream() {
        let mut stream = Vec::new();
        write_frame(
            &mut stream,
            &CaptureRecord {
                elapsed_us: 0,
                slot: SlotId(2),
                call: CapturedCall::Opened {
                    client: ClientProcess(4242),
                },
            },
        )
        .unwrap();
        write_frame(&mut stream, &read_record(2, &[1, 2, 3])).unwrap();
        write_frame(
            &mut stream,
            &CaptureRecord {
                elapsed_us: 9,
                slot: SlotId(2),
                call: CapturedCall::StateChanged {
                    from: SlotState::SteadyState,
                    to: SlotState::Finalizing,
                },
            },
        )
        .unwrap();

        let records: Vec<_> = CaptureReader::new(Cursor::new(stream))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(records[0].call, CapturedCall::Opened { .. }));
        assert_eq!(records[1], read_record(2, &[1, 2, 3]));
    }

    #[test]
    fn test_reader_stops_after_partial_frame() {
        let mut stream = Vec::new();
        write_frame(&mut stream, &read_record(0, &[7; 5])).unwrap();
        stream.extend_from_slice(&[0, 0, 0]);

        let mut reader = CaptureReader::new(Cursor::new(stream));
        assert!(reader.next().unwrap().is_ok());
        assert!(reader.next().unwrap().is_err());
        assert!(reader.next().is_none());
    }
}
