//! Integration tests for capture files
//!
//! Writes capture streams to real files and reads them back, covering the
//! record shapes the engine produces during an adapter session.

use protocol::{
    CaptureReader, CaptureRecord, CapturedCall, ClientProcess, ControlSetup, ProtocolError,
    SlotId, SlotState, TransferReport, XferId, XferStatus, read_frame, write_frame,
};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};

fn session(slot: SlotId) -> Vec<CaptureRecord> {
    let setup = ControlSetup::new(0x80, 0x06, 0x0200, 0, 0x29);
    vec![
        CaptureRecord {
            elapsed_us: 0,
            slot,
            call: CapturedCall::Opened {
                client: ClientProcess(1234),
            },
        },
        CaptureRecord {
            elapsed_us: 120,
            slot,
            call: CapturedCall::StateChanged {
                from: SlotState::Initializing,
                to: SlotState::SteadyState,
            },
        },
        CaptureRecord {
            elapsed_us: 400,
            slot,
            call: CapturedCall::ControlTransfer {
                setup,
                report: TransferReport::synthesized(0x29),
                replayed: true,
                data: vec![0x09; 0x29],
            },
        },
        CaptureRecord {
            elapsed_us: 8_000,
            slot,
            call: CapturedCall::ReadPacket {
                report: TransferReport {
                    xfer_id: XferId(11),
                    status: XferStatus::SUCCESS,
                    requested_size: 0x25,
                    transferred_size: 0x25,
                },
                data: vec![0x21; 0x25],
            },
        },
        CaptureRecord {
            elapsed_us: 9_000,
            slot,
            call: CapturedCall::CloseRequested,
        },
        CaptureRecord {
            elapsed_us: 9_100,
            slot,
            call: CapturedCall::Released,
        },
    ]
}

mod file_capture {
    use super::*;

    #[test]
    fn test_session_survives_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.gccap");

        let records = session(SlotId(1));
        {
            let mut writer = BufWriter::new(File::create(&path).unwrap());
            for record in &records {
                write_frame(&mut writer, record).unwrap();
            }
            writer.flush().unwrap();
        }

        let reader = BufReader::new(File::open(&path).unwrap());
        let decoded: Vec<_> = CaptureReader::new(reader)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn test_interleaved_slots_keep_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("two-slots.gccap");

        let first = session(SlotId(0));
        let second = session(SlotId(3));
        {
            let mut writer = BufWriter::new(File::create(&path).unwrap());
            for (a, b) in first.iter().zip(second.iter()) {
                write_frame(&mut writer, a).unwrap();
                write_frame(&mut writer, b).unwrap();
            }
        }

        let mut reader = BufReader::new(File::open(&path).unwrap());
        let mut slots = Vec::new();
        while let Some(record) = read_frame(&mut reader).unwrap() {
            slots.push(record.slot.0);
        }
        assert_eq!(slots, vec![0, 3, 0, 3, 0, 3, 0, 3, 0, 3, 0, 3]);
    }

    #[test]
    fn test_truncated_file_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.gccap");

        let mut bytes = Vec::new();
        for record in session(SlotId(2)) {
            write_frame(&mut bytes, &record).unwrap();
        }
        bytes.truncate(bytes.len() - 2);
        std::fs::write(&path, &bytes).unwrap();

        let results: Vec<_> = CaptureReader::new(File::open(&path).unwrap()).collect();
        assert_eq!(results.len(), 6);
        assert!(results[..5].iter().all(|r| r.is_ok()));
        assert!(matches!(
            results[5],
            Err(ProtocolError::IncompleteFrame { .. })
        ));
    }
}
