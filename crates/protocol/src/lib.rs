//! Shared types for the GameCube adapter proxy
//!
//! This crate defines the plain data types exchanged between the engine,
//! its transport back-ends and the capture recorder, plus the framed capture
//! file format.
//!
//! # Example
//!
//! ```
//! use protocol::{TransferReport, READ_PACKET_SIZE};
//!
//! // A direction that never completed answers as a full, successful transfer
//! let report = TransferReport::never_completed().for_request(READ_PACKET_SIZE as u32);
//! assert!(report.status.is_success());
//! assert_eq!(report.transferred_size, 0x25);
//! ```
//!
//! # Capture Frames
//!
//! ```
//! use protocol::{CaptureRecord, CapturedCall, SlotId, decode_frame, encode_frame};
//!
//! let record = CaptureRecord {
//!     elapsed_us: 10,
//!     slot: SlotId(0),
//!     call: CapturedCall::CloseRequested,
//! };
//! let frame = encode_frame(&record).unwrap();
//! let (decoded, used) = decode_frame(&frame).unwrap();
//! assert_eq!(decoded, record);
//! assert_eq!(used, frame.len());
//! ```

pub mod capture;
pub mod error;
pub mod integrity;
pub mod types;

pub use capture::{
    CaptureReader, CaptureRecord, CapturedCall, MAX_CAPTURE_PAYLOAD, decode_frame, encode_frame,
    read_frame, write_frame,
};
pub use error::{ProtocolError, Result};
pub use types::{
    ADAPTER_PRODUCT_ID, ADAPTER_VENDOR_ID, AdapterPacketState, BEGIN_POLLING_PACKET,
    ClientProcess, ControlSetup, Direction, ForeignAddr, MAX_ADAPTERS, MAX_PENDING_CONTROL,
    PAGE_SIZE, READ_PACKET_SIZE, SlotId, SlotState, TransferReport, WRITE_PACKET_SIZE, XferId,
    XferStatus,
};
