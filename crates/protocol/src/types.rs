//! Adapter and transfer type definitions
//!
//! This module defines the plain data types shared by the engine, the
//! transport implementations and the capture format: slot and client
//! identifiers, control setup packets, transfer reports and the adapter
//! lifecycle state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of adapter slots in the pool
pub const MAX_ADAPTERS: usize = 4;

/// Maximum outstanding control transfers per slot
pub const MAX_PENDING_CONTROL: usize = 4;

/// Size of one bounce page, also the largest single packet copy
pub const PAGE_SIZE: usize = 0x1000;

/// Size of an adapter input report (one status byte plus four ports)
pub const READ_PACKET_SIZE: usize = 0x25;

/// Size of an adapter rumble/output report
pub const WRITE_PACKET_SIZE: usize = 0x05;

/// One-byte output report that starts controller polling
pub const BEGIN_POLLING_PACKET: u8 = 0x13;

/// Default USB vendor id of the adapter
pub const ADAPTER_VENDOR_ID: u16 = 0x057e;

/// Default USB product id of the adapter
pub const ADAPTER_PRODUCT_ID: u16 = 0x0337;

/// Adapter slot index
///
/// Stable for as long as the slot is acquired. Valid values are
/// `0..MAX_ADAPTERS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub u32);

impl SlotId {
    /// Index into the slot arena
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Opaque identity of the foreign process that owns a slot
///
/// On Linux this is the process id used for cross-process memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientProcess(pub u64);

/// Address inside a client's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignAddr(pub u64);

impl ForeignAddr {
    /// Start of the page containing this address
    pub fn page_base(self) -> u64 {
        self.0 & !(PAGE_SIZE as u64 - 1)
    }

    /// Offset of this address within its page
    pub fn page_offset(self) -> usize {
        (self.0 & (PAGE_SIZE as u64 - 1)) as usize
    }

    pub fn offset(self, by: u64) -> Self {
        Self(self.0 + by)
    }
}

impl fmt::Display for ForeignAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Transport-assigned id of a posted transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct XferId(pub u32);

impl XferId {
    /// Id carried by a report that no transfer has produced yet
    pub const NEVER_COMPLETED: XferId = XferId(u32::MAX);
}

/// Host-controller completion status
///
/// Zero is success. Every other value is a module-encoded failure code as
/// reported by the transport; only [`XferStatus::DEVICE_UNPLUGGED`] carries
/// meaning to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct XferStatus(pub u32);

impl XferStatus {
    pub const SUCCESS: XferStatus = XferStatus(0);
    /// The device went away while the transfer was in flight
    pub const DEVICE_UNPLUGGED: XferStatus = XferStatus(0x3228c);
    /// Endpoint already closed; tolerated during teardown
    pub const ENDPOINT_CLOSED: XferStatus = XferStatus(0x25a8c);
    /// Generic transfer failure (stall, babble, bus error)
    pub const TRANSFER_FAILED: XferStatus = XferStatus(0x1e28c);
    /// Transfer cancelled because the endpoint was closed
    pub const CANCELLED: XferStatus = XferStatus(0x1d28c);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for XferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Result metadata of one completed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReport {
    /// Transfer this report belongs to
    pub xfer_id: XferId,
    /// Completion status
    pub status: XferStatus,
    /// Bytes the transfer asked for
    pub requested_size: u32,
    /// Bytes actually moved
    pub transferred_size: u32,
}

impl TransferReport {
    /// Placeholder report for a direction that has never completed
    ///
    /// The sizes are left at zero; [`TransferReport::for_request`] turns the
    /// sentinel into the "fully transferred, zero status" answer handed to a
    /// client.
    pub const fn never_completed() -> Self {
        Self {
            xfer_id: XferId::NEVER_COMPLETED,
            status: XferStatus::SUCCESS,
            requested_size: 0,
            transferred_size: 0,
        }
    }

    /// Report for a request the engine answered without hardware
    pub const fn synthesized(size: u32) -> Self {
        Self {
            xfer_id: XferId(0),
            status: XferStatus::SUCCESS,
            requested_size: size,
            transferred_size: size,
        }
    }

    /// Whether this is still the "never completed" sentinel
    pub fn is_sentinel(&self) -> bool {
        self.xfer_id == XferId::NEVER_COMPLETED
    }

    /// Report to hand to a client that asked for `size` bytes
    ///
    /// The sentinel becomes a synthesized full transfer; a real report is
    /// returned as-is.
    pub fn for_request(&self, size: u32) -> Self {
        if self.is_sentinel() {
            Self::synthesized(size)
        } else {
            *self
        }
    }
}

impl Default for TransferReport {
    fn default() -> Self {
        Self::never_completed()
    }
}

/// USB control setup packet (without the data stage)
///
/// Field names follow the USB 2.0 specification (bmRequestType, bRequest,
/// wValue, wIndex, wLength). Two setups with equal fields are the same
/// request signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlSetup {
    pub const fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// Data stage flows from the device to the host
    pub fn is_device_to_host(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

impl fmt::Display for ControlSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:02x} {:02x} {:04x} {:04x} len={:#x}]",
            self.request_type, self.request, self.value, self.index, self.length
        )
    }
}

/// Packet direction from the host's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host (interrupt IN)
    Read,
    /// Host to device (interrupt OUT)
    Write,
}

impl Direction {
    /// Whether an endpoint address points this way
    pub fn matches_address(self, address: u8) -> bool {
        match self {
            Direction::Read => address & 0x80 != 0,
            Direction::Write => address & 0x80 == 0,
        }
    }
}

/// Lifecycle state of an adapter slot
///
/// A slot moves forward through the states in order and only returns to
/// `Unacquired` through a full release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SlotState {
    /// No device bound
    #[default]
    Unacquired,
    /// Setup transactions are being issued and recorded
    Initializing,
    /// Device is polled continuously, client I/O served from cached state
    SteadyState,
    /// Device reported unplug, I/O is passed through synchronously
    Finalizing,
}

impl SlotState {
    /// Whether moving from `self` to `next` is a legal edge
    pub fn can_transition(self, next: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (Unacquired, Initializing)
                | (Initializing, SteadyState)
                | (SteadyState, Finalizing)
                | (Initializing | SteadyState | Finalizing, Unacquired)
        )
    }

    pub fn is_acquired(self) -> bool {
        self != SlotState::Unacquired
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotState::Unacquired => "unacquired",
            SlotState::Initializing => "initializing",
            SlotState::SteadyState => "steady",
            SlotState::Finalizing => "finalizing",
        };
        f.write_str(name)
    }
}

/// Latest input packets of every in-use slot
///
/// Returned by the bypass query for in-process consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterPacketState {
    /// Bit `n` set when slot `n` is acquired
    pub in_use_mask: u8,
    /// Latest read packet per slot (zeroed when unused or never read)
    pub packets: [[u8; READ_PACKET_SIZE]; MAX_ADAPTERS],
}

impl AdapterPacketState {
    pub fn empty() -> Self {
        Self {
            in_use_mask: 0,
            packets: [[0; READ_PACKET_SIZE]; MAX_ADAPTERS],
        }
    }

    pub fn is_in_use(&self, slot: SlotId) -> bool {
        slot.index() < MAX_ADAPTERS && self.in_use_mask & (1 << slot.0) != 0
    }
}
