//! USB host transport seam
//!
//! The engine drives the adapter through these traits only. A transport
//! submits transfers without blocking and signals a per-endpoint [`Event`]
//! when completions are ready to be taken. Buffers are moved into the
//! transport on submission and handed back with their completion report.
//!
//! `server::usb::transfers` implements them over `rusb`;
//! [`crate::test_utils::MockDevice`] implements them for tests.

use crate::error::TransportError;
use crate::signal::Event;
use protocol::{ControlSetup, Direction, TransferReport, XferId};

/// Subset of an endpoint descriptor the engine needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// bEndpointAddress, direction bit included
    pub address: u8,
    /// wMaxPacketSize; zero marks an unused descriptor slot
    pub max_packet_size: u16,
    /// bInterval
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn direction(&self) -> Direction {
        if self.address & 0x80 != 0 {
            Direction::Read
        } else {
            Direction::Write
        }
    }
}

/// A finished transfer and the buffer it used
///
/// For reads the first `report.transferred_size` bytes of `data` are valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub report: TransferReport,
    pub data: Vec<u8>,
}

/// One opened interrupt endpoint
pub trait Endpoint: Send + Sync {
    fn address(&self) -> u8;

    /// Prepare the endpoint's transfer ring
    fn populate_ring(&self) -> Result<(), TransportError>;

    /// Submit `size` bytes of `buffer` (or a `size`-byte read into it)
    fn post_buffer(&self, buffer: Vec<u8>, size: usize) -> Result<XferId, TransportError>;

    /// Take up to `max` finished transfers, oldest first
    ///
    /// The completion event is cleared once nothing is left.
    fn take_completions(&self, max: usize) -> Vec<Completion>;

    /// Signaled while completions are waiting
    fn completion_event(&self) -> &Event;

    /// Stop the endpoint; in-flight transfers complete as cancelled
    fn close(&self) -> Result<(), TransportError>;
}

/// One claimed adapter interface
pub trait UsbInterface: Send + Sync {
    fn endpoint_descriptors(&self) -> Vec<EndpointDescriptor>;

    fn open_endpoint(
        &self,
        descriptor: &EndpointDescriptor,
    ) -> Result<Box<dyn Endpoint>, TransportError>;

    /// Submit a control transfer on endpoint zero
    ///
    /// For host-to-device requests `data` is the payload; for device-to-host
    /// requests it is the receive buffer.
    fn control_transfer(&self, setup: ControlSetup, data: Vec<u8>)
    -> Result<XferId, TransportError>;

    /// Take the oldest finished control transfer
    ///
    /// The control event is cleared once nothing is left.
    fn take_control_completion(&self) -> Option<Completion>;

    /// Signaled while control completions are waiting
    fn control_event(&self) -> &Event;

    /// Signaled when the interface itself goes away
    fn state_change_event(&self) -> &Event;
}

/// First usable endpoint descriptor pointing `direction`
pub fn first_endpoint(
    descriptors: &[EndpointDescriptor],
    direction: Direction,
) -> Option<EndpointDescriptor> {
    descriptors
        .iter()
        .find(|d| d.max_packet_size != 0 && d.direction() == direction)
        .copied()
}
