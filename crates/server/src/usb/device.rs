//! Adapter profile and endpoint location
//!
//! The engine only needs two endpoints from the adapter's interface: the
//! first interrupt IN and the first interrupt OUT endpoint. Everything else
//! about the device is captured in an [`AdapterProfile`].

use super::error::{EngineError, Result};
use super::slot::SlotHardware;
use common::{EndpointDescriptor, UsbInterface, first_endpoint};
use protocol::{BEGIN_POLLING_PACKET, ControlSetup, Direction, READ_PACKET_SIZE};
use tracing::{debug, warn};

/// Device-specific constants the engine is driven by
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterProfile {
    /// Expected address of the interrupt IN endpoint
    pub read_endpoint: u8,
    /// Expected address of the interrupt OUT endpoint
    pub write_endpoint: u8,
    /// Size of each re-armed read
    pub read_size: usize,
    /// Output report that starts polling, sent once on entering steady state
    pub begin_polling_packet: Vec<u8>,
    /// Control requests issued, in order, while initializing
    pub setup_sequence: Vec<ControlSetup>,
}

impl AdapterProfile {
    /// Whether a client write is the begin-polling packet
    pub fn is_begin_polling(&self, data: &[u8]) -> bool {
        data == self.begin_polling_packet.as_slice()
    }
}

impl Default for AdapterProfile {
    fn default() -> Self {
        Self {
            read_endpoint: 0x81,
            write_endpoint: 0x02,
            read_size: READ_PACKET_SIZE,
            begin_polling_packet: vec![BEGIN_POLLING_PACKET],
            setup_sequence: gamecube_setup_sequence(),
        }
    }
}

/// Setup transactions a GameCube adapter answers during initialization
pub fn gamecube_setup_sequence() -> Vec<ControlSetup> {
    vec![
        // GET_DESCRIPTOR(configuration)
        ControlSetup::new(0x80, 0x06, 0x0200, 0x0000, 0x29),
        // CLEAR_FEATURE(ENDPOINT_HALT) on both interrupt endpoints
        ControlSetup::new(0x02, 0x01, 0x0000, 0x0081, 0x00),
        ControlSetup::new(0x02, 0x01, 0x0000, 0x0002, 0x00),
        // GET_DESCRIPTOR(HID report)
        ControlSetup::new(0x81, 0x06, 0x2200, 0x0000, 0xd6),
        // GET_DESCRIPTOR(string 0, language ids)
        ControlSetup::new(0x80, 0x06, 0x0300, 0x0000, 0xff),
        // SET_PROTOCOL(report)
        ControlSetup::new(0x21, 0x0b, 0x0001, 0x0000, 0x00),
    ]
}

/// Find the read and write endpoints and check them against the profile
pub fn locate_endpoints(
    interface: &dyn UsbInterface,
    profile: &AdapterProfile,
) -> Result<(EndpointDescriptor, EndpointDescriptor)> {
    let descriptors = interface.endpoint_descriptors();
    let read = expect_endpoint(&descriptors, Direction::Read, profile.read_endpoint)?;
    let write = expect_endpoint(&descriptors, Direction::Write, profile.write_endpoint)?;
    Ok((read, write))
}

fn expect_endpoint(
    descriptors: &[EndpointDescriptor],
    direction: Direction,
    expected: u8,
) -> Result<EndpointDescriptor> {
    let found =
        first_endpoint(descriptors, direction).ok_or(EngineError::EndpointNotFound { direction })?;
    if found.address != expected {
        return Err(EngineError::UnexpectedEndpoint {
            direction,
            expected,
            found: found.address,
        });
    }
    Ok(found)
}

/// Open both endpoints of a freshly claimed interface
///
/// On failure the endpoints opened so far are closed again.
pub fn open_hardware(
    interface: Box<dyn UsbInterface>,
    profile: &AdapterProfile,
) -> Result<SlotHardware> {
    let (read_desc, write_desc) = locate_endpoints(interface.as_ref(), profile)?;

    let read = interface.open_endpoint(&read_desc)?;
    let write = match interface.open_endpoint(&write_desc) {
        Ok(write) => write,
        Err(e) => {
            let _ = read.close();
            return Err(e.into());
        }
    };
    for endpoint in [&read, &write] {
        if let Err(e) = endpoint.populate_ring() {
            for ep in [&read, &write] {
                if let Err(close_err) = ep.close() {
                    warn!("Closing endpoint {:#04x} failed: {}", ep.address(), close_err);
                }
            }
            return Err(e.into());
        }
    }

    debug!(
        "Opened endpoints {:#04x} (read) and {:#04x} (write)",
        read_desc.address, write_desc.address
    );
    Ok(SlotHardware {
        interface,
        read,
        write,
    })
}
