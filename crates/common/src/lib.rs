//! Common infrastructure for the GameCube adapter proxy
//!
//! This crate provides the pieces shared by the engine and its tests: the
//! error types, logging setup, completion signals and wait-set, the
//! topology-change channel bridge, and the transport and foreign-memory
//! seams the engine is written against.

pub mod channel;
pub mod error;
pub mod logging;
pub mod memory;
pub mod signal;
pub mod test_utils;
pub mod transport;

pub use channel::{TopologyEvent, TopologyReceiver, TopologySender, create_topology_bridge};
pub use error::{Error, MapError, Result, TransportError};
pub use logging::{setup_logging, setup_test_logging};
pub use memory::ForeignMapper;
pub use signal::{Event, WaitSet};
pub use transport::{Completion, Endpoint, EndpointDescriptor, UsbInterface, first_endpoint};
