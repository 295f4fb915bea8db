//! Engine error type
//!
//! Every variant is terminal for the operation that raised it. Expected
//! conditions such as a failed or unplugged transfer never appear here; they
//! travel as [`protocol::TransferReport`] status codes.

use common::{MapError, TransportError};
use protocol::{ControlSetup, Direction, SlotId, SlotState, XferStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Slot index {0} is out of range")]
    InvalidSlot(u32),

    #[error("{0} is not acquired")]
    SlotNotAcquired(SlotId),

    #[error("Too many adapters: all {max} slots are in use")]
    CapacityExhausted { max: usize },

    #[error("No slot finished shutting down after {attempts} retries")]
    ShutdownStalled { attempts: u32 },

    #[error("{slot} already has {max} control transfers outstanding")]
    TooManyPendingControl { slot: SlotId, max: usize },

    #[error("Unexpected control request {setup} on {slot}")]
    UnexpectedControlRequest { slot: SlotId, setup: ControlSetup },

    #[error("Interface has no {direction:?} endpoint")]
    EndpointNotFound { direction: Direction },

    #[error("Expected {direction:?} endpoint {expected:#04x}, found {found:#04x}")]
    UnexpectedEndpoint {
        direction: Direction,
        expected: u8,
        found: u8,
    },

    #[error("Setup request {setup} on {slot} failed with status {status}")]
    SetupFailed {
        slot: SlotId,
        setup: ControlSetup,
        status: XferStatus,
    },

    #[error("Transfer of {size:#x} bytes exceeds the {max:#x}-byte bounce window")]
    TransferTooLarge { size: usize, max: usize },

    #[error("{slot} cannot move from {from} to {to}")]
    InvalidTransition {
        slot: SlotId,
        from: SlotState,
        to: SlotState,
    },

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Foreign memory failure: {0}")]
    Mapping(#[from] MapError),

    #[error("Topology bridge failure: {0}")]
    Bridge(#[from] common::Error),

    #[error("Failed to spawn dispatcher thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Dispatcher has stopped")]
    DispatcherStopped,

    #[error("Dispatcher thread panicked")]
    DispatcherPanicked,
}

pub type Result<T> = std::result::Result<T, EngineError>;
