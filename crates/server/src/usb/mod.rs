//! Adapter virtualization engine
//!
//! Up to four GameCube adapters are exposed to clients through fixed slots.
//! A dedicated dispatcher thread ([`worker`]) owns every hardware transfer
//! once a slot is acquired; client calls ([`proxy`]) are served from a
//! per-slot mailbox and control cache so that polling never waits on the
//! client, and fall back to synchronous pass-through once the adapter is
//! gone.
//!
//! The engine is written against the transport and foreign-memory traits in
//! `common`. [`transfers`] implements the transport over rusb and
//! [`process_memory`] the foreign memory over `process_vm_readv`.

pub mod ctrl_cache;
pub mod device;
pub mod error;
pub mod foreign;
pub mod mailbox;
#[cfg(target_os = "linux")]
pub mod process_memory;
pub mod proxy;
pub mod shared;
pub mod slot;
pub mod transfers;
pub mod worker;

pub use device::{AdapterProfile, gamecube_setup_sequence};
pub use error::{EngineError, Result};
#[cfg(target_os = "linux")]
pub use process_memory::ProcessVmMapper;
pub use proxy::{AdapterHandle, Engine, EngineSettings};
pub use slot::ClientSignals;
pub use transfers::{AdapterInfo, RusbInterface, list_adapters, open_adapters};
