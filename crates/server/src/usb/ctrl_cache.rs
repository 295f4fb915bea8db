//! Control-transfer response cache
//!
//! During setup the engine issues a fixed sequence of control requests and
//! records every answer here. When the client later repeats one of those
//! requests it is answered from the cache without touching hardware.
//!
//! The cache is append-only and searched newest-first, so a repeated
//! request signature is implicitly replaced by its latest answer.

use protocol::ControlSetup;

/// One recorded request and its answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedControl {
    pub setup: ControlSetup,
    /// Data stage bytes returned by the device (empty for host-to-device)
    pub response: Vec<u8>,
    /// Bytes the device actually transferred
    pub transferred: u32,
}

#[derive(Debug, Default)]
pub struct ControlCache {
    entries: Vec<CachedControl>,
}

impl ControlCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, setup: ControlSetup, response: Vec<u8>, transferred: u32) {
        self.entries.push(CachedControl {
            setup,
            response,
            transferred,
        });
    }

    /// Newest entry whose signature matches exactly
    pub fn lookup(&self, setup: &ControlSetup) -> Option<&CachedControl> {
        self.entries.iter().rev().find(|e| e.setup == *setup)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
