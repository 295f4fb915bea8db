//! State shared by the proxy API and the dispatcher thread

use super::device::AdapterProfile;
use super::error::Result;
use super::foreign::ForeignTransfer;
use super::slot::{AdapterSlot, SlotPool, transition};
use crate::capture::CaptureRecorder;
use common::TopologySender;
use common::signal::lock;
use protocol::{CapturedCall, SlotId, SlotState};
use tracing::info;

pub struct EngineShared {
    pub pool: SlotPool,
    pub transfer: ForeignTransfer,
    pub topology: TopologySender,
    pub profile: AdapterProfile,
    capture: Option<CaptureRecorder>,
}

impl EngineShared {
    pub fn new(
        profile: AdapterProfile,
        transfer: ForeignTransfer,
        topology: TopologySender,
        capture: Option<CaptureRecorder>,
    ) -> Self {
        Self {
            pool: SlotPool::new(),
            transfer,
            topology,
            profile,
            capture,
        }
    }

    pub fn slot(&self, slot: SlotId) -> &AdapterSlot {
        self.pool.slot(slot)
    }

    /// Capture an event if recording is enabled
    pub fn record(&self, slot: SlotId, call: CapturedCall) {
        if let Some(capture) = &self.capture {
            capture.record(slot, call);
        }
    }

    /// Move a slot to `to`, wake waiters and fire its state-change signal
    pub fn set_state(&self, slot: SlotId, to: SlotState) -> Result<SlotState> {
        let from = {
            let mut records = self.pool.table.lock();
            let from = transition(&mut records[slot.index()], slot, to)?;
            self.pool.table.notify_all();
            from
        };
        info!("{}: {} -> {}", slot, from, to);
        self.slot(slot).signals.state_change.signal();
        self.record(slot, CapturedCall::StateChanged { from, to });
        Ok(from)
    }

    /// The dispatcher is gone: fail every waiter
    pub fn stop(&self) {
        self.pool.table.stop();
        for slot in self.pool.iter() {
            lock(&slot.pending).clear();
            let signals = &slot.signals;
            for event in [
                &signals.state_change,
                &signals.control,
                &signals.read,
                &signals.write,
            ] {
                event.signal();
            }
        }
        // Pass-through callers block on the endpoint events themselves
        for view in self.pool.table.snapshot() {
            if let Some(hardware) = view.hardware {
                hardware.read.completion_event().signal();
                hardware.write.completion_event().signal();
            }
        }
        if let Some(capture) = &self.capture {
            capture.flush();
        }
    }
}
