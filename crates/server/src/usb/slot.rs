//! Adapter slots and the slot table
//!
//! The pool is an arena of exactly [`MAX_ADAPTERS`] slots created once at
//! engine start. Each [`AdapterSlot`] owns the per-slot data that the
//! dispatcher and the proxy exchange (mailbox, control cache, pending control
//! queue, client signals). Lifecycle bookkeeping lives separately in the
//! [`SlotTable`]: one mutex over every slot's [`SlotRecord`], plus a condvar
//! that is notified on every lifecycle change. The table lock is only held
//! for bookkeeping, never across a transfer or a wait-set wait.

use super::ctrl_cache::ControlCache;
use super::error::{EngineError, Result};
use super::mailbox::Mailbox;
use common::signal::lock;
use common::{Endpoint, Event, UsbInterface};
use protocol::{
    ClientProcess, ControlSetup, Direction, ForeignAddr, MAX_ADAPTERS, MAX_PENDING_CONTROL,
    SlotId, SlotState, TransferReport,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

/// Opened transport handles of an acquired slot
pub struct SlotHardware {
    pub interface: Box<dyn UsbInterface>,
    pub read: Box<dyn Endpoint>,
    pub write: Box<dyn Endpoint>,
}

impl SlotHardware {
    pub fn endpoint(&self, direction: Direction) -> &dyn Endpoint {
        match direction {
            Direction::Read => self.read.as_ref(),
            Direction::Write => self.write.as_ref(),
        }
    }
}

/// The four completion signals a client can wait on
#[derive(Clone, Default, Debug)]
pub struct ClientSignals {
    /// Slot changed lifecycle state
    pub state_change: Event,
    /// A control transfer finished
    pub control: Event,
    /// A packet read finished
    pub read: Event,
    /// A packet write finished
    pub write: Event,
}

impl ClientSignals {
    pub fn for_direction(&self, direction: Direction) -> &Event {
        match direction {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }
}

/// Who is waiting for a control transfer
pub enum ControlOrigin {
    /// Step `n` of the setup sequence
    Setup { step: usize },
    /// A client request passed through to hardware
    Client {
        client: ClientProcess,
        buffer: Option<ForeignAddr>,
        reply: oneshot::Sender<TransferReport>,
    },
}

pub struct PendingControl {
    pub setup: ControlSetup,
    pub origin: ControlOrigin,
    /// Host-to-device payload, or the receive buffer
    pub payload: Vec<u8>,
    /// Handed to the transport
    pub submitted: bool,
}

/// Bounded FIFO of outstanding control transfers
#[derive(Default)]
pub struct PendingControls {
    queue: VecDeque<PendingControl>,
}

impl PendingControls {
    pub fn push(&mut self, slot: SlotId, entry: PendingControl) -> Result<()> {
        if self.queue.len() >= MAX_PENDING_CONTROL {
            return Err(EngineError::TooManyPendingControl {
                slot,
                max: MAX_PENDING_CONTROL,
            });
        }
        self.queue.push_back(entry);
        Ok(())
    }

    pub fn pop_oldest(&mut self) -> Option<PendingControl> {
        self.queue.pop_front()
    }

    /// Entries not yet handed to the transport, oldest first
    pub fn unsubmitted(&mut self) -> impl Iterator<Item = &mut PendingControl> {
        self.queue.iter_mut().filter(|p| !p.submitted)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Per-slot data shared by the dispatcher and the proxy
pub struct AdapterSlot {
    pub id: SlotId,
    pub mailbox: Mailbox,
    pub cache: Mutex<ControlCache>,
    pub pending: Mutex<PendingControls>,
    /// Report of the client's most recent control transfer
    pub control_report: Mutex<TransferReport>,
    pub signals: ClientSignals,
    /// Serializes synchronous pass-through I/O while finalizing
    pub passthrough: Mutex<()>,
}

impl AdapterSlot {
    fn new(id: SlotId) -> Self {
        Self {
            id,
            mailbox: Mailbox::new(),
            cache: Mutex::new(ControlCache::new()),
            pending: Mutex::new(PendingControls::default()),
            control_report: Mutex::new(TransferReport::never_completed()),
            signals: ClientSignals::default(),
            passthrough: Mutex::new(()),
        }
    }

    /// Drop everything learned while the slot was acquired
    pub fn reset(&self) {
        self.mailbox.reset();
        lock(&self.cache).clear();
        lock(&self.pending).clear();
        *lock(&self.control_report) = TransferReport::never_completed();
    }
}

/// Lifecycle bookkeeping of one slot
#[derive(Default)]
pub struct SlotRecord {
    pub state: SlotState,
    pub client: Option<ClientProcess>,
    pub shutdown_requested: bool,
    pub read_buffer: Option<ForeignAddr>,
    pub write_buffer: Option<ForeignAddr>,
    pub hardware: Option<Arc<SlotHardware>>,
}

impl SlotRecord {
    pub fn buffer(&self, direction: Direction) -> Option<ForeignAddr> {
        match direction {
            Direction::Read => self.read_buffer,
            Direction::Write => self.write_buffer,
        }
    }

    /// Record a mapped client buffer, returning the previous one
    pub fn set_buffer(&mut self, direction: Direction, addr: ForeignAddr) -> Option<ForeignAddr> {
        let slot = match direction {
            Direction::Read => &mut self.read_buffer,
            Direction::Write => &mut self.write_buffer,
        };
        slot.replace(addr)
    }

    pub fn buffers_mapped(&self) -> bool {
        self.read_buffer.is_some() && self.write_buffer.is_some()
    }
}

/// Copy of a record taken under the table lock
#[derive(Clone)]
pub struct SlotView {
    pub id: SlotId,
    pub state: SlotState,
    pub client: Option<ClientProcess>,
    pub shutdown_requested: bool,
    pub buffers_mapped: bool,
    pub hardware: Option<Arc<SlotHardware>>,
}

pub struct SlotTable {
    records: Mutex<Vec<SlotRecord>>,
    changed: Condvar,
    stopped: AtomicBool,
}

impl SlotTable {
    fn new() -> Self {
        Self {
            records: Mutex::new((0..MAX_ADAPTERS).map(|_| SlotRecord::default()).collect()),
            changed: Condvar::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<SlotRecord>> {
        lock(&self.records)
    }

    /// Wait for a lifecycle change or `timeout`
    pub fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, Vec<SlotRecord>>,
        timeout: Duration,
    ) -> MutexGuard<'a, Vec<SlotRecord>> {
        self.changed
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner)
            .0
    }

    /// Block while `slot` is initializing, returning the state it moved to
    pub fn wait_while_initializing(&self, slot: SlotId) -> Result<SlotState> {
        let mut records = self.lock();
        loop {
            self.ensure_running()?;
            let state = records[slot.index()].state;
            if state != SlotState::Initializing {
                return Ok(state);
            }
            records = self
                .changed
                .wait(records)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn notify_all(&self) {
        self.changed.notify_all();
    }

    /// Copy of every record, in slot order
    pub fn snapshot(&self) -> Vec<SlotView> {
        self.lock()
            .iter()
            .enumerate()
            .map(|(i, r)| SlotView {
                id: SlotId(i as u32),
                state: r.state,
                client: r.client,
                shutdown_requested: r.shutdown_requested,
                buffers_mapped: r.buffers_mapped(),
                hardware: r.hardware.clone(),
            })
            .collect()
    }

    pub fn view(&self, slot: SlotId) -> SlotView {
        let records = self.lock();
        let r = &records[slot.index()];
        SlotView {
            id: slot,
            state: r.state,
            client: r.client,
            shutdown_requested: r.shutdown_requested,
            buffers_mapped: r.buffers_mapped(),
            hardware: r.hardware.clone(),
        }
    }

    /// Mark the dispatcher as gone and wake every waiter
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _records = self.lock();
        self.changed.notify_all();
    }

    pub fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(EngineError::DispatcherStopped)
        } else {
            Ok(())
        }
    }
}

/// Move `record` from its current state to `to`
///
/// Returns the previous state. Caller holds the table lock and notifies.
pub fn transition(record: &mut SlotRecord, slot: SlotId, to: SlotState) -> Result<SlotState> {
    let from = record.state;
    if !from.can_transition(to) {
        return Err(EngineError::InvalidTransition { slot, from, to });
    }
    record.state = to;
    Ok(from)
}

/// The slot arena and its table
pub struct SlotPool {
    pub table: SlotTable,
    slots: Vec<AdapterSlot>,
}

impl SlotPool {
    pub fn new() -> Self {
        Self {
            table: SlotTable::new(),
            slots: (0..MAX_ADAPTERS)
                .map(|i| AdapterSlot::new(SlotId(i as u32)))
                .collect(),
        }
    }

    /// Validate a slot id coming from a caller
    pub fn check(&self, slot: SlotId) -> Result<SlotId> {
        if slot.index() < self.slots.len() {
            Ok(slot)
        } else {
            Err(EngineError::InvalidSlot(slot.0))
        }
    }

    pub fn slot(&self, slot: SlotId) -> &AdapterSlot {
        &self.slots[slot.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &AdapterSlot> {
        self.slots.iter()
    }
}

impl Default for SlotPool {
    fn default() -> Self {
        Self::new()
    }
}
