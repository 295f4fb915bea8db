//! Proxy API
//!
//! What a client sees of the engine. Every call runs on the caller's thread
//! and, depending on the slot's lifecycle state, either blocks until setup
//! finishes, is served from the mailbox and control cache without touching
//! hardware, or passes through to the transport synchronously once the
//! slot is finalizing.
//!
//! Calls never touch the dispatcher's wait-set: they update the slot table
//! and ring the topology bridge.

use super::device::{AdapterProfile, open_hardware};
use super::error::{EngineError, Result};
use super::foreign::ForeignTransfer;
use super::shared::EngineShared;
use super::slot::{ClientSignals, ControlOrigin, PendingControl, SlotHardware, transition};
use super::worker::spawn_dispatcher;
use crate::capture::CaptureRecorder;
use common::signal::lock;
use common::{Event, ForeignMapper, TopologyEvent, UsbInterface, create_topology_bridge};
use protocol::{
    AdapterPacketState, CapturedCall, ClientProcess, ControlSetup, Direction, ForeignAddr,
    MAX_ADAPTERS, PAGE_SIZE, SlotId, SlotState, TransferReport, XferId, XferStatus,
};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Tunables for `open_adapter`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Wait between attempts while a slot is shutting down
    pub open_retry_delay: Duration,
    /// Attempts before giving up with `ShutdownStalled`
    pub open_retry_limit: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            open_retry_delay: Duration::from_micros(100),
            open_retry_limit: 10_000,
        }
    }
}

/// An acquired slot, as returned to the client
#[derive(Debug, Clone)]
pub struct AdapterHandle {
    slot: SlotId,
    signals: ClientSignals,
}

impl AdapterHandle {
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn state_change_event(&self) -> &Event {
        &self.signals.state_change
    }

    pub fn control_event(&self) -> &Event {
        &self.signals.control
    }

    pub fn read_event(&self) -> &Event {
        &self.signals.read
    }

    pub fn write_event(&self) -> &Event {
        &self.signals.write
    }
}

/// The virtualization engine: slot pool, dispatcher thread and proxy calls
pub struct Engine {
    shared: Arc<EngineShared>,
    settings: EngineSettings,
    dispatcher: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Engine {
    /// Create the slot pool and spawn the dispatcher
    pub fn start(
        profile: AdapterProfile,
        settings: EngineSettings,
        mapper: Box<dyn ForeignMapper>,
        capture: Option<CaptureRecorder>,
    ) -> Result<Self> {
        let (topology_tx, topology_rx) = create_topology_bridge();
        let shared = Arc::new(EngineShared::new(
            profile,
            ForeignTransfer::new(mapper),
            topology_tx,
            capture,
        ));
        let dispatcher = spawn_dispatcher(Arc::clone(&shared), topology_rx)?;
        info!("Engine started with {} adapter slots", MAX_ADAPTERS);

        Ok(Self {
            shared,
            settings,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Acquire a free slot for a freshly claimed adapter interface
    ///
    /// The slot starts in `Initializing`; the dispatcher runs the setup
    /// sequence in the background.
    pub fn open_adapter(
        &self,
        client: ClientProcess,
        interface: Box<dyn UsbInterface>,
    ) -> Result<AdapterHandle> {
        self.shared.pool.table.ensure_running()?;
        let hardware = Arc::new(open_hardware(interface, &self.shared.profile)?);

        let slot = match self.bind_slot(client, &hardware) {
            Ok(slot) => slot,
            Err(e) => {
                for endpoint in [&hardware.read, &hardware.write] {
                    if let Err(close_err) = endpoint.close() {
                        warn!(
                            "Closing endpoint {:#04x} failed: {}",
                            endpoint.address(),
                            close_err
                        );
                    }
                }
                return Err(e);
            }
        };

        let adapter = self.shared.slot(slot);
        adapter.signals.state_change.signal();
        self.shared.record(slot, CapturedCall::Opened { client });
        self.shared.record(
            slot,
            CapturedCall::StateChanged {
                from: SlotState::Unacquired,
                to: SlotState::Initializing,
            },
        );
        self.shared.topology.notify(TopologyEvent::Acquired(slot))?;
        info!("{}: acquired by client {}", slot, client.0);

        Ok(AdapterHandle {
            slot,
            signals: adapter.signals.clone(),
        })
    }

    /// Claim the first free slot, waiting for a shutting-down slot if full
    fn bind_slot(&self, client: ClientProcess, hardware: &Arc<SlotHardware>) -> Result<SlotId> {
        let table = &self.shared.pool.table;
        let mut records = table.lock();
        let mut attempts = 0;
        loop {
            table.ensure_running()?;
            let free = records
                .iter()
                .position(|r| r.state == SlotState::Unacquired && !r.shutdown_requested);
            if let Some(i) = free {
                let slot = SlotId(i as u32);
                let record = &mut records[i];
                transition(record, slot, SlotState::Initializing)?;
                record.client = Some(client);
                record.hardware = Some(Arc::clone(hardware));
                table.notify_all();
                return Ok(slot);
            }

            if !records.iter().any(|r| r.shutdown_requested) {
                return Err(EngineError::CapacityExhausted { max: MAX_ADAPTERS });
            }
            if attempts >= self.settings.open_retry_limit {
                return Err(EngineError::ShutdownStalled { attempts });
            }
            attempts += 1;
            records = table.wait_timeout(records, self.settings.open_retry_delay);
        }
    }

    /// Ask the dispatcher to release a slot
    ///
    /// Returns immediately; the slot becomes free once the dispatcher has
    /// closed its endpoints.
    pub fn close_adapter(&self, slot: SlotId) -> Result<()> {
        let slot = self.shared.pool.check(slot)?;
        {
            let mut records = self.shared.pool.table.lock();
            let record = &mut records[slot.index()];
            if !record.state.is_acquired() {
                return Err(EngineError::SlotNotAcquired(slot));
            }
            if record.shutdown_requested {
                return Ok(());
            }
            record.shutdown_requested = true;
        }
        self.shared.record(slot, CapturedCall::CloseRequested);
        self.shared
            .topology
            .notify(TopologyEvent::ShutdownRequested(slot))?;
        info!("{}: close requested", slot);
        Ok(())
    }

    /// Register the client buffer packets of `direction` are exchanged in
    pub fn map_packet_buffer(
        &self,
        slot: SlotId,
        direction: Direction,
        addr: ForeignAddr,
    ) -> Result<()> {
        let slot = self.shared.pool.check(slot)?;
        let previous = {
            let mut records = self.shared.pool.table.lock();
            let record = &mut records[slot.index()];
            if !record.state.is_acquired() {
                return Err(EngineError::SlotNotAcquired(slot));
            }
            record.set_buffer(direction, addr)
        };
        debug!("{}: {:?} buffer mapped at {}", slot, direction, addr);
        if previous.is_none() {
            self.shared
                .topology
                .notify(TopologyEvent::BufferMapped { slot, direction })?;
        }
        Ok(())
    }

    /// Run a control transfer on behalf of the client
    ///
    /// `buffer` holds the host-to-device payload, or receives the
    /// device-to-host data stage.
    pub fn submit_control_transfer(
        &self,
        slot: SlotId,
        setup: ControlSetup,
        buffer: Option<ForeignAddr>,
    ) -> Result<TransferReport> {
        let slot = self.shared.pool.check(slot)?;
        let (mut state, client) = self.acquired(slot)?;
        if state == SlotState::Initializing {
            state = self.shared.pool.table.wait_while_initializing(slot)?;
        }
        match state {
            SlotState::SteadyState => self.replay_control(slot, client, setup, buffer),
            SlotState::Finalizing => self.pass_through_control(slot, client, setup, buffer),
            _ => Err(EngineError::SlotNotAcquired(slot)),
        }
    }

    fn replay_control(
        &self,
        slot: SlotId,
        client: ClientProcess,
        setup: ControlSetup,
        buffer: Option<ForeignAddr>,
    ) -> Result<TransferReport> {
        let adapter = self.shared.slot(slot);
        let Some(entry) = lock(&adapter.cache).lookup(&setup).cloned() else {
            warn!("{}: no cached answer for {}", slot, setup);
            return Err(EngineError::UnexpectedControlRequest { slot, setup });
        };

        if setup.is_device_to_host() {
            if let Some(dst) = buffer {
                let len = entry.response.len().min(setup.length as usize);
                self.shared
                    .transfer
                    .copy_out(client, &entry.response[..len], dst)?;
            }
        }
        let report = TransferReport {
            xfer_id: XferId(0),
            status: XferStatus::SUCCESS,
            requested_size: setup.length as u32,
            transferred_size: entry.transferred,
        };
        *lock(&adapter.control_report) = report;
        adapter.signals.control.signal();
        trace!("{}: replayed {}", slot, setup);
        self.shared.record(
            slot,
            CapturedCall::ControlTransfer {
                setup,
                report,
                replayed: true,
                data: entry.response,
            },
        );
        Ok(report)
    }

    fn pass_through_control(
        &self,
        slot: SlotId,
        client: ClientProcess,
        setup: ControlSetup,
        buffer: Option<ForeignAddr>,
    ) -> Result<TransferReport> {
        let mut payload = vec![0u8; setup.length as usize];
        if !setup.is_device_to_host() {
            if let Some(src) = buffer {
                self.shared.transfer.copy_in(client, src, &mut payload)?;
            }
        }
        let captured = if setup.is_device_to_host() {
            Vec::new()
        } else {
            payload.clone()
        };

        let (reply, answer) = oneshot::channel();
        lock(&self.shared.slot(slot).pending).push(
            slot,
            PendingControl {
                setup,
                origin: ControlOrigin::Client {
                    client,
                    buffer,
                    reply,
                },
                payload,
                submitted: false,
            },
        )?;
        self.shared
            .topology
            .notify(TopologyEvent::ControlSubmitted(slot))?;
        debug!("{}: queued {} for hardware", slot, setup);

        // The reply is dropped when the slot is released or the engine stops
        let report = answer.blocking_recv().map_err(|_| {
            match self.shared.pool.table.ensure_running() {
                Err(e) => e,
                Ok(()) => EngineError::SlotNotAcquired(slot),
            }
        })?;
        self.shared.record(
            slot,
            CapturedCall::ControlTransfer {
                setup,
                report,
                replayed: false,
                data: captured,
            },
        );
        Ok(report)
    }

    /// Report of the client's most recent control transfer
    pub fn control_report(&self, slot: SlotId) -> Result<TransferReport> {
        let slot = self.shared.pool.check(slot)?;
        Ok(*lock(&self.shared.slot(slot).control_report))
    }

    /// Copy the latest controller packet into the client's `buffer`
    pub fn read_packet(
        &self,
        slot: SlotId,
        buffer: ForeignAddr,
        size: usize,
    ) -> Result<TransferReport> {
        let slot = self.shared.pool.check(slot)?;
        check_size(size)?;
        let (mut state, client) = self.acquired(slot)?;
        self.ensure_mapped(slot, Direction::Read, buffer)?;
        if state == SlotState::Initializing {
            state = self.shared.pool.table.wait_while_initializing(slot)?;
        }

        let adapter = self.shared.slot(slot);
        let (data, report) = match state {
            SlotState::SteadyState => adapter.mailbox.withdraw(Direction::Read, size),
            SlotState::Finalizing => {
                let mut data = vec![0u8; size];
                let report = self.pass_through(slot, Direction::Read, &mut data)?;
                (data, report)
            }
            _ => return Err(EngineError::SlotNotAcquired(slot)),
        };
        self.shared.transfer.copy_out(client, &data, buffer)?;

        self.packet_done(slot, Direction::Read, report, data);
        Ok(report)
    }

    /// Send `size` bytes from the client's `buffer` to the adapter
    pub fn write_packet(
        &self,
        slot: SlotId,
        buffer: ForeignAddr,
        size: usize,
    ) -> Result<TransferReport> {
        let slot = self.shared.pool.check(slot)?;
        check_size(size)?;
        let (mut state, client) = self.acquired(slot)?;
        self.ensure_mapped(slot, Direction::Write, buffer)?;

        let mut data = vec![0u8; size];
        self.shared.transfer.copy_in(client, buffer, &mut data)?;
        let adapter = self.shared.slot(slot);

        let report = if state != SlotState::Finalizing && self.shared.profile.is_begin_polling(&data)
        {
            // The dispatcher sends its own begin-polling packet
            TransferReport::synthesized(size as u32)
        } else {
            if state == SlotState::Initializing {
                state = self.shared.pool.table.wait_while_initializing(slot)?;
            }
            match state {
                SlotState::SteadyState => {
                    adapter.mailbox.deposit(Direction::Write, &data);
                    self.shared
                        .topology
                        .notify(TopologyEvent::WriteQueued(slot))?;
                    adapter
                        .mailbox
                        .latest_report(Direction::Write)
                        .for_request(size as u32)
                }
                SlotState::Finalizing => self.pass_through(slot, Direction::Write, &mut data)?,
                _ => return Err(EngineError::SlotNotAcquired(slot)),
            }
        };

        self.packet_done(slot, Direction::Write, report, data);
        Ok(report)
    }

    /// Fire the client's completion signal and capture the packet
    fn packet_done(
        &self,
        slot: SlotId,
        direction: Direction,
        report: TransferReport,
        data: Vec<u8>,
    ) {
        self.shared
            .slot(slot)
            .signals
            .for_direction(direction)
            .signal();
        let call = match direction {
            Direction::Read => CapturedCall::ReadPacket { report, data },
            Direction::Write => CapturedCall::WritePacket { report, data },
        };
        self.shared.record(slot, call);
    }

    /// One synchronous transfer on a finalizing slot
    ///
    /// `data` is the outgoing payload or the receive buffer; on return it
    /// holds what the transport handed back, resized to its original length.
    fn pass_through(
        &self,
        slot: SlotId,
        direction: Direction,
        data: &mut Vec<u8>,
    ) -> Result<TransferReport> {
        let hardware = self
            .shared
            .pool
            .table
            .view(slot)
            .hardware
            .ok_or(EngineError::SlotNotAcquired(slot))?;
        let adapter = self.shared.slot(slot);
        let _serial = lock(&adapter.passthrough);

        let endpoint = hardware.endpoint(direction);
        let size = data.len();
        let id = endpoint.post_buffer(std::mem::take(data), size)?;
        trace!("{}: pass-through {:?} {:?} posted", slot, direction, id);

        loop {
            for completion in endpoint.take_completions(usize::MAX) {
                if completion.report.xfer_id != id {
                    trace!(
                        "{}: dropping stale completion {:?}",
                        slot, completion.report.xfer_id
                    );
                    continue;
                }
                let report = completion.report;
                *data = completion.data;
                data.resize(size, 0);
                adapter.mailbox.record_report(direction, report);
                return Ok(report);
            }
            // Stopping the engine signals this event
            self.shared.pool.table.ensure_running()?;
            endpoint.completion_event().wait();
        }
    }

    pub fn slot_state(&self, slot: SlotId) -> Result<SlotState> {
        let slot = self.shared.pool.check(slot)?;
        Ok(self.shared.pool.table.view(slot).state)
    }

    pub fn signals(&self, slot: SlotId) -> Result<ClientSignals> {
        let slot = self.shared.pool.check(slot)?;
        Ok(self.shared.slot(slot).signals.clone())
    }

    /// Latest read packet of every acquired slot, without going through a
    /// client
    pub fn adapter_packet_state(&self) -> AdapterPacketState {
        let mut state = AdapterPacketState::empty();
        for view in self.shared.pool.table.snapshot() {
            if view.state.is_acquired() {
                let i = view.id.index();
                state.in_use_mask |= 1 << i;
                state.packets[i] = self.shared.slot(view.id).mailbox.read_snapshot();
            }
        }
        state
    }

    /// Release every slot and join the dispatcher
    pub fn shutdown(&self) -> Result<()> {
        let Some(handle) = lock(&self.dispatcher).take() else {
            return Ok(());
        };
        if let Err(e) = self.shared.topology.notify(TopologyEvent::Shutdown) {
            debug!("Dispatcher already gone: {}", e);
        }
        let result = handle.join().map_err(|_| EngineError::DispatcherPanicked)?;
        info!("Engine stopped");
        result
    }

    /// Client and state of an acquired slot
    fn acquired(&self, slot: SlotId) -> Result<(SlotState, ClientProcess)> {
        self.shared.pool.table.ensure_running()?;
        let records = self.shared.pool.table.lock();
        let record = &records[slot.index()];
        match record.client {
            Some(client) if record.state.is_acquired() => Ok((record.state, client)),
            _ => Err(EngineError::SlotNotAcquired(slot)),
        }
    }

    /// Map `addr` implicitly unless it is already the registered buffer
    fn ensure_mapped(&self, slot: SlotId, direction: Direction, addr: ForeignAddr) -> Result<()> {
        let current = self.shared.pool.table.lock()[slot.index()].buffer(direction);
        if current == Some(addr) {
            return Ok(());
        }
        self.map_packet_buffer(slot, direction, addr)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Engine shutdown failed: {}", e);
        }
    }
}

fn check_size(size: usize) -> Result<()> {
    if size > PAGE_SIZE {
        return Err(EngineError::TransferTooLarge {
            size,
            max: PAGE_SIZE,
        });
    }
    Ok(())
}
