//! Dispatcher thread
//!
//! A single dedicated thread owns the wait-set across every adapter slot.
//! It is the only code that re-arms hardware transfers and the only code
//! that moves a slot forward through its lifecycle after acquisition.
//!
//! Each cycle:
//! 1. Drain the topology bridge (acquire, close, buffer mapped, write
//!    queued, control submitted, shutdown).
//! 2. Rebuild from the slot table: finalize slots marked for shutdown,
//!    advance setup sequences, enter steady state, start polling, arm queued
//!    writes, hand queued control transfers to the transport.
//! 3. Relink the wait-set from scratch: the topology doorbell first, then
//!    per slot its read, write and (if anything is pending) control event.
//!    Link order is service priority.
//! 4. Wait and dispatch one completion at a time until something requires
//!    a rebuild.
//!
//! Transport or mapping failures are fatal: the loop ends with the error,
//! every blocked proxy caller is woken and fails with `DispatcherStopped`.

use super::error::{EngineError, Result};
use super::shared::EngineShared;
use super::slot::{ControlOrigin, PendingControl, SlotHardware, SlotRecord};
use common::signal::lock;
use common::{TopologyEvent, TopologyReceiver, WaitSet};
use protocol::{CapturedCall, ClientProcess, Direction, SlotId, SlotState, XferStatus};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// What a wait-set entry stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTag {
    Topology,
    Read(SlotId),
    Write(SlotId),
    Control(SlotId),
}

/// Dispatcher-private progress of one slot
#[derive(Default)]
struct SlotRuntime {
    hardware: Option<Arc<SlotHardware>>,
    client: Option<ClientProcess>,
    state: SlotState,
    /// Setup steps handed to the transport
    setup_issued: usize,
    /// Setup steps answered and cached
    setup_done: usize,
    /// Begin-polling packet and first read issued
    started: bool,
    read_open: bool,
    write_open: bool,
    write_in_flight: bool,
    begin_in_flight: bool,
}

impl SlotRuntime {
    fn acquired(hardware: Arc<SlotHardware>, client: Option<ClientProcess>) -> Self {
        Self {
            hardware: Some(hardware),
            client,
            read_open: true,
            write_open: true,
            ..Default::default()
        }
    }
}

/// Wait-set entries for one slot, in service order
///
/// Read and write are only watched while the dispatcher is polling the slot;
/// once finalizing, the proxy drives those endpoints itself.
pub fn slot_wait_plan(
    slot: SlotId,
    polling: bool,
    read_open: bool,
    write_open: bool,
    control_pending: bool,
) -> Vec<WaitTag> {
    let mut plan = Vec::with_capacity(3);
    if polling && read_open {
        plan.push(WaitTag::Read(slot));
    }
    if polling && write_open {
        plan.push(WaitTag::Write(slot));
    }
    if control_pending {
        plan.push(WaitTag::Control(slot));
    }
    plan
}

pub struct Dispatcher {
    shared: Arc<EngineShared>,
    topology: TopologyReceiver,
    runtime: Vec<SlotRuntime>,
    wait_set: WaitSet<WaitTag>,
}

impl Dispatcher {
    pub fn new(shared: Arc<EngineShared>, topology: TopologyReceiver) -> Self {
        let runtime = shared.pool.iter().map(|_| SlotRuntime::default()).collect();
        Self {
            shared,
            topology,
            runtime,
            wait_set: WaitSet::new(),
        }
    }

    /// Run until shutdown or a fatal error
    pub fn run(mut self) -> Result<()> {
        info!("Dispatcher started");
        let result = self.dispatch();
        self.wait_set.unlink_all();
        match &result {
            Ok(()) => info!("Dispatcher stopped"),
            Err(e) => error!("Dispatcher failed: {}", e),
        }
        self.shared.stop();
        result
    }

    fn dispatch(&mut self) -> Result<()> {
        loop {
            for event in self.topology.drain()? {
                if event == TopologyEvent::Shutdown {
                    info!("Dispatcher shutting down");
                    return self.release_all();
                }
                debug!("Topology change: {:?}", event);
            }
            self.rebuild()?;
            self.serve()?;
        }
    }

    /// Dispatch completions until one of them needs a rebuild
    fn serve(&mut self) -> Result<()> {
        loop {
            let tag = self.wait_set.wait_any();
            trace!("Wait-set fired: {:?}", tag);
            let rebuild = match tag {
                WaitTag::Topology => true,
                WaitTag::Read(slot) => self.on_read(slot)?,
                WaitTag::Write(slot) => self.on_write(slot)?,
                WaitTag::Control(slot) => {
                    self.on_control(slot)?;
                    true
                }
            };
            if rebuild {
                return Ok(());
            }
        }
    }

    fn rebuild(&mut self) -> Result<()> {
        self.wait_set.unlink_all();

        for view in self.shared.pool.table.snapshot() {
            let slot = view.id;
            let i = slot.index();

            if view.shutdown_requested {
                self.finalize(slot, view.hardware)?;
                continue;
            }
            let Some(hardware) = view.hardware else {
                self.runtime[i] = SlotRuntime::default();
                continue;
            };
            if self.runtime[i].hardware.is_none() {
                self.runtime[i] = SlotRuntime::acquired(hardware, view.client);
            }

            let mut state = view.state;
            if state == SlotState::Initializing {
                self.advance_setup(slot)?;
                let setup_len = self.shared.profile.setup_sequence.len();
                if self.runtime[i].setup_done >= setup_len && view.buffers_mapped {
                    self.shared.set_state(slot, SlotState::SteadyState)?;
                    state = SlotState::SteadyState;
                }
            }
            self.runtime[i].state = state;

            if state == SlotState::SteadyState {
                if !self.runtime[i].started {
                    self.start_polling(slot)?;
                }
                self.arm_pending_write(slot)?;
            }
            self.submit_client_controls(slot)?;
        }

        self.register();
        Ok(())
    }

    fn register(&mut self) {
        self.wait_set
            .link(self.topology.doorbell(), WaitTag::Topology);

        for (i, rt) in self.runtime.iter().enumerate() {
            let Some(hardware) = &rt.hardware else {
                continue;
            };
            let slot = SlotId(i as u32);
            let polling = rt.state == SlotState::SteadyState && rt.started;
            let control_pending = !lock(&self.shared.slot(slot).pending).is_empty();

            for tag in slot_wait_plan(slot, polling, rt.read_open, rt.write_open, control_pending) {
                let event = match tag {
                    WaitTag::Read(_) => hardware.read.completion_event(),
                    WaitTag::Write(_) => hardware.write.completion_event(),
                    WaitTag::Control(_) => hardware.interface.control_event(),
                    WaitTag::Topology => continue,
                };
                self.wait_set.link(event, tag);
            }
        }
        debug!("Wait-set rebuilt with {} entries", self.wait_set.len());
    }

    /// Issue the next setup step if none is in flight
    fn advance_setup(&mut self, slot: SlotId) -> Result<()> {
        let rt = &mut self.runtime[slot.index()];
        let sequence = &self.shared.profile.setup_sequence;
        if rt.setup_issued > rt.setup_done || rt.setup_issued >= sequence.len() {
            return Ok(());
        }
        let Some(hardware) = rt.hardware.clone() else {
            return Ok(());
        };

        let step = rt.setup_issued;
        let setup = sequence[step];
        rt.setup_issued += 1;

        lock(&self.shared.slot(slot).pending).push(
            slot,
            PendingControl {
                setup,
                origin: ControlOrigin::Setup { step },
                payload: Vec::new(),
                submitted: true,
            },
        )?;
        hardware
            .interface
            .control_transfer(setup, vec![0u8; setup.length as usize])?;
        debug!(
            "{}: setup step {}/{} {}",
            slot,
            step + 1,
            sequence.len(),
            setup
        );
        Ok(())
    }

    /// Send the begin-polling packet and the first read
    fn start_polling(&mut self, slot: SlotId) -> Result<()> {
        let rt = &mut self.runtime[slot.index()];
        let Some(hardware) = rt.hardware.clone() else {
            return Ok(());
        };
        let packet = self.shared.profile.begin_polling_packet.clone();
        let len = packet.len();
        hardware.write.post_buffer(packet, len)?;
        rt.write_in_flight = true;
        rt.begin_in_flight = true;
        rt.started = true;

        self.post_read(slot, &hardware, Vec::new())?;
        info!("{}: polling started", slot);
        Ok(())
    }

    fn post_read(&self, slot: SlotId, hardware: &SlotHardware, mut buffer: Vec<u8>) -> Result<()> {
        let size = self.shared.profile.read_size;
        buffer.clear();
        buffer.resize(size, 0);
        let id = hardware.read.post_buffer(buffer, size)?;
        trace!("{}: read {:?} armed", slot, id);
        Ok(())
    }

    /// Hand a deposited client packet to the write endpoint
    fn arm_pending_write(&mut self, slot: SlotId) -> Result<()> {
        let rt = &mut self.runtime[slot.index()];
        if !rt.started || !rt.write_open || rt.write_in_flight {
            return Ok(());
        }
        let Some(hardware) = rt.hardware.clone() else {
            return Ok(());
        };
        if let Some(packet) = self.shared.slot(slot).mailbox.take_pending_write() {
            let len = packet.len();
            let id = hardware.write.post_buffer(packet, len)?;
            rt.write_in_flight = true;
            trace!("{}: write {:?} armed ({} bytes)", slot, id, len);
        }
        Ok(())
    }

    fn submit_client_controls(&mut self, slot: SlotId) -> Result<()> {
        let Some(hardware) = self.runtime[slot.index()].hardware.clone() else {
            return Ok(());
        };
        let mut pending = lock(&self.shared.slot(slot).pending);
        for entry in pending.unsubmitted() {
            let payload = std::mem::take(&mut entry.payload);
            hardware.interface.control_transfer(entry.setup, payload)?;
            entry.submitted = true;
            debug!("{}: passed control {} to hardware", slot, entry.setup);
        }
        Ok(())
    }

    /// Returns whether the wait-set must be rebuilt
    fn on_read(&mut self, slot: SlotId) -> Result<bool> {
        let Some(hardware) = self.runtime[slot.index()].hardware.clone() else {
            return Ok(true);
        };
        let Some(completion) = hardware.read.take_completions(1).into_iter().next() else {
            return Ok(false);
        };
        let report = completion.report;
        let mailbox = &self.shared.slot(slot).mailbox;

        if report.status.is_success() {
            let moved = (report.transferred_size as usize).min(completion.data.len());
            mailbox.deposit_completion(&completion.data[..moved], report);
            trace!("{}: read {:?} delivered {} bytes", slot, report.xfer_id, moved);
            self.post_read(slot, &hardware, completion.data)?;
            Ok(false)
        } else if report.status == XferStatus::DEVICE_UNPLUGGED {
            mailbox.record_report(Direction::Read, report);
            self.enter_finalizing(slot)?;
            Ok(true)
        } else {
            mailbox.record_report(Direction::Read, report);
            self.runtime[slot.index()].read_open = false;
            warn!(
                "{}: read failed with status {}, read path closed",
                slot, report.status
            );
            Ok(true)
        }
    }

    /// Returns whether the wait-set must be rebuilt
    fn on_write(&mut self, slot: SlotId) -> Result<bool> {
        let i = slot.index();
        let Some(hardware) = self.runtime[i].hardware.clone() else {
            return Ok(true);
        };
        let Some(completion) = hardware.write.take_completions(1).into_iter().next() else {
            return Ok(false);
        };
        let report = completion.report;
        let rt = &mut self.runtime[i];
        rt.write_in_flight = false;
        let was_begin = std::mem::take(&mut rt.begin_in_flight);
        let adapter = self.shared.slot(slot);

        if report.status.is_success() {
            if !was_begin {
                adapter.mailbox.record_report(Direction::Write, report);
            }
            adapter.signals.write.signal();
            trace!("{}: write {:?} done", slot, report.xfer_id);
            self.arm_pending_write(slot)?;
            Ok(false)
        } else if report.status == XferStatus::DEVICE_UNPLUGGED {
            adapter.mailbox.record_report(Direction::Write, report);
            self.enter_finalizing(slot)?;
            Ok(true)
        } else {
            adapter.mailbox.record_report(Direction::Write, report);
            self.runtime[i].write_open = false;
            warn!(
                "{}: write failed with status {}, write path closed",
                slot, report.status
            );
            Ok(true)
        }
    }

    fn on_control(&mut self, slot: SlotId) -> Result<()> {
        let i = slot.index();
        let Some(hardware) = self.runtime[i].hardware.clone() else {
            return Ok(());
        };
        let Some(completion) = hardware.interface.take_control_completion() else {
            return Ok(());
        };
        let adapter = self.shared.slot(slot);
        let Some(entry) = lock(&adapter.pending).pop_oldest() else {
            warn!("{}: control completion with nothing pending", slot);
            return Ok(());
        };

        let report = completion.report;
        let moved = (report.transferred_size as usize).min(completion.data.len());
        match entry.origin {
            ControlOrigin::Setup { step } => {
                if !report.status.is_success() {
                    return Err(EngineError::SetupFailed {
                        slot,
                        setup: entry.setup,
                        status: report.status,
                    });
                }
                let response = if entry.setup.is_device_to_host() {
                    completion.data[..moved].to_vec()
                } else {
                    Vec::new()
                };
                lock(&adapter.cache).record(entry.setup, response, report.transferred_size);
                self.runtime[i].setup_done += 1;
                debug!("{}: setup step {} answered ({} bytes)", slot, step + 1, moved);
            }
            ControlOrigin::Client {
                client,
                buffer,
                reply,
            } => {
                if entry.setup.is_device_to_host() {
                    if let Some(dst) = buffer {
                        self.shared
                            .transfer
                            .copy_out(client, &completion.data[..moved], dst)?;
                    }
                }
                *lock(&adapter.control_report) = report;
                let _ = reply.send(report);
                adapter.signals.control.signal();
                debug!(
                    "{}: control {} completed with status {}",
                    slot, entry.setup, report.status
                );
            }
        }
        Ok(())
    }

    fn enter_finalizing(&mut self, slot: SlotId) -> Result<()> {
        let rt = &mut self.runtime[slot.index()];
        if rt.state != SlotState::SteadyState {
            return Ok(());
        }
        rt.state = SlotState::Finalizing;
        warn!("{}: device unplugged", slot);
        self.shared.set_state(slot, SlotState::Finalizing)?;
        // Wake a client blocked on a write that will never complete
        self.shared.slot(slot).signals.write.signal();
        Ok(())
    }

    /// Close the slot's endpoints and return it to the pool
    fn finalize(&mut self, slot: SlotId, hardware: Option<Arc<SlotHardware>>) -> Result<()> {
        if let Some(hardware) = hardware {
            for endpoint in [&hardware.read, &hardware.write] {
                if let Err(e) = endpoint.close() {
                    warn!(
                        "{}: closing endpoint {:#04x} failed: {}",
                        slot,
                        endpoint.address(),
                        e
                    );
                }
            }
        }

        let adapter = self.shared.slot(slot);
        adapter.reset();
        let from = {
            let mut records = self.shared.pool.table.lock();
            let from = records[slot.index()].state;
            records[slot.index()] = SlotRecord::default();
            self.shared.pool.table.notify_all();
            from
        };
        self.runtime[slot.index()] = SlotRuntime::default();

        adapter.signals.state_change.signal();
        adapter.signals.control.signal();
        if from != SlotState::Unacquired {
            self.shared.record(
                slot,
                CapturedCall::StateChanged {
                    from,
                    to: SlotState::Unacquired,
                },
            );
        }
        self.shared.record(slot, CapturedCall::Released);
        info!("{}: released ({} -> {})", slot, from, SlotState::Unacquired);
        Ok(())
    }

    fn release_all(&mut self) -> Result<()> {
        for view in self.shared.pool.table.snapshot() {
            if view.state.is_acquired() {
                self.finalize(view.id, view.hardware)?;
            }
        }
        Ok(())
    }
}

/// Spawn the dispatcher thread
///
/// The thread runs until a `Shutdown` topology event or a fatal error; the
/// join handle yields that error.
pub fn spawn_dispatcher(
    shared: Arc<EngineShared>,
    topology: TopologyReceiver,
) -> Result<std::thread::JoinHandle<Result<()>>> {
    std::thread::Builder::new()
        .name("gc-dispatcher".to_string())
        .spawn(move || Dispatcher::new(shared, topology).run())
        .map_err(EngineError::Spawn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::device::{AdapterProfile, open_hardware};
    use crate::usb::foreign::ForeignTransfer;
    use common::create_topology_bridge;
    use common::test_utils::{MockDevice, SimulatedAddressSpace, random_controller_packet};
    use protocol::{ControlSetup, ForeignAddr, TransferReport};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[test]
    fn test_plan_orders_read_write_control() {
        let slot = SlotId(1);
        assert_eq!(
            slot_wait_plan(slot, true, true, true, true),
            vec![
                WaitTag::Read(slot),
                WaitTag::Write(slot),
                WaitTag::Control(slot)
            ]
        );
    }

    #[test]
    fn test_plan_skips_closed_paths() {
        let slot = SlotId(0);
        assert_eq!(
            slot_wait_plan(slot, true, false, true, false),
            vec![WaitTag::Write(slot)]
        );
        // Not polling: only control transfers are watched
        assert_eq!(
            slot_wait_plan(slot, false, true, true, true),
            vec![WaitTag::Control(slot)]
        );
        assert!(slot_wait_plan(slot, false, true, true, false).is_empty());
    }

    fn steady_dispatcher(device: &MockDevice) -> (Dispatcher, Arc<EngineShared>) {
        let (tx, rx) = create_topology_bridge();
        let space = SimulatedAddressSpace::new();
        let profile = AdapterProfile::default();
        let hardware = open_hardware(device.interface(), &profile).unwrap();
        let shared = Arc::new(EngineShared::new(
            profile,
            ForeignTransfer::new(space.mapper()),
            tx,
            None,
        ));
        shared.pool.table.lock()[0] = SlotRecord {
            state: SlotState::SteadyState,
            client: Some(ClientProcess(9)),
            read_buffer: Some(ForeignAddr(0x1000)),
            write_buffer: Some(ForeignAddr(0x2000)),
            hardware: Some(Arc::new(hardware)),
            ..Default::default()
        };
        (Dispatcher::new(Arc::clone(&shared), rx), shared)
    }

    #[test]
    fn test_simultaneous_completions_served_in_priority_order() {
        let device = MockDevice::new();
        let (mut dispatcher, shared) = steady_dispatcher(&device);
        let slot = SlotId(0);

        dispatcher.rebuild().unwrap();
        assert_eq!(device.pending_reads(), 1);
        assert_eq!(device.written_payloads(), vec![vec![0x13]]);

        // A finalizing-style pass-through control, answered immediately
        let (reply, _rx) = oneshot::channel::<TransferReport>();
        lock(&shared.slot(slot).pending)
            .push(
                slot,
                PendingControl {
                    setup: ControlSetup::new(0x21, 0x0b, 1, 0, 0),
                    origin: ControlOrigin::Client {
                        client: ClientProcess(9),
                        buffer: None,
                        reply,
                    },
                    payload: Vec::new(),
                    submitted: false,
                },
            )
            .unwrap();
        dispatcher.rebuild().unwrap();

        // All three ready before the dispatcher looks
        assert!(device.complete_write().is_some());
        assert!(device.complete_read(&random_controller_packet()));

        let mut served = Vec::new();
        for _ in 0..3 {
            let tag = dispatcher
                .wait_set
                .wait_any_timeout(Duration::from_secs(5))
                .unwrap();
            served.push(tag);
            match tag {
                WaitTag::Read(s) => {
                    dispatcher.on_read(s).unwrap();
                }
                WaitTag::Write(s) => {
                    dispatcher.on_write(s).unwrap();
                }
                WaitTag::Control(s) => dispatcher.on_control(s).unwrap(),
                WaitTag::Topology => panic!("unexpected topology wake"),
            }
        }
        assert_eq!(
            served,
            vec![
                WaitTag::Read(slot),
                WaitTag::Write(slot),
                WaitTag::Control(slot)
            ]
        );
        // The read was re-armed, the control report stored
        assert_eq!(device.pending_reads(), 1);
        assert!(!lock(&shared.slot(slot).control_report).is_sentinel());
    }

    #[test]
    fn test_failed_read_closes_read_path() {
        let device = MockDevice::new();
        let (mut dispatcher, shared) = steady_dispatcher(&device);
        let slot = SlotId(0);
        dispatcher.rebuild().unwrap();

        assert!(device.complete_read_with_status(XferStatus::TRANSFER_FAILED, &[]));
        assert!(dispatcher.on_read(slot).unwrap());
        assert_eq!(device.pending_reads(), 0);

        dispatcher.rebuild().unwrap();
        assert!(!dispatcher.wait_set.tags().contains(&WaitTag::Read(slot)));
        assert_eq!(
            shared.slot(slot).mailbox.latest_report(Direction::Read).status,
            XferStatus::TRANSFER_FAILED
        );
        // Still steady: a failed read is data, not a lifecycle event
        assert_eq!(shared.pool.table.view(slot).state, SlotState::SteadyState);
    }

    #[test]
    fn test_unplug_enters_finalizing_and_stops_polling() {
        let device = MockDevice::new();
        let (mut dispatcher, shared) = steady_dispatcher(&device);
        let slot = SlotId(0);
        dispatcher.rebuild().unwrap();
        let reads_before = device.post_count(0x81);

        device.unplug();
        assert!(dispatcher.on_read(slot).unwrap());
        assert_eq!(shared.pool.table.view(slot).state, SlotState::Finalizing);
        assert!(shared.slot(slot).signals.state_change.is_signaled());

        dispatcher.rebuild().unwrap();
        assert_eq!(dispatcher.wait_set.tags(), vec![WaitTag::Topology]);
        assert_eq!(device.post_count(0x81), reads_before);
    }
}
