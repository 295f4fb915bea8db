//! Engine integration tests
//!
//! Drives the full engine (dispatcher thread + proxy calls) against
//! `MockDevice` adapters and a simulated client address space.
//!
//! Run with: `cargo test -p server --test engine_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockDevice, SimulatedAddressSpace, gc_setup_responses,
    random_controller_packet, wait_until,
};
use protocol::{
    CaptureReader, CapturedCall, ClientProcess, ControlSetup, Direction, ForeignAddr,
    MAX_ADAPTERS, SlotId, SlotState, TransferReport, XferId, XferStatus,
};
use server::capture::CaptureRecorder;
use server::usb::{
    AdapterHandle, AdapterProfile, Engine, EngineError, EngineSettings, gamecube_setup_sequence,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const CLIENT: ClientProcess = ClientProcess(100);
// Deliberately not page aligned
const READ_BUF: ForeignAddr = ForeignAddr(0x10_0ff0);
const WRITE_BUF: ForeignAddr = ForeignAddr(0x20_0000);
const CTRL_BUF: ForeignAddr = ForeignAddr(0x30_0000);

const SET_PROTOCOL: ControlSetup = ControlSetup::new(0x21, 0x0b, 0x0001, 0, 0);

fn start_engine(space: &SimulatedAddressSpace, capture: Option<CaptureRecorder>) -> Engine {
    Engine::start(
        AdapterProfile::default(),
        EngineSettings {
            open_retry_delay: Duration::from_millis(1),
            open_retry_limit: 1000,
        },
        space.mapper(),
        capture,
    )
    .unwrap()
}

fn wait_for_state(engine: &Engine, slot: SlotId, state: SlotState) -> bool {
    wait_until(DEFAULT_TEST_TIMEOUT, || {
        engine.slot_state(slot).map(|s| s == state).unwrap_or(false)
    })
}

/// Open an adapter and map both packet buffers so it reaches steady state
fn open_steady(engine: &Engine, device: &MockDevice) -> AdapterHandle {
    let handle = engine.open_adapter(CLIENT, device.interface()).unwrap();
    let slot = handle.slot();
    engine
        .map_packet_buffer(slot, Direction::Read, READ_BUF)
        .unwrap();
    engine
        .map_packet_buffer(slot, Direction::Write, WRITE_BUF)
        .unwrap();
    assert!(wait_for_state(engine, slot, SlotState::SteadyState));
    handle
}

mod lifecycle {
    use super::*;

    #[test]
    fn test_setup_then_synthesized_read() {
        let space = SimulatedAddressSpace::new();
        let engine = start_engine(&space, None);
        let device = MockDevice::gamecube();

        let handle = engine.open_adapter(CLIENT, device.interface()).unwrap();
        let slot = handle.slot();
        assert_eq!(slot, SlotId(0));
        assert!(handle.state_change_event().is_signaled());

        // The first read maps the read buffer implicitly and waits for setup
        engine
            .map_packet_buffer(slot, Direction::Write, WRITE_BUF)
            .unwrap();
        let report = engine.read_packet(slot, READ_BUF, 0x25).unwrap();

        assert_eq!(engine.slot_state(slot).unwrap(), SlotState::SteadyState);
        assert_eq!(device.control_calls(), gamecube_setup_sequence());
        assert_eq!(report, TransferReport::synthesized(0x25));
        assert_eq!(report.xfer_id, XferId(0));
        assert_eq!(report.transferred_size, 0x25);
        assert!(handle.read_event().is_signaled());

        // Polling started: begin packet out, one read armed
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            device.written_payloads() == vec![vec![0x13]] && device.pending_reads() == 1
        }));
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_real_read_completion_is_returned_verbatim() {
        let space = SimulatedAddressSpace::new();
        let engine = start_engine(&space, None);
        let device = MockDevice::gamecube();
        let handle = open_steady(&engine, &device);
        let slot = handle.slot();

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || device.pending_reads() == 1));
        let packet = random_controller_packet();
        assert!(device.complete_read(&packet));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            engine.adapter_packet_state().packets[0].as_slice() == packet.as_slice()
        }));

        let report = engine.read_packet(slot, READ_BUF, 0x25).unwrap();
        assert_eq!(report.status, XferStatus::SUCCESS);
        assert_eq!(report.transferred_size, 0x25);
        assert_ne!(report.xfer_id, XferId(0));
        assert_eq!(space.read(CLIENT, READ_BUF, 0x25), packet);

        // Re-armed after the completion
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || device.pending_reads() == 1));
        assert_eq!(device.post_count(0x81), 2);
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_unplug_switches_to_synchronous_reads() {
        let space = SimulatedAddressSpace::new();
        let engine = Arc::new(start_engine(&space, None));
        let device = MockDevice::gamecube();
        let handle = open_steady(&engine, &device);
        let slot = handle.slot();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || device.pending_reads() == 1));

        handle.state_change_event().clear();
        device.unplug();
        assert!(wait_for_state(&engine, slot, SlotState::Finalizing));
        assert!(handle.state_change_event().is_signaled());

        // No automatic re-arm
        let reads = device.post_count(0x81);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(device.post_count(0x81), reads);
        assert_eq!(device.pending_reads(), 0);

        let reader = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.read_packet(slot, READ_BUF, 0x25))
        };
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || device.pending_reads() == 1));
        let packet = random_controller_packet();
        assert!(device.complete_read(&packet));

        let report = reader.join().unwrap().unwrap();
        assert_eq!(report.status, XferStatus::SUCCESS);
        assert_eq!(space.read(CLIENT, READ_BUF, 0x25), packet);
        assert_eq!(device.post_count(0x81), reads + 1);

        // Finalizing never regresses
        assert_eq!(engine.slot_state(slot).unwrap(), SlotState::Finalizing);
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_close_releases_slot() {
        let space = SimulatedAddressSpace::new();
        let engine = start_engine(&space, None);
        let device = MockDevice::gamecube();
        let handle = open_steady(&engine, &device);
        let slot = handle.slot();

        engine.close_adapter(slot).unwrap();
        // Closing twice before release is harmless
        let _ = engine.close_adapter(slot);
        assert!(wait_for_state(&engine, slot, SlotState::Unacquired));
        assert!(device.is_closed(0x81));
        assert!(device.is_closed(0x02));
        assert!(matches!(
            engine.read_packet(slot, READ_BUF, 0x25),
            Err(EngineError::SlotNotAcquired(_))
        ));
        assert_eq!(engine.adapter_packet_state().in_use_mask, 0);

        // The slot is reusable and runs setup again
        let again = MockDevice::gamecube();
        let handle = open_steady(&engine, &again);
        assert_eq!(handle.slot(), slot);
        assert_eq!(again.control_calls().len(), 6);
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_close_failure_is_tolerated() {
        let space = SimulatedAddressSpace::new();
        let engine = start_engine(&space, None);
        let device = MockDevice::gamecube();
        let handle = open_steady(&engine, &device);

        device.fail_close(true);
        engine.close_adapter(handle.slot()).unwrap();
        assert!(wait_for_state(&engine, handle.slot(), SlotState::Unacquired));
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_setup_failure_stops_engine() {
        let space = SimulatedAddressSpace::new();
        let engine = start_engine(&space, None);
        let device = MockDevice::gamecube();
        device.fail_control(gamecube_setup_sequence()[0], XferStatus::TRANSFER_FAILED);

        let handle = engine.open_adapter(CLIENT, device.interface()).unwrap();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            matches!(
                engine.read_packet(handle.slot(), READ_BUF, 0x25),
                Err(EngineError::DispatcherStopped)
            )
        }));
        assert!(matches!(
            engine.shutdown(),
            Err(EngineError::SetupFailed { .. })
        ));
    }

    #[test]
    fn test_dispatcher_failure_wakes_synchronous_reader() {
        let space = SimulatedAddressSpace::new();
        let engine = Arc::new(start_engine(&space, None));
        let device = MockDevice::gamecube();
        let handle = open_steady(&engine, &device);
        let slot = handle.slot();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || device.pending_reads() == 1));

        device.unplug();
        assert!(wait_for_state(&engine, slot, SlotState::Finalizing));

        // Blocks on the endpoint; the read is never completed
        let reader = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.read_packet(slot, READ_BUF, 0x25))
        };
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || device.pending_reads() == 1));

        // A second adapter failing setup takes the dispatcher down
        let broken = MockDevice::gamecube();
        broken.fail_control(gamecube_setup_sequence()[0], XferStatus::TRANSFER_FAILED);
        let _second = engine.open_adapter(CLIENT, broken.interface()).unwrap();

        assert!(matches!(
            reader.join().unwrap(),
            Err(EngineError::DispatcherStopped)
        ));
        assert!(matches!(
            engine.shutdown(),
            Err(EngineError::SetupFailed { .. })
        ));
    }
}

mod capacity {
    use super::*;

    #[test]
    fn test_fifth_adapter_is_rejected() {
        let space = SimulatedAddressSpace::new();
        let engine = start_engine(&space, None);
        let devices: Vec<_> = (0..MAX_ADAPTERS).map(|_| MockDevice::gamecube()).collect();
        let slots: Vec<_> = devices
            .iter()
            .map(|d| engine.open_adapter(CLIENT, d.interface()).unwrap().slot())
            .collect();
        assert_eq!(slots, vec![SlotId(0), SlotId(1), SlotId(2), SlotId(3)]);
        assert_eq!(engine.adapter_packet_state().in_use_mask, 0b1111);

        let extra = MockDevice::gamecube();
        assert!(matches!(
            engine.open_adapter(CLIENT, extra.interface()),
            Err(EngineError::CapacityExhausted { max: 4 })
        ));
        // Nothing leaks from the rejected adapter
        assert!(extra.is_closed(0x81));
        assert!(extra.is_closed(0x02));
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_open_waits_for_shutting_down_slot() {
        let space = SimulatedAddressSpace::new();
        let engine = start_engine(&space, None);
        let devices: Vec<_> = (0..MAX_ADAPTERS).map(|_| MockDevice::gamecube()).collect();
        for device in &devices {
            engine.open_adapter(CLIENT, device.interface()).unwrap();
        }

        engine.close_adapter(SlotId(2)).unwrap();
        let late = MockDevice::gamecube();
        let handle = engine.open_adapter(CLIENT, late.interface()).unwrap();
        assert_eq!(handle.slot(), SlotId(2));
        assert!(devices[2].is_closed(0x81));
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_missing_endpoint_rejected_before_binding() {
        let space = SimulatedAddressSpace::new();
        let engine = start_engine(&space, None);
        let device = MockDevice::with_descriptors(Vec::new());

        assert!(matches!(
            engine.open_adapter(CLIENT, device.interface()),
            Err(EngineError::EndpointNotFound { .. })
        ));
        assert_eq!(engine.adapter_packet_state().in_use_mask, 0);
        engine.shutdown().unwrap();
    }
}

mod control {
    use super::*;

    #[test]
    fn test_replay_from_cache_without_hardware() {
        let space = SimulatedAddressSpace::new();
        let engine = start_engine(&space, None);
        let device = MockDevice::gamecube();
        let handle = open_steady(&engine, &device);
        let slot = handle.slot();

        for (setup, response) in gc_setup_responses() {
            handle.control_event().clear();
            let report = engine
                .submit_control_transfer(slot, setup, Some(CTRL_BUF))
                .unwrap();
            assert_eq!(report.status, XferStatus::SUCCESS);
            assert_eq!(report.requested_size, setup.length as u32);
            assert_eq!(report.transferred_size, response.len() as u32);
            assert_eq!(space.read(CLIENT, CTRL_BUF, response.len()), response);
            assert_eq!(engine.control_report(slot).unwrap(), report);
            assert!(handle.control_event().is_signaled());
        }

        let report = engine
            .submit_control_transfer(slot, SET_PROTOCOL, None)
            .unwrap();
        assert_eq!(report.status, XferStatus::SUCCESS);
        assert_eq!(device.control_calls(), gamecube_setup_sequence());
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_unknown_request_in_steady_state() {
        let space = SimulatedAddressSpace::new();
        let engine = start_engine(&space, None);
        let device = MockDevice::gamecube();
        let handle = open_steady(&engine, &device);

        let unknown = ControlSetup::new(0x80, 0x06, 0x0100, 0, 0x12);
        assert!(matches!(
            engine.submit_control_transfer(handle.slot(), unknown, Some(CTRL_BUF)),
            Err(EngineError::UnexpectedControlRequest { .. })
        ));
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_pass_through_after_unplug_is_bounded() {
        let space = SimulatedAddressSpace::new();
        let engine = Arc::new(start_engine(&space, None));
        let device = MockDevice::gamecube();
        let handle = open_steady(&engine, &device);
        let slot = handle.slot();

        device.hold_controls(true);
        device.unplug();
        assert!(wait_for_state(&engine, slot, SlotState::Finalizing));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || engine.submit_control_transfer(slot, SET_PROTOCOL, None))
            })
            .collect();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            device.control_calls().len() == 6 + 4
        }));

        assert!(matches!(
            engine.submit_control_transfer(slot, SET_PROTOCOL, None),
            Err(EngineError::TooManyPendingControl { max: 4, .. })
        ));

        device.release_controls();
        for waiter in waiters {
            let report = waiter.join().unwrap().unwrap();
            assert_eq!(report.status, XferStatus::SUCCESS);
        }
        assert!(handle.control_event().is_signaled());
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_pass_through_copies_device_to_host_data() {
        let space = SimulatedAddressSpace::new();
        let engine = start_engine(&space, None);
        let device = MockDevice::gamecube();
        let handle = open_steady(&engine, &device);
        let slot = handle.slot();

        let serial = ControlSetup::new(0x80, 0x06, 0x0303, 0x0409, 0x10);
        device.respond(serial, vec![0x0a, 0x03, b'G', 0, b'C', 0]);
        device.unplug();
        assert!(wait_for_state(&engine, slot, SlotState::Finalizing));

        let report = engine
            .submit_control_transfer(slot, serial, Some(CTRL_BUF))
            .unwrap();
        assert_eq!(report.transferred_size, 6);
        assert_eq!(
            space.read(CLIENT, CTRL_BUF, 6),
            vec![0x0a, 0x03, b'G', 0, b'C', 0]
        );
        assert_eq!(device.control_calls().last(), Some(&serial));
        engine.shutdown().unwrap();
    }
}

mod writes {
    use super::*;

    const RUMBLE_ON: [u8; 5] = [0x11, 0x01, 0x00, 0x00, 0x00];
    const RUMBLE_OFF: [u8; 5] = [0x11, 0x00, 0x00, 0x00, 0x00];

    #[test]
    fn test_deposited_write_reaches_hardware() {
        let space = SimulatedAddressSpace::new();
        let engine = start_engine(&space, None);
        let device = MockDevice::gamecube();
        let handle = open_steady(&engine, &device);
        let slot = handle.slot();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || device.pending_writes() == 1));

        space.write(CLIENT, WRITE_BUF, &RUMBLE_ON);
        let report = engine.write_packet(slot, WRITE_BUF, 5).unwrap();
        assert_eq!(report, TransferReport::synthesized(5));
        assert!(handle.write_event().is_signaled());

        // Armed once the begin packet completes
        assert_eq!(device.complete_write(), Some(vec![0x13]));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            device.written_payloads().len() == 2
        }));
        assert_eq!(device.written_payloads()[1], RUMBLE_ON.to_vec());

        assert_eq!(device.complete_write(), Some(RUMBLE_ON.to_vec()));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            let report = engine.write_packet(slot, WRITE_BUF, 5).unwrap();
            report.xfer_id != XferId(0)
        }));
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_only_latest_write_is_sent() {
        let space = SimulatedAddressSpace::new();
        let engine = start_engine(&space, None);
        let device = MockDevice::gamecube();
        let handle = open_steady(&engine, &device);
        let slot = handle.slot();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || device.pending_writes() == 1));

        space.write(CLIENT, WRITE_BUF, &RUMBLE_ON);
        engine.write_packet(slot, WRITE_BUF, 5).unwrap();
        space.write(CLIENT, WRITE_BUF, &RUMBLE_OFF);
        engine.write_packet(slot, WRITE_BUF, 5).unwrap();

        device.complete_write();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || device.pending_writes() == 1));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(
            device.written_payloads(),
            vec![vec![0x13], RUMBLE_OFF.to_vec()]
        );
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_client_begin_packet_not_forwarded() {
        let space = SimulatedAddressSpace::new();
        let engine = start_engine(&space, None);
        let device = MockDevice::gamecube();
        let handle = open_steady(&engine, &device);

        space.write(CLIENT, WRITE_BUF, &[0x13]);
        let report = engine.write_packet(handle.slot(), WRITE_BUF, 1).unwrap();
        assert_eq!(report, TransferReport::synthesized(1));

        thread::sleep(Duration::from_millis(20));
        assert_eq!(device.written_payloads(), vec![vec![0x13]]);
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_failed_write_is_reported_not_fatal() {
        let space = SimulatedAddressSpace::new();
        let engine = start_engine(&space, None);
        let device = MockDevice::gamecube();
        let handle = open_steady(&engine, &device);
        let slot = handle.slot();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || device.pending_writes() == 1));

        space.write(CLIENT, WRITE_BUF, &RUMBLE_ON);
        engine.write_packet(slot, WRITE_BUF, 5).unwrap();
        device.complete_write();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || device.pending_writes() == 1));
        device.complete_write_with_status(XferStatus::TRANSFER_FAILED);

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            engine.write_packet(slot, WRITE_BUF, 5).unwrap().status == XferStatus::TRANSFER_FAILED
        }));
        assert_eq!(engine.slot_state(slot).unwrap(), SlotState::SteadyState);
        engine.shutdown().unwrap();
    }
}

mod capture {
    use super::*;

    #[test]
    fn test_session_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.cap");
        let space = SimulatedAddressSpace::new();
        let engine = start_engine(&space, Some(CaptureRecorder::create(&path).unwrap()));
        let device = MockDevice::gamecube();

        let handle = open_steady(&engine, &device);
        engine.read_packet(handle.slot(), READ_BUF, 0x25).unwrap();
        engine.close_adapter(handle.slot()).unwrap();
        assert!(wait_for_state(&engine, handle.slot(), SlotState::Unacquired));
        engine.shutdown().unwrap();
        drop(engine);

        let file = std::fs::File::open(&path).unwrap();
        let calls: Vec<_> = CaptureReader::new(file)
            .map(|record| record.unwrap().call)
            .collect();
        assert_eq!(calls[0], CapturedCall::Opened { client: CLIENT });
        assert!(calls.contains(&CapturedCall::StateChanged {
            from: SlotState::Initializing,
            to: SlotState::SteadyState,
        }));
        assert!(
            calls
                .iter()
                .any(|c| matches!(c, CapturedCall::ReadPacket { .. }))
        );
        assert!(calls.contains(&CapturedCall::CloseRequested));
        assert_eq!(calls.last(), Some(&CapturedCall::Released));
    }
}
