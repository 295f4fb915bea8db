//! Test utilities for the adapter proxy
//!
//! Provides a scriptable transport ([`MockDevice`]), an in-memory client
//! address space ([`SimulatedAddressSpace`]) and small helpers shared by the
//! unit and integration tests of every crate.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockDevice, gc_setup_responses};
//! use common::transport::UsbInterface;
//! use protocol::ControlSetup;
//!
//! let device = MockDevice::new();
//! let interface = device.interface();
//! let setup = ControlSetup::new(0x80, 0x06, 0x0200, 0, 0x29);
//! device.respond(setup, vec![0x09; 0x29]);
//!
//! interface.control_transfer(setup, vec![0; 0x29]).unwrap();
//! let completion = interface.take_control_completion().unwrap();
//! assert_eq!(completion.data, vec![0x09; 0x29]);
//! # let _ = gc_setup_responses();
//! ```

use crate::error::{MapError, TransportError};
use crate::memory::ForeignMapper;
use crate::signal::{Event, lock};
use crate::transport::{Completion, Endpoint, EndpointDescriptor, UsbInterface};
use protocol::{
    ClientProcess, ControlSetup, ForeignAddr, PAGE_SIZE, READ_PACKET_SIZE, TransferReport,
    XferId, XferStatus,
};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Random adapter input report with the usual 0x21 report id
pub fn random_controller_packet() -> Vec<u8> {
    let mut packet = vec![0u8; READ_PACKET_SIZE];
    packet[0] = 0x21;
    rand::rng().fill(&mut packet[1..]);
    packet
}

/// Endpoint layout of a real adapter: interrupt IN 0x81, interrupt OUT 0x02
pub fn gc_endpoint_descriptors() -> Vec<EndpointDescriptor> {
    vec![
        EndpointDescriptor {
            address: 0x81,
            max_packet_size: 37,
            interval: 8,
        },
        EndpointDescriptor {
            address: 0x02,
            max_packet_size: 5,
            interval: 8,
        },
    ]
}

/// Plausible answers for the adapter's device-to-host setup requests
pub fn gc_setup_responses() -> Vec<(ControlSetup, Vec<u8>)> {
    let mut config = vec![
        0x09, 0x02, 0x29, 0x00, 0x01, 0x01, 0x00, 0xe0, 0xfa, 0x09, 0x04, 0x00, 0x00, 0x02, 0x03,
        0x00, 0x00, 0x00,
    ];
    config.resize(0x29, 0);
    let mut report = vec![0x05, 0x05, 0x09, 0x00, 0xa1, 0x01];
    report.resize(0xd6, 0);
    vec![
        (ControlSetup::new(0x80, 0x06, 0x0200, 0, 0x29), config),
        (ControlSetup::new(0x81, 0x06, 0x2200, 0, 0xd6), report),
        (
            ControlSetup::new(0x80, 0x06, 0x0300, 0, 0xff),
            vec![0x04, 0x03, 0x09, 0x04],
        ),
    ]
}

/// One transport call observed by a [`MockDevice`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    OpenEndpoint(u8),
    PopulateRing(u8),
    Post { address: u8, size: usize, data: Vec<u8> },
    Control(ControlSetup),
    Close(u8),
}

/// Scriptable transport
///
/// Control transfers complete as soon as they are submitted unless held.
/// Read and write transfers stay posted until the test completes them.
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<MockState>,
}

struct MockState {
    descriptors: Vec<EndpointDescriptor>,
    calls: Mutex<Vec<TransportCall>>,
    responses: Mutex<HashMap<ControlSetup, Vec<u8>>>,
    control_failures: Mutex<HashMap<ControlSetup, XferStatus>>,
    hold_controls: AtomicBool,
    held: Mutex<VecDeque<Completion>>,
    control_done: Mutex<VecDeque<Completion>>,
    control_event: Event,
    state_change: Event,
    next_id: AtomicU32,
    endpoints: Mutex<HashMap<u8, Arc<MockEndpointState>>>,
    fail_close: AtomicBool,
    auto_read: Mutex<Option<Vec<u8>>>,
}

struct MockEndpointState {
    address: u8,
    posted: Mutex<VecDeque<(XferId, Vec<u8>, usize)>>,
    done: Mutex<VecDeque<Completion>>,
    event: Event,
    closed: AtomicBool,
}

impl MockEndpointState {
    fn finish(&self, id: XferId, mut data: Vec<u8>, size: usize, status: XferStatus, moved: usize) {
        data.truncate(size.max(moved));
        let completion = Completion {
            report: TransferReport {
                xfer_id: id,
                status,
                requested_size: size as u32,
                transferred_size: moved as u32,
            },
            data,
        };
        let mut done = lock(&self.done);
        done.push_back(completion);
        self.event.signal();
    }
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_descriptors(gc_endpoint_descriptors())
    }

    pub fn with_descriptors(descriptors: Vec<EndpointDescriptor>) -> Self {
        Self {
            state: Arc::new(MockState {
                descriptors,
                calls: Mutex::new(Vec::new()),
                responses: Mutex::new(HashMap::new()),
                control_failures: Mutex::new(HashMap::new()),
                hold_controls: AtomicBool::new(false),
                held: Mutex::new(VecDeque::new()),
                control_done: Mutex::new(VecDeque::new()),
                control_event: Event::new(),
                state_change: Event::new(),
                next_id: AtomicU32::new(1),
                endpoints: Mutex::new(HashMap::new()),
                fail_close: AtomicBool::new(false),
                auto_read: Mutex::new(None),
            }),
        }
    }

    /// Mock preloaded with [`gc_setup_responses`]
    pub fn gamecube() -> Self {
        let device = Self::new();
        for (setup, data) in gc_setup_responses() {
            device.respond(setup, data);
        }
        device
    }

    /// Interface handle to give to the engine
    pub fn interface(&self) -> Box<dyn UsbInterface> {
        Box::new(MockInterface {
            state: Arc::clone(&self.state),
        })
    }

    /// Bytes a device-to-host control request answers with
    pub fn respond(&self, setup: ControlSetup, data: Vec<u8>) {
        lock(&self.state.responses).insert(setup, data);
    }

    /// Make a control request complete with `status`
    pub fn fail_control(&self, setup: ControlSetup, status: XferStatus) {
        lock(&self.state.control_failures).insert(setup, status);
    }

    /// Keep control completions back until [`MockDevice::release_controls`]
    pub fn hold_controls(&self, hold: bool) {
        self.state.hold_controls.store(hold, Ordering::SeqCst);
    }

    pub fn release_controls(&self) {
        let held: Vec<_> = lock(&self.state.held).drain(..).collect();
        let mut done = lock(&self.state.control_done);
        done.extend(held);
        if !done.is_empty() {
            self.state.control_event.signal();
        }
    }

    /// Make endpoint close report failure
    pub fn fail_close(&self, fail: bool) {
        self.state.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Complete every read as soon as it is posted with `packet`
    pub fn auto_complete_reads(&self, packet: Option<Vec<u8>>) {
        *lock(&self.state.auto_read) = packet;
    }

    /// Complete the oldest posted read with `data`
    ///
    /// Returns false when no read is posted.
    pub fn complete_read(&self, data: &[u8]) -> bool {
        self.complete_read_with_status(XferStatus::SUCCESS, data)
    }

    pub fn complete_read_with_status(&self, status: XferStatus, data: &[u8]) -> bool {
        let Some(ep) = self.endpoint_where(|a| a & 0x80 != 0) else {
            return false;
        };
        let Some((id, mut buffer, size)) = lock(&ep.posted).pop_front() else {
            return false;
        };
        let moved = data.len().min(size);
        if buffer.len() < size {
            buffer.resize(size, 0);
        }
        buffer[..moved].copy_from_slice(&data[..moved]);
        ep.finish(id, buffer, size, status, moved);
        true
    }

    /// Complete the oldest posted write, returning its payload
    pub fn complete_write(&self) -> Option<Vec<u8>> {
        self.complete_write_with_status(XferStatus::SUCCESS)
    }

    pub fn complete_write_with_status(&self, status: XferStatus) -> Option<Vec<u8>> {
        let ep = self.endpoint_where(|a| a & 0x80 == 0)?;
        let (id, buffer, size) = lock(&ep.posted).pop_front()?;
        let payload = buffer[..size.min(buffer.len())].to_vec();
        let moved = if status.is_success() { size } else { 0 };
        ep.finish(id, buffer, size, status, moved);
        Some(payload)
    }

    /// Fail every in-flight transfer with the unplug status
    pub fn unplug(&self) {
        let endpoints: Vec<_> = lock(&self.state.endpoints).values().cloned().collect();
        for ep in endpoints {
            let posted: Vec<_> = lock(&ep.posted).drain(..).collect();
            for (id, buffer, size) in posted {
                ep.finish(id, buffer, size, XferStatus::DEVICE_UNPLUGGED, 0);
            }
        }
        self.state.state_change.signal();
    }

    pub fn pending_reads(&self) -> usize {
        self.endpoint_where(|a| a & 0x80 != 0)
            .map(|ep| lock(&ep.posted).len())
            .unwrap_or(0)
    }

    pub fn pending_writes(&self) -> usize {
        self.endpoint_where(|a| a & 0x80 == 0)
            .map(|ep| lock(&ep.posted).len())
            .unwrap_or(0)
    }

    pub fn is_closed(&self, address: u8) -> bool {
        lock(&self.state.endpoints)
            .get(&address)
            .map(|ep| ep.closed.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Every transport call so far
    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.state.calls).clone()
    }

    /// Control requests submitted so far
    pub fn control_calls(&self) -> Vec<ControlSetup> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TransportCall::Control(setup) => Some(setup),
                _ => None,
            })
            .collect()
    }

    /// Number of transfers posted on `address`
    pub fn post_count(&self, address: u8) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, TransportCall::Post { address: a, .. } if *a == address))
            .count()
    }

    /// Payloads posted on the OUT endpoint, oldest first
    pub fn written_payloads(&self) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TransportCall::Post { address, data, .. } if address & 0x80 == 0 => Some(data),
                _ => None,
            })
            .collect()
    }

    fn endpoint_where(&self, pred: impl Fn(u8) -> bool) -> Option<Arc<MockEndpointState>> {
        lock(&self.state.endpoints)
            .values()
            .find(|ep| pred(ep.address))
            .cloned()
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockState {
    fn record(&self, call: TransportCall) {
        lock(&self.calls).push(call);
    }

    fn next_xfer(&self) -> XferId {
        XferId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

struct MockInterface {
    state: Arc<MockState>,
}

impl UsbInterface for MockInterface {
    fn endpoint_descriptors(&self) -> Vec<EndpointDescriptor> {
        self.state.descriptors.clone()
    }

    fn open_endpoint(
        &self,
        descriptor: &EndpointDescriptor,
    ) -> Result<Box<dyn Endpoint>, TransportError> {
        self.state
            .record(TransportCall::OpenEndpoint(descriptor.address));
        let ep = Arc::new(MockEndpointState {
            address: descriptor.address,
            posted: Mutex::new(VecDeque::new()),
            done: Mutex::new(VecDeque::new()),
            event: Event::new(),
            closed: AtomicBool::new(false),
        });
        lock(&self.state.endpoints).insert(descriptor.address, Arc::clone(&ep));
        Ok(Box::new(MockEndpoint {
            state: Arc::clone(&self.state),
            ep,
        }))
    }

    fn control_transfer(
        &self,
        setup: ControlSetup,
        data: Vec<u8>,
    ) -> Result<XferId, TransportError> {
        self.state.record(TransportCall::Control(setup));
        let id = self.state.next_xfer();
        let requested = setup.length as u32;

        let failure = lock(&self.state.control_failures).get(&setup).copied();
        let completion = match failure {
            Some(status) => Completion {
                report: TransferReport {
                    xfer_id: id,
                    status,
                    requested_size: requested,
                    transferred_size: 0,
                },
                data: Vec::new(),
            },
            None if setup.is_device_to_host() => {
                let mut response = lock(&self.state.responses)
                    .get(&setup)
                    .cloned()
                    .unwrap_or_default();
                response.truncate(setup.length as usize);
                Completion {
                    report: TransferReport {
                        xfer_id: id,
                        status: XferStatus::SUCCESS,
                        requested_size: requested,
                        transferred_size: response.len() as u32,
                    },
                    data: response,
                }
            }
            None => Completion {
                report: TransferReport {
                    xfer_id: id,
                    status: XferStatus::SUCCESS,
                    requested_size: requested,
                    transferred_size: requested,
                },
                data,
            },
        };

        if self.state.hold_controls.load(Ordering::SeqCst) {
            lock(&self.state.held).push_back(completion);
        } else {
            let mut done = lock(&self.state.control_done);
            done.push_back(completion);
            self.state.control_event.signal();
        }
        Ok(id)
    }

    fn take_control_completion(&self) -> Option<Completion> {
        let mut done = lock(&self.state.control_done);
        let completion = done.pop_front();
        if done.is_empty() {
            self.state.control_event.clear();
        }
        completion
    }

    fn control_event(&self) -> &Event {
        &self.state.control_event
    }

    fn state_change_event(&self) -> &Event {
        &self.state.state_change
    }
}

struct MockEndpoint {
    state: Arc<MockState>,
    ep: Arc<MockEndpointState>,
}

impl Endpoint for MockEndpoint {
    fn address(&self) -> u8 {
        self.ep.address
    }

    fn populate_ring(&self) -> Result<(), TransportError> {
        self.state
            .record(TransportCall::PopulateRing(self.ep.address));
        Ok(())
    }

    fn post_buffer(&self, buffer: Vec<u8>, size: usize) -> Result<XferId, TransportError> {
        if self.ep.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed {
                address: self.ep.address,
            });
        }
        let is_write = self.ep.address & 0x80 == 0;
        self.state.record(TransportCall::Post {
            address: self.ep.address,
            size,
            data: if is_write {
                buffer[..size.min(buffer.len())].to_vec()
            } else {
                Vec::new()
            },
        });
        let id = self.state.next_xfer();

        if !is_write {
            let auto = lock(&self.state.auto_read).clone();
            if let Some(packet) = auto {
                let mut buffer = buffer;
                buffer.resize(size.max(buffer.len()), 0);
                let moved = packet.len().min(size);
                buffer[..moved].copy_from_slice(&packet[..moved]);
                self.ep
                    .finish(id, buffer, size, XferStatus::SUCCESS, moved);
                return Ok(id);
            }
        }

        lock(&self.ep.posted).push_back((id, buffer, size));
        Ok(id)
    }

    fn take_completions(&self, max: usize) -> Vec<Completion> {
        let mut done = lock(&self.ep.done);
        let count = max.min(done.len());
        let taken: Vec<_> = done.drain(..count).collect();
        if done.is_empty() {
            self.ep.event.clear();
        }
        taken
    }

    fn completion_event(&self) -> &Event {
        &self.ep.event
    }

    fn close(&self) -> Result<(), TransportError> {
        self.state.record(TransportCall::Close(self.ep.address));
        self.ep.closed.store(true, Ordering::SeqCst);
        let posted: Vec<_> = lock(&self.ep.posted).drain(..).collect();
        for (id, buffer, size) in posted {
            self.ep.finish(id, buffer, size, XferStatus::CANCELLED, 0);
        }
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(TransportError::Usb(format!(
                "close of {:#04x} returned {}",
                self.ep.address,
                XferStatus::ENDPOINT_CLOSED
            )));
        }
        Ok(())
    }
}

/// In-memory address spaces of simulated client processes
///
/// Clients place bytes with [`SimulatedAddressSpace::write`] and inspect
/// what the engine copied with [`SimulatedAddressSpace::read`]. Untouched
/// memory reads as zero.
#[derive(Clone, Default)]
pub struct SimulatedAddressSpace {
    inner: Arc<Mutex<SpaceState>>,
}

#[derive(Default)]
struct SpaceState {
    pages: HashMap<(u64, u64), Vec<u8>>,
    map_count: usize,
    fail_next_map: bool,
}

impl SpaceState {
    fn byte(&self, process: u64, addr: u64) -> u8 {
        let base = ForeignAddr(addr).page_base();
        self.pages
            .get(&(process, base))
            .map(|page| page[ForeignAddr(addr).page_offset()])
            .unwrap_or(0)
    }

    fn set_byte(&mut self, process: u64, addr: u64, value: u8) {
        let base = ForeignAddr(addr).page_base();
        let page = self
            .pages
            .entry((process, base))
            .or_insert_with(|| vec![0; PAGE_SIZE]);
        page[ForeignAddr(addr).page_offset()] = value;
    }
}

impl SimulatedAddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store bytes into a client's memory
    pub fn write(&self, process: ClientProcess, addr: ForeignAddr, bytes: &[u8]) {
        let mut state = lock(&self.inner);
        for (i, b) in bytes.iter().enumerate() {
            state.set_byte(process.0, addr.0 + i as u64, *b);
        }
    }

    /// Load bytes from a client's memory
    pub fn read(&self, process: ClientProcess, addr: ForeignAddr, len: usize) -> Vec<u8> {
        let state = lock(&self.inner);
        (0..len as u64)
            .map(|i| state.byte(process.0, addr.0 + i))
            .collect()
    }

    /// Number of successful maps so far
    pub fn map_count(&self) -> usize {
        lock(&self.inner).map_count
    }

    /// Make the next map fail
    pub fn fail_next_map(&self) {
        lock(&self.inner).fail_next_map = true;
    }

    /// Mapper over this address space
    pub fn mapper(&self) -> Box<dyn ForeignMapper> {
        Box::new(SimulatedMapper {
            space: self.clone(),
            active: None,
        })
    }
}

struct SimulatedMapper {
    space: SimulatedAddressSpace,
    active: Option<(ClientProcess, ForeignAddr, Vec<u8>)>,
}

impl ForeignMapper for SimulatedMapper {
    fn map(
        &mut self,
        process: ClientProcess,
        base: ForeignAddr,
        len: usize,
    ) -> Result<(), MapError> {
        if self.active.is_some() {
            return Err(MapError::AlreadyMapped);
        }
        {
            let mut state = lock(&self.space.inner);
            if state.fail_next_map {
                state.fail_next_map = false;
                return Err(MapError::Map {
                    process: process.0,
                    addr: base,
                    len,
                    reason: "simulated failure".to_string(),
                });
            }
            state.map_count += 1;
        }
        let window = self.space.read(process, base, len);
        self.active = Some((process, base, window));
        Ok(())
    }

    fn window(&mut self) -> Result<&mut [u8], MapError> {
        self.active
            .as_mut()
            .map(|(_, _, window)| window.as_mut_slice())
            .ok_or(MapError::NotMapped)
    }

    fn unmap(&mut self) -> Result<(), MapError> {
        let (process, base, window) = self.active.take().ok_or(MapError::NotMapped)?;
        self.space.write(process, base, &window);
        Ok(())
    }

    fn flush_local(&mut self) -> Result<(), MapError> {
        Ok(())
    }

    fn invalidate_remote(
        &mut self,
        _process: ClientProcess,
        _addr: ForeignAddr,
        _len: usize,
    ) -> Result<(), MapError> {
        Ok(())
    }

    fn flush_remote(
        &mut self,
        _process: ClientProcess,
        _addr: ForeignAddr,
        _len: usize,
    ) -> Result<(), MapError> {
        Ok(())
    }
}
