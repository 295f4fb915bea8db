//! USB transport over rusb
//!
//! libusb's synchronous calls are turned into the engine's
//! submit-then-complete model with one lane thread per endpoint (and one for
//! endpoint zero). A lane runs submitted jobs in order; each job performs
//! the blocking rusb call, pushes a [`Completion`] and signals the
//! endpoint's [`Event`].
//!
//! Interrupt reads are issued in short slices so that a closed endpoint
//! stops within one slice even when the adapter sends nothing.

use common::error::TransportError;
use common::signal::{Event, lock};
use common::{Completion, Endpoint, EndpointDescriptor, UsbInterface};
use protocol::{ControlSetup, TransferReport, XferId, XferStatus};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Interface the adapter's interrupt endpoints live on
const ADAPTER_INTERFACE: u8 = 0;

/// Length of one blocking read slice
const READ_SLICE: Duration = Duration::from_millis(100);

/// Timeout for writes and control transfers
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce() + Send>;

/// Ordered job runner backed by one thread
struct Lane {
    tx: async_channel::Sender<Job>,
}

impl Lane {
    fn spawn(name: String) -> Result<Self, TransportError> {
        let (tx, rx) = async_channel::unbounded::<Job>();
        std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                while let Ok(job) = rx.recv_blocking() {
                    job();
                }
            })
            .map_err(|e| TransportError::Usb(format!("Failed to spawn transfer lane: {}", e)))?;
        Ok(Self { tx })
    }

    fn submit(&self, job: Job) -> Result<(), String> {
        self.tx.try_send(job).map_err(|e| e.to_string())
    }
}

/// Finished transfers waiting to be taken
#[derive(Default)]
struct CompletionQueue {
    done: Mutex<VecDeque<Completion>>,
    event: Event,
}

impl CompletionQueue {
    fn push(&self, completion: Completion) {
        let mut done = lock(&self.done);
        done.push_back(completion);
        self.event.signal();
    }

    fn take(&self, max: usize) -> Vec<Completion> {
        let mut done = lock(&self.done);
        let count = max.min(done.len());
        let taken = done.drain(..count).collect();
        if done.is_empty() {
            self.event.clear();
        }
        taken
    }
}

/// Map a rusb failure to the completion status the engine sees
pub fn status_from_rusb(err: rusb::Error) -> XferStatus {
    match err {
        rusb::Error::NoDevice => XferStatus::DEVICE_UNPLUGGED,
        rusb::Error::Timeout | rusb::Error::Interrupted => XferStatus::CANCELLED,
        _ => XferStatus::TRANSFER_FAILED,
    }
}

fn usb_error(err: rusb::Error) -> TransportError {
    TransportError::Usb(err.to_string())
}

fn report(id: XferId, status: XferStatus, requested: usize, moved: usize) -> TransferReport {
    TransferReport {
        xfer_id: id,
        status,
        requested_size: requested as u32,
        transferred_size: moved as u32,
    }
}

/// Transfer id source shared by an interface and its endpoints
#[derive(Clone, Default)]
struct XferIds(Arc<AtomicU32>);

impl XferIds {
    fn next(&self) -> XferId {
        // Zero marks synthesized reports
        XferId(self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1))
    }
}

/// A claimed GameCube adapter interface
pub struct RusbInterface {
    handle: Arc<DeviceHandle<Context>>,
    name: String,
    descriptors: Vec<EndpointDescriptor>,
    control_lane: Lane,
    control_done: Arc<CompletionQueue>,
    state_change: Event,
    ids: XferIds,
}

impl RusbInterface {
    /// Open a device and claim its adapter interface
    pub fn open(device: &Device<Context>) -> Result<Self, TransportError> {
        let name = format!("bus{:03}.{:03}", device.bus_number(), device.address());
        let mut handle = device.open().map_err(usb_error)?;
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            debug!("{}: kernel driver auto-detach unavailable: {}", name, e);
        }
        handle
            .claim_interface(ADAPTER_INTERFACE)
            .map_err(usb_error)?;
        debug!("{}: claimed interface {}", name, ADAPTER_INTERFACE);

        let config = device.active_config_descriptor().map_err(usb_error)?;
        let mut descriptors = Vec::new();
        for interface in config.interfaces() {
            if interface.number() != ADAPTER_INTERFACE {
                continue;
            }
            for setting in interface.descriptors() {
                for endpoint in setting.endpoint_descriptors() {
                    descriptors.push(EndpointDescriptor {
                        address: endpoint.address(),
                        max_packet_size: endpoint.max_packet_size(),
                        interval: endpoint.interval(),
                    });
                }
            }
        }

        Ok(Self {
            handle: Arc::new(handle),
            control_lane: Lane::spawn(format!("gc-{}-ep0", name))?,
            name,
            descriptors,
            control_done: Arc::new(CompletionQueue::default()),
            state_change: Event::new(),
            ids: XferIds::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl UsbInterface for RusbInterface {
    fn endpoint_descriptors(&self) -> Vec<EndpointDescriptor> {
        self.descriptors.clone()
    }

    fn open_endpoint(
        &self,
        descriptor: &EndpointDescriptor,
    ) -> Result<Box<dyn Endpoint>, TransportError> {
        let lane = Lane::spawn(format!("gc-{}-ep{:02x}", self.name, descriptor.address)).map_err(
            |e| TransportError::OpenEndpoint {
                address: descriptor.address,
                reason: e.to_string(),
            },
        )?;
        Ok(Box::new(RusbEndpoint {
            handle: Arc::clone(&self.handle),
            address: descriptor.address,
            lane,
            queue: Arc::new(CompletionQueue::default()),
            closed: Arc::new(AtomicBool::new(false)),
            state_change: self.state_change.clone(),
            ids: self.ids.clone(),
        }))
    }

    fn control_transfer(
        &self,
        setup: ControlSetup,
        mut data: Vec<u8>,
    ) -> Result<XferId, TransportError> {
        let id = self.ids.next();
        let handle = Arc::clone(&self.handle);
        let queue = Arc::clone(&self.control_done);
        let state_change = self.state_change.clone();
        let length = setup.length as usize;

        self.control_lane
            .submit(Box::new(move || {
                data.resize(length, 0);
                let result = if setup.is_device_to_host() {
                    handle.read_control(
                        setup.request_type,
                        setup.request,
                        setup.value,
                        setup.index,
                        &mut data,
                        DEFAULT_TIMEOUT,
                    )
                } else {
                    handle.write_control(
                        setup.request_type,
                        setup.request,
                        setup.value,
                        setup.index,
                        &data,
                        DEFAULT_TIMEOUT,
                    )
                };
                let report = match result {
                    Ok(moved) => report(id, XferStatus::SUCCESS, length, moved),
                    Err(e) => {
                        warn!("Control transfer {} failed: {}", setup, e);
                        if e == rusb::Error::NoDevice {
                            state_change.signal();
                        }
                        report(id, status_from_rusb(e), length, 0)
                    }
                };
                queue.push(Completion { report, data });
            }))
            .map_err(TransportError::Control)?;
        trace!("{}: control {} submitted as {:?}", self.name, setup, id);
        Ok(id)
    }

    fn take_control_completion(&self) -> Option<Completion> {
        self.control_done.take(1).into_iter().next()
    }

    fn control_event(&self) -> &Event {
        &self.control_done.event
    }

    fn state_change_event(&self) -> &Event {
        &self.state_change
    }
}

struct RusbEndpoint {
    handle: Arc<DeviceHandle<Context>>,
    address: u8,
    lane: Lane,
    queue: Arc<CompletionQueue>,
    closed: Arc<AtomicBool>,
    state_change: Event,
    ids: XferIds,
}

impl RusbEndpoint {
    fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }
}

impl Endpoint for RusbEndpoint {
    fn address(&self) -> u8 {
        self.address
    }

    fn populate_ring(&self) -> Result<(), TransportError> {
        // Lanes issue blocking calls, there is no ring to fill
        debug!("Endpoint {:#04x} ready", self.address);
        Ok(())
    }

    fn post_buffer(&self, mut buffer: Vec<u8>, size: usize) -> Result<XferId, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed {
                address: self.address,
            });
        }
        let id = self.ids.next();
        let handle = Arc::clone(&self.handle);
        let queue = Arc::clone(&self.queue);
        let closed = Arc::clone(&self.closed);
        let state_change = self.state_change.clone();
        let address = self.address;
        let is_in = self.is_in();

        self.lane
            .submit(Box::new(move || {
                buffer.resize(size.max(buffer.len()), 0);
                let result = if is_in {
                    loop {
                        if closed.load(Ordering::SeqCst) {
                            break Err(rusb::Error::Interrupted);
                        }
                        match handle.read_interrupt(address, &mut buffer[..size], READ_SLICE) {
                            Err(rusb::Error::Timeout) => continue,
                            other => break other,
                        }
                    }
                } else {
                    handle.write_interrupt(address, &buffer[..size], DEFAULT_TIMEOUT)
                };
                let report = match result {
                    Ok(moved) => report(id, XferStatus::SUCCESS, size, moved),
                    Err(e) => {
                        if e == rusb::Error::NoDevice {
                            state_change.signal();
                        }
                        trace!("Endpoint {:#04x} transfer {:?} ended: {}", address, id, e);
                        report(id, status_from_rusb(e), size, 0)
                    }
                };
                queue.push(Completion {
                    report,
                    data: buffer,
                });
            }))
            .map_err(|reason| TransportError::Post {
                address: self.address,
                reason,
            })?;
        Ok(id)
    }

    fn take_completions(&self, max: usize) -> Vec<Completion> {
        self.queue.take(max)
    }

    fn completion_event(&self) -> &Event {
        &self.queue.event
    }

    fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        debug!("Endpoint {:#04x} closed", self.address);
        Ok(())
    }
}

/// Location and identity of a matching adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

fn matching_devices(
    context: &Context,
    vendor_id: u16,
    product_id: u16,
) -> Result<Vec<Device<Context>>, TransportError> {
    let devices = context.devices().map_err(usb_error)?;
    Ok(devices
        .iter()
        .filter(|device| {
            device
                .device_descriptor()
                .map(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
                .unwrap_or(false)
        })
        .collect())
}

/// Connected adapters, without opening them
pub fn list_adapters(vendor_id: u16, product_id: u16) -> Result<Vec<AdapterInfo>, TransportError> {
    let context = Context::new().map_err(usb_error)?;
    Ok(matching_devices(&context, vendor_id, product_id)?
        .iter()
        .map(|device| AdapterInfo {
            bus: device.bus_number(),
            address: device.address(),
            vendor_id,
            product_id,
        })
        .collect())
}

/// Open and claim every connected adapter
///
/// Adapters that cannot be opened are skipped with a warning.
pub fn open_adapters(
    vendor_id: u16,
    product_id: u16,
) -> Result<Vec<RusbInterface>, TransportError> {
    let context = Context::new().map_err(usb_error)?;
    let mut adapters = Vec::new();
    for device in matching_devices(&context, vendor_id, product_id)? {
        match RusbInterface::open(&device) {
            Ok(interface) => {
                info!("Opened adapter {}", interface.name());
                adapters.push(interface);
            }
            Err(e) => warn!(
                "Skipping adapter at bus {:03} address {:03}: {}",
                device.bus_number(),
                device.address(),
                e
            ),
        }
    }
    Ok(adapters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_rusb() {
        assert_eq!(
            status_from_rusb(rusb::Error::NoDevice),
            XferStatus::DEVICE_UNPLUGGED
        );
        assert_eq!(status_from_rusb(rusb::Error::Timeout), XferStatus::CANCELLED);
        assert_eq!(
            status_from_rusb(rusb::Error::Interrupted),
            XferStatus::CANCELLED
        );
        assert_eq!(
            status_from_rusb(rusb::Error::Pipe),
            XferStatus::TRANSFER_FAILED
        );
        assert_eq!(status_from_rusb(rusb::Error::Io), XferStatus::TRANSFER_FAILED);
    }

    #[test]
    fn test_completion_queue_clears_event_when_drained() {
        let queue = CompletionQueue::default();
        for id in 1..=3 {
            queue.push(Completion {
                report: report(XferId(id), XferStatus::SUCCESS, 5, 5),
                data: vec![0; 5],
            });
        }
        assert!(queue.event.is_signaled());

        let first = queue.take(2);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].report.xfer_id, XferId(1));
        assert!(queue.event.is_signaled());

        assert_eq!(queue.take(8).len(), 1);
        assert!(!queue.event.is_signaled());
    }

    #[test]
    fn test_lane_runs_jobs_in_order() {
        let lane = Lane::spawn("test-lane".to_string()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let done = Event::new();
        for i in 0..5 {
            let seen = Arc::clone(&seen);
            let done = done.clone();
            lane.submit(Box::new(move || {
                lock(&seen).push(i);
                if i == 4 {
                    done.signal();
                }
            }))
            .unwrap();
        }
        assert!(done.wait_timeout(Duration::from_secs(5)));
        assert_eq!(*lock(&seen), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_xfer_ids_skip_zero() {
        let ids = XferIds::default();
        assert_eq!(ids.next(), XferId(1));
        assert_eq!(ids.next(), XferId(2));
    }
}
