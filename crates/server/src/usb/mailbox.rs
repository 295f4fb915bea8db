//! Per-slot packet mailbox
//!
//! Each slot has one read region and one write region. A deposit overwrites
//! whatever the region held; a withdrawal returns whatever is there, stale
//! or not. The adapter is polled far faster than any client consumes, so
//! superseded packets are dropped rather than queued.
//!
//! The dispatcher writes the read region and the latest reports; the proxy
//! writes the write region and reads everything else.

use common::signal::lock;
use protocol::{Direction, PAGE_SIZE, READ_PACKET_SIZE, TransferReport};
use std::sync::Mutex;

struct Region {
    bytes: Box<[u8]>,
    len: usize,
    report: TransferReport,
    /// Deposited but not yet consumed
    pending: bool,
}

impl Region {
    fn new() -> Self {
        Self {
            bytes: vec![0u8; PAGE_SIZE].into_boxed_slice(),
            len: 0,
            report: TransferReport::never_completed(),
            pending: false,
        }
    }

    fn store(&mut self, data: &[u8]) {
        let len = data.len().min(PAGE_SIZE);
        self.bytes[..len].copy_from_slice(&data[..len]);
        self.len = len;
    }
}

struct Regions {
    read: Region,
    write: Region,
}

impl Regions {
    fn get(&mut self, direction: Direction) -> &mut Region {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }
}

/// Two last-write-wins packet regions
pub struct Mailbox {
    regions: Mutex<Regions>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            regions: Mutex::new(Regions {
                read: Region::new(),
                write: Region::new(),
            }),
        }
    }

    /// Overwrite the region with `data`
    pub fn deposit(&self, direction: Direction, data: &[u8]) {
        let mut regions = lock(&self.regions);
        let region = regions.get(direction);
        region.store(data);
        region.pending = true;
    }

    /// Store a completed hardware read together with its report
    pub fn deposit_completion(&self, data: &[u8], report: TransferReport) {
        let mut regions = lock(&self.regions);
        regions.read.store(data);
        regions.read.report = report;
        regions.read.pending = true;
    }

    /// Current contents and the report to hand to a client asking for `size`
    ///
    /// The returned bytes are exactly `size` long, zero-padded past what the
    /// region holds. Before the first real completion the report is a
    /// synthesized full transfer.
    pub fn withdraw(&self, direction: Direction, size: usize) -> (Vec<u8>, TransferReport) {
        let mut regions = lock(&self.regions);
        let region = regions.get(direction);
        region.pending = false;
        let mut data = vec![0u8; size.min(PAGE_SIZE)];
        let len = data.len();
        data.copy_from_slice(&region.bytes[..len]);
        (data, region.report.for_request(size as u32))
    }

    /// Latest hardware report for a direction
    pub fn latest_report(&self, direction: Direction) -> TransferReport {
        lock(&self.regions).get(direction).report
    }

    pub fn record_report(&self, direction: Direction, report: TransferReport) {
        lock(&self.regions).get(direction).report = report;
    }

    /// Take the deposited write packet if one is waiting
    pub fn take_pending_write(&self) -> Option<Vec<u8>> {
        let mut regions = lock(&self.regions);
        let region = &mut regions.write;
        if !region.pending {
            return None;
        }
        region.pending = false;
        Some(region.bytes[..region.len].to_vec())
    }

    /// Latest read packet, for the in-process bypass query
    pub fn read_snapshot(&self) -> [u8; READ_PACKET_SIZE] {
        let regions = lock(&self.regions);
        let mut packet = [0u8; READ_PACKET_SIZE];
        packet.copy_from_slice(&regions.read.bytes[..READ_PACKET_SIZE]);
        packet
    }

    /// Forget everything, back to the never-completed state
    pub fn reset(&self) {
        let mut regions = lock(&self.regions);
        regions.read = Region::new();
        regions.write = Region::new();
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}
