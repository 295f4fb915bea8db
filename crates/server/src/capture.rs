//! Call capture
//!
//! Records every proxy call and slot transition into a binary capture file
//! (see [`protocol::capture`] for the frame format). Recording is best
//! effort: a failed write is logged and the call it describes still goes
//! ahead.

use anyhow::{Context, Result};
use common::signal::lock;
use protocol::{CaptureRecord, CapturedCall, SlotId, write_frame};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, warn};

pub struct CaptureRecorder {
    path: PathBuf,
    start: Instant,
    writer: Mutex<BufWriter<File>>,
}

impl CaptureRecorder {
    /// Create (or truncate) the capture file at `path`
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create capture directory: {:?}", parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to open capture file: {:?}", path))?;

        debug!("Capturing engine calls to {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            start: Instant::now(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, slot: SlotId, call: CapturedCall) {
        let record = CaptureRecord {
            elapsed_us: self.start.elapsed().as_micros() as u64,
            slot,
            call,
        };
        let mut writer = lock(&self.writer);
        if let Err(e) = write_frame(&mut *writer, &record) {
            warn!("Dropped capture record for {}: {}", slot, e);
        }
    }

    pub fn flush(&self) {
        if let Err(e) = lock(&self.writer).flush() {
            warn!("Failed to flush capture file {:?}: {}", self.path, e);
        }
    }
}

impl Drop for CaptureRecorder {
    fn drop(&mut self) {
        self.flush();
    }
}
