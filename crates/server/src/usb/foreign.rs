//! Copies between the engine and a client's address space
//!
//! All copies go through one bounce window owned by a [`ForeignMapper`]. The
//! window is shared, so copies are serialized by a single lock: concurrent
//! callers queue up rather than interleave.
//!
//! Per copy the sequence is: map the page-aligned span that covers the
//! client buffer, clean the local window, copy, flush the local window,
//! unmap, then invalidate and flush the client's view of the range.

use super::error::{EngineError, Result};
use common::ForeignMapper;
use common::signal::lock;
use protocol::{ClientProcess, ForeignAddr, PAGE_SIZE};
use std::sync::Mutex;
use tracing::{trace, warn};

pub struct ForeignTransfer {
    mapper: Mutex<Box<dyn ForeignMapper>>,
}

impl ForeignTransfer {
    pub fn new(mapper: Box<dyn ForeignMapper>) -> Self {
        Self {
            mapper: Mutex::new(mapper),
        }
    }

    /// Copy `local.len()` bytes from `src` in the client into `local`
    pub fn copy_in(&self, owner: ClientProcess, src: ForeignAddr, local: &mut [u8]) -> Result<()> {
        if local.is_empty() {
            return Ok(());
        }
        let size = local.len();
        self.with_mapping(owner, src, size, |window| {
            local.copy_from_slice(&window[..size]);
        })
    }

    /// Copy `local` into the client at `dst`
    pub fn copy_out(&self, owner: ClientProcess, local: &[u8], dst: ForeignAddr) -> Result<()> {
        if local.is_empty() {
            return Ok(());
        }
        let size = local.len();
        self.with_mapping(owner, dst, size, |window| {
            window[..size].copy_from_slice(local);
        })
    }

    /// Map the span covering `[addr, addr + size)` and run `copy` on the
    /// window slice that starts at `addr`
    fn with_mapping(
        &self,
        owner: ClientProcess,
        addr: ForeignAddr,
        size: usize,
        copy: impl FnOnce(&mut [u8]),
    ) -> Result<()> {
        if size > PAGE_SIZE {
            return Err(EngineError::TransferTooLarge {
                size,
                max: PAGE_SIZE,
            });
        }

        let base = ForeignAddr(addr.page_base());
        let offset = addr.page_offset();
        let span = page_align(offset + size);

        let mut mapper = lock(&self.mapper);
        mapper.map(owner, base, span)?;

        let copied = (|| -> Result<()> {
            mapper.flush_local()?;
            let window = mapper.window()?;
            copy(&mut window[offset..offset + size]);
            mapper.flush_local()?;
            Ok(())
        })();
        if copied.is_err() {
            if let Err(e) = mapper.unmap() {
                warn!(
                    "Unmapping {} of client {} after a failed copy failed: {}",
                    base, owner.0, e
                );
            }
            return copied;
        }

        mapper.unmap()?;
        mapper.invalidate_remote(owner, addr, size)?;
        mapper.flush_remote(owner, addr, size)?;
        trace!("Copied {:#x} bytes at {} of client {}", size, addr, owner.0);
        Ok(())
    }
}

fn page_align(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE) * PAGE_SIZE
}
