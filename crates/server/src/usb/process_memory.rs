//! Cross-process mapping on Linux
//!
//! Linux has no call to map another process's page into ours, so the window
//! is emulated: `map` reads the span with `process_vm_readv`, `unmap`
//! writes back only the bytes that changed with `process_vm_writev`. Both go
//! through the kernel, which keeps caches coherent, so the cache maintenance
//! hooks have nothing to do.

use common::{ForeignMapper, MapError};
use nix::sys::uio::{RemoteIoVec, process_vm_readv, process_vm_writev};
use nix::unistd::Pid;
use protocol::{ClientProcess, ForeignAddr};
use std::io::{IoSlice, IoSliceMut};

struct Active {
    process: ClientProcess,
    base: ForeignAddr,
    window: Vec<u8>,
    original: Vec<u8>,
}

#[derive(Default)]
pub struct ProcessVmMapper {
    active: Option<Active>,
}

impl ProcessVmMapper {
    pub fn new() -> Self {
        Self::default()
    }
}

fn pid(process: ClientProcess) -> Pid {
    Pid::from_raw(process.0 as i32)
}

impl ForeignMapper for ProcessVmMapper {
    fn map(
        &mut self,
        process: ClientProcess,
        base: ForeignAddr,
        len: usize,
    ) -> Result<(), MapError> {
        if self.active.is_some() {
            return Err(MapError::AlreadyMapped);
        }
        let mut window = vec![0u8; len];
        let remote = [RemoteIoVec {
            base: base.0 as usize,
            len,
        }];
        let read = process_vm_readv(pid(process), &mut [IoSliceMut::new(&mut window)], &remote)
            .map_err(|e| MapError::Map {
                process: process.0,
                addr: base,
                len,
                reason: e.to_string(),
            })?;
        if read != len {
            return Err(MapError::Map {
                process: process.0,
                addr: base,
                len,
                reason: format!("short read of {:#x} bytes", read),
            });
        }
        self.active = Some(Active {
            process,
            base,
            original: window.clone(),
            window,
        });
        Ok(())
    }

    fn window(&mut self) -> Result<&mut [u8], MapError> {
        self.active
            .as_mut()
            .map(|a| a.window.as_mut_slice())
            .ok_or(MapError::NotMapped)
    }

    fn unmap(&mut self) -> Result<(), MapError> {
        let active = self.active.take().ok_or(MapError::NotMapped)?;
        let first = active
            .window
            .iter()
            .zip(&active.original)
            .position(|(a, b)| a != b);
        let Some(first) = first else {
            return Ok(());
        };
        let last = active
            .window
            .iter()
            .zip(&active.original)
            .rposition(|(a, b)| a != b)
            .unwrap_or(first);

        let dirty = &active.window[first..=last];
        let addr = active.base.offset(first as u64);
        let remote = [RemoteIoVec {
            base: addr.0 as usize,
            len: dirty.len(),
        }];
        let written = process_vm_writev(pid(active.process), &[IoSlice::new(dirty)], &remote)
            .map_err(|e| MapError::Unmap {
                process: active.process.0,
                addr,
                reason: e.to_string(),
            })?;
        if written != dirty.len() {
            return Err(MapError::Unmap {
                process: active.process.0,
                addr,
                reason: format!("short write of {:#x} bytes", written),
            });
        }
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
