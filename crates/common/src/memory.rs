//! Foreign address-space mapping seam
//!
//! A [`ForeignMapper`] owns one local bounce window. At most one foreign
//! span is mapped into it at a time; callers serialize access.

use crate::error::MapError;
use protocol::{ClientProcess, ForeignAddr};

pub trait ForeignMapper: Send {
    /// Map `len` bytes of `process` starting at page-aligned `base`
    fn map(&mut self, process: ClientProcess, base: ForeignAddr, len: usize)
    -> Result<(), MapError>;

    /// The mapped bytes
    fn window(&mut self) -> Result<&mut [u8], MapError>;

    /// Write back and drop the current mapping
    fn unmap(&mut self) -> Result<(), MapError>;

    /// Clean the local data cache over the window
    fn flush_local(&mut self) -> Result<(), MapError>;

    /// Invalidate the client's data cache over a range
    fn invalidate_remote(
        &mut self,
        process: ClientProcess,
        addr: ForeignAddr,
        len: usize,
    ) -> Result<(), MapError>;

    /// Flush the client's data cache over a range
    fn flush_remote(
        &mut self,
        process: ClientProcess,
        addr: ForeignAddr,
        len: usize,
    ) -> Result<(), MapError>;
}
