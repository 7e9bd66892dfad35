//! Caller memory access
//!
//! Session reads and writes never touch caller memory directly; they go
//! through these two traits so a copy can fail with [`DriverError::Fault`]
//! instead of being assumed infallible. Plain slices always succeed.

use crate::error::{DriverError, Result};

/// Source of bytes handed in by a caller (the `write` side)
pub trait IoBufferReader {
    /// Number of bytes the caller offers
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy exactly `dst.len()` bytes out of the caller buffer
    fn read_slice(&mut self, dst: &mut [u8]) -> Result<()>;
}

/// Destination for bytes returned to a caller (the `read` side)
pub trait IoBufferWriter {
    /// Room available in the caller buffer
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy all of `src` into the caller buffer
    fn write_slice(&mut self, src: &[u8]) -> Result<()>;
}

impl IoBufferReader for &[u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn read_slice(&mut self, dst: &mut [u8]) -> Result<()> {
        if dst.len() > <[u8]>::len(self) {
            return Err(DriverError::Fault);
        }
        let (head, tail) = self.split_at(dst.len());
        dst.copy_from_slice(head);
        *self = tail;
        Ok(())
    }
}

impl IoBufferWriter for &mut [u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn write_slice(&mut self, src: &[u8]) -> Result<()> {
        if src.len() > <[u8]>::len(self) {
            return Err(DriverError::Fault);
        }
        let buf = std::mem::take(self);
        let (head, tail) = buf.split_at_mut(src.len());
        head.copy_from_slice(src);
        *self = tail;
        Ok(())
    }
}
