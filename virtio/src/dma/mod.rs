//! DMA memory contract.
//!
//! The virtqueue never touches raw pointers. Every access to memory shared
//! with the device goes through [`PhysMemory`], addressed by physical
//! address, and every buffer the device may see is obtained from a
//! [`DmaAllocator`].
//!
//! Two implementations are provided:
//! - [`HeapRegion`]: a simulated region backed by an in-process array, used
//!   to run the full driver/device protocol in tests.
//! - [`IdentityRegion`]: identity-mapped physical memory accessed with
//!   volatile reads and writes.

pub mod allocator;
pub mod region;

use alloc::sync::Arc;

use crate::error::{Result, VirtioError};

pub use allocator::RangeAllocator;
pub use region::{HeapRegion, IdentityRegion};

/// A physically addressed, byte-addressable DMA buffer.
///
/// This is a handle, not a borrow: the bytes live in a [`PhysMemory`] and
/// are accessed through it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DmaBuffer {
    /// Device-visible physical address.
    addr: u64,
    /// Length in bytes.
    len: usize,
}

impl DmaBuffer {
    /// Describe `len` bytes at physical address `addr`.
    ///
    /// Creating a handle does not reserve anything; only buffers returned by
    /// [`DmaAllocator::reserve`] (or slices of them) are bound.
    pub const fn new(addr: u64, len: usize) -> Self {
        DmaBuffer { addr, len }
    }

    /// Physical address of the first byte.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Physical address one past the last byte, if it is representable.
    pub fn end(&self) -> Option<u64> {
        self.addr.checked_add(self.len as u64)
    }

    /// Sub-buffer of `len` bytes starting `offset` bytes in.
    pub fn slice(&self, offset: usize, len: usize) -> Option<DmaBuffer> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        Some(DmaBuffer::new(self.addr.checked_add(offset as u64)?, len))
    }

    /// Split into consecutive chunks of `chunk` bytes; a trailing partial
    /// chunk is dropped.
    pub fn chunks(&self, chunk: usize) -> impl Iterator<Item = DmaBuffer> + '_ {
        let count = if chunk == 0 { 0 } else { self.len / chunk };
        (0..count).map(move |i| DmaBuffer::new(self.addr + (i * chunk) as u64, chunk))
    }
}

/// Byte access to memory at physical addresses.
///
/// Multi-byte helpers use little-endian encoding, the byte order of every
/// VirtIO ring structure.
pub trait PhysMemory {
    /// Copy `dst.len()` bytes starting at `addr` into `dst`.
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<()>;

    /// Copy `src` into memory starting at `addr`.
    fn write(&self, addr: u64, src: &[u8]) -> Result<()>;

    fn read_u16(&self, addr: u64) -> Result<u16> {
        let mut bytes = [0u8; 2];
        self.read(addr, &mut bytes)?;
        Ok(u16::from_le_bytes(bytes))
    }

    fn read_u32(&self, addr: u64) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.read(addr, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_u64(&self, addr: u64) -> Result<u64> {
        let mut bytes = [0u8; 8];
        self.read(addr, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn write_u16(&self, addr: u64, value: u16) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    fn write_u32(&self, addr: u64, value: u32) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    fn write_u64(&self, addr: u64, value: u64) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }
}

/// DMA region allocator.
///
/// Reservations are physically contiguous. `release` takes the address a
/// reservation started at; releasing any other address has no effect.
pub trait DmaAllocator: PhysMemory {
    /// Reserve `size` bytes aligned to `align` (0 means no constraint).
    fn reserve(&self, size: usize, align: usize) -> Result<DmaBuffer>;

    /// Release the reservation starting at `addr`.
    ///
    /// Returns `false` if no reservation starts there.
    fn release(&self, addr: u64) -> bool;

    /// Whether `buf` lies entirely inside a live reservation.
    fn is_reserved(&self, buf: &DmaBuffer) -> bool;

    /// Like [`release`](Self::release), reporting unknown addresses as an error.
    fn try_release(&self, addr: u64) -> Result<()> {
        if self.release(addr) {
            Ok(())
        } else {
            Err(VirtioError::NotReserved(addr))
        }
    }
}

impl<T: PhysMemory + ?Sized> PhysMemory for &T {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        (**self).read(addr, dst)
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<()> {
        (**self).write(addr, src)
    }
}

impl<T: DmaAllocator + ?Sized> DmaAllocator for &T {
    fn reserve(&self, size: usize, align: usize) -> Result<DmaBuffer> {
        (**self).reserve(size, align)
    }

    fn release(&self, addr: u64) -> bool {
        (**self).release(addr)
    }

    fn is_reserved(&self, buf: &DmaBuffer) -> bool {
        (**self).is_reserved(buf)
    }
}

impl<T: PhysMemory + ?Sized> PhysMemory for Arc<T> {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        (**self).read(addr, dst)
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<()> {
        (**self).write(addr, src)
    }
}

impl<T: DmaAllocator + ?Sized> DmaAllocator for Arc<T> {
    fn reserve(&self, size: usize, align: usize) -> Result<DmaBuffer> {
        (**self).reserve(size, align)
    }

    fn release(&self, addr: u64) -> bool {
        (**self).release(addr)
    }

    fn is_reserved(&self, buf: &DmaBuffer) -> bool {
        (**self).is_reserved(buf)
    }
}
