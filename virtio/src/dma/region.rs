//! DMA region implementations.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use super::allocator::RangeAllocator;
use super::{DmaAllocator, DmaBuffer, PhysMemory};
use crate::error::{Result, VirtioError};

/// Simulated DMA region.
///
/// Physical addresses `[base, base + size)` map onto an in-process byte
/// array. Both driver and simulated device access it through
/// [`PhysMemory`], so the full ring protocol can run without hardware.
pub struct HeapRegion {
    base: u64,
    memory: Mutex<Vec<u8>>,
    allocator: Mutex<RangeAllocator>,
}

impl HeapRegion {
    /// Create a zero-filled region of `size` bytes starting at `base`.
    pub fn new(base: u64, size: usize) -> Self {
        HeapRegion {
            base,
            memory: Mutex::new(vec![0; size]),
            allocator: Mutex::new(RangeAllocator::new(base, size)),
        }
    }

    /// First physical address of the region.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Region size in bytes.
    pub fn size(&self) -> usize {
        self.memory.lock().len()
    }

    /// Bytes currently reserved.
    pub fn reserved_bytes(&self) -> usize {
        self.allocator.lock().reserved_bytes()
    }

    /// Number of live reservations.
    pub fn reservations(&self) -> usize {
        self.allocator.lock().reservations()
    }

    fn offset(&self, addr: u64, len: usize, total: usize) -> Result<usize> {
        let out_of_bounds = VirtioError::OutOfBounds { addr, len };
        let offset = addr.checked_sub(self.base).ok_or(out_of_bounds.clone())? as usize;
        match offset.checked_add(len) {
            Some(end) if end <= total => Ok(offset),
            _ => Err(out_of_bounds),
        }
    }
}

impl PhysMemory for HeapRegion {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        let memory = self.memory.lock();
        let off = self.offset(addr, dst.len(), memory.len())?;
        dst.copy_from_slice(&memory[off..off + dst.len()]);
        Ok(())
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<()> {
        let mut memory = self.memory.lock();
        let off = self.offset(addr, src.len(), memory.len())?;
        memory[off..off + src.len()].copy_from_slice(src);
        Ok(())
    }
}

impl DmaAllocator for HeapRegion {
    fn reserve(&self, size: usize, align: usize) -> Result<DmaBuffer> {
        let addr = self
            .allocator
            .lock()
            .reserve(size, align)
            .ok_or(VirtioError::OutOfDmaMemory { size, align })?;

        // Fresh reservations start zeroed, like freshly mapped pages.
        let mut memory = self.memory.lock();
        let off = (addr - self.base) as usize;
        memory[off..off + size].fill(0);

        log::trace!("[DMA] reserve {:#x}+{:#x} (align {})", addr, size, align);
        Ok(DmaBuffer::new(addr, size))
    }

    fn release(&self, addr: u64) -> bool {
        let released = self.allocator.lock().release(addr);
        if let Some(size) = released {
            log::trace!("[DMA] release {:#x}+{:#x}", addr, size);
        }
        released.is_some()
    }

    fn is_reserved(&self, buf: &DmaBuffer) -> bool {
        self.allocator.lock().contains(buf.addr(), buf.len())
    }
}

/// Identity-mapped physical memory.
///
/// Physical addresses are used directly as pointers, as on bare metal with
/// paging disabled or an identity map in place. All accesses are volatile
/// so the compiler cannot elide or merge writes the device depends on.
pub struct IdentityRegion {
    start: u64,
    size: usize,
    allocator: Mutex<RangeAllocator>,
}

impl IdentityRegion {
    /// Manage `size` bytes of physical memory starting at `start`.
    ///
    /// # Safety
    ///
    /// The range must be mapped, readable and writable at the same virtual
    /// address, reachable by the device, and used by nothing else for the
    /// lifetime of the region.
    pub unsafe fn new(start: u64, size: usize) -> Self {
        IdentityRegion {
            start,
            size,
            allocator: Mutex::new(RangeAllocator::new(start, size)),
        }
    }

    fn check(&self, addr: u64, len: usize) -> Result<*mut u8> {
        let end = addr.checked_add(len as u64);
        let limit = self.start.checked_add(self.size as u64);
        match (end, limit) {
            (Some(end), Some(limit)) if addr >= self.start && end <= limit => {
                Ok(addr as usize as *mut u8)
            }
            _ => Err(VirtioError::OutOfBounds { addr, len }),
        }
    }
}

impl PhysMemory for IdentityRegion {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        let ptr = self.check(addr, dst.len())?;
        for (i, byte) in dst.iter_mut().enumerate() {
            // SAFETY: bounds checked above; the range is mapped per `new`.
            *byte = unsafe { core::ptr::read_volatile(ptr.add(i)) };
        }
        Ok(())
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<()> {
        let ptr = self.check(addr, src.len())?;
        for (i, byte) in src.iter().enumerate() {
            // SAFETY: bounds checked above; the range is mapped per `new`.
            unsafe { core::ptr::write_volatile(ptr.add(i), *byte) };
        }
        Ok(())
    }
}

impl DmaAllocator for IdentityRegion {
    fn reserve(&self, size: usize, align: usize) -> Result<DmaBuffer> {
        let addr = self
            .allocator
            .lock()
            .reserve(size, align)
            .ok_or(VirtioError::OutOfDmaMemory { size, align })?;
        Ok(DmaBuffer::new(addr, size))
    }

    fn release(&self, addr: u64) -> bool {
        self.allocator.lock().release(addr).is_some()
    }

    fn is_reserved(&self, buf: &DmaBuffer) -> bool {
        self.allocator.lock().contains(buf.addr(), buf.len())
    }
}

unsafe impl Send for IdentityRegion {}
unsafe impl Sync for IdentityRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_region_read_write() {
        let region = HeapRegion::new(0x8000_0000, 0x1000);
        region.write_u32(0x8000_0010, 0xdead_beef).unwrap();
        assert_eq!(region.read_u32(0x8000_0010).unwrap(), 0xdead_beef);

        let mut bytes = [0u8; 4];
        region.read(0x8000_0010, &mut bytes).unwrap();
        assert_eq!(bytes, [0xef, 0xbe, 0xad, 0xde]);
    }

    #[test]
    fn test_heap_region_bounds() {
        let region = HeapRegion::new(0x1000, 0x100);
        assert!(matches!(
            region.write_u16(0x10ff, 1),
            Err(VirtioError::OutOfBounds { .. })
        ));
        assert!(region.read_u16(0x0fff).is_err());
    }

    #[test]
    fn test_heap_region_reserve_zeroes() {
        let region = HeapRegion::new(0, 0x100);
        region.write(0, &[0xff; 16]).unwrap();
        let buf = region.reserve(16, 0).unwrap();
        let mut bytes = [0xaa; 16];
        region.read(buf.addr(), &mut bytes).unwrap();
        assert_eq!(bytes, [0; 16]);
    }

    #[test]
    fn test_heap_region_bound_buffers() {
        let region = HeapRegion::new(0x10_0000, 0x1000);
        let buf = region.reserve(256, 16).unwrap();
        assert!(region.is_reserved(&buf));
        assert!(region.is_reserved(&buf.slice(64, 64).unwrap()));
        assert!(!region.is_reserved(&DmaBuffer::new(buf.end().unwrap(), 1)));

        assert!(region.release(buf.addr()));
        assert!(!region.is_reserved(&buf));
        assert_eq!(region.try_release(buf.addr()), Err(VirtioError::NotReserved(buf.addr())));
    }

    #[test]
    fn test_identity_region_volatile_access() {
        let mut backing = vec![0u8; 256];
        let start = backing.as_mut_ptr() as u64;
        let region = unsafe { IdentityRegion::new(start, backing.len()) };

        let buf = region.reserve(32, 8).unwrap();
        region.write_u64(buf.addr(), 0x0102_0304_0506_0708).unwrap();
        assert_eq!(region.read_u64(buf.addr()).unwrap(), 0x0102_0304_0506_0708);
        assert!(region.read_u16(start + 255).is_err());
        drop(region);
        assert_eq!(backing[(buf.addr() - start) as usize], 0x08);
    }

    #[test]
    fn test_identity_region_rejects_wrapping_range() {
        // never dereferenced: every access below fails the bounds check
        let region = unsafe { IdentityRegion::new(u64::MAX - 8, 64) };
        let mut bytes = [0u8; 2];
        assert!(matches!(
            region.read(u64::MAX - 4, &mut bytes),
            Err(VirtioError::OutOfBounds { .. })
        ));
        assert!(region.write(u64::MAX - 1, &[0; 4]).is_err());
    }
}
