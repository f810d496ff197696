//! Used ring (device area).
//!
//! Written by the device, read by the driver:
//!
//! ```text
//! Offset      Size        Content
//! 0           2           flags
//! 2           2           idx (free-running)
//! 4           8 * N       ring[N] { id: u32, len: u32 }
//! 4 + 8N      2           avail_event
//! ```

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

use crate::dma::PhysMemory;
use crate::error::{Result, VirtioError};

const INDEX_OFFSET: u64 = 2;
const RING_OFFSET: u64 = 4;

/// Used ring element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsedElem {
    /// Index of the descriptor chain head.
    pub id: u32,
    /// Total bytes written to the buffer by the device.
    pub len: u32,
}

impl UsedElem {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.id.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.len.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8; Self::SIZE]) -> Self {
        UsedElem {
            id: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            len: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// Device-owned used ring, read-only for the driver.
#[derive(Debug)]
pub struct UsedRing {
    flags: u16,
    index: u16,
    ring: Vec<UsedElem>,
    avail_event: u16,
    /// Physical address of the device area once attached.
    base: Option<u64>,
}

impl UsedRing {
    /// Create a ring of `size` empty elements.
    pub fn new(size: u16) -> Self {
        UsedRing {
            flags: 0,
            index: 0,
            ring: vec![UsedElem::default(); size as usize],
            avail_event: 0,
            base: None,
        }
    }

    /// Byte size of the ring for `size` elements.
    pub const fn byte_len(size: u16) -> usize {
        4 + UsedElem::SIZE * size as usize + 2
    }

    pub fn size(&self) -> u16 {
        self.ring.len() as u16
    }

    /// Serialize the ring for the initial DMA image.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::byte_len(self.size()));
        bytes.extend_from_slice(&self.flags.to_le_bytes());
        bytes.extend_from_slice(&self.index.to_le_bytes());
        for elem in &self.ring {
            bytes.extend_from_slice(&elem.encode());
        }
        bytes.extend_from_slice(&self.avail_event.to_le_bytes());
        bytes
    }

    pub fn attach(&mut self, base: u64) {
        self.base = Some(base);
    }

    pub fn detach(&mut self) {
        self.base = None;
    }

    /// Read the device's free-running completion counter.
    ///
    /// Entries up to the returned index are visible once this returns.
    pub fn current_index<M: PhysMemory + ?Sized>(&mut self, mem: &M) -> Result<u16> {
        if let Some(base) = self.base {
            self.index = mem.read_u16(base + INDEX_OFFSET)?;
            fence(Ordering::SeqCst);
        }
        Ok(self.index)
    }

    /// Decode the element at slot `n`.
    pub fn entry_at<M: PhysMemory + ?Sized>(&mut self, mem: &M, n: u16) -> Result<UsedElem> {
        if n >= self.size() {
            return Err(VirtioError::DescriptorOutOfRange {
                index: n as u32,
                size: self.size(),
            });
        }

        if let Some(base) = self.base {
            let mut bytes = [0u8; UsedElem::SIZE];
            mem.read(base + RING_OFFSET + (UsedElem::SIZE * n as usize) as u64, &mut bytes)?;
            self.ring[n as usize] = UsedElem::decode(&bytes);
        }
        Ok(self.ring[n as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::HeapRegion;

    #[test]
    fn test_encode_empty() {
        let ring = UsedRing::new(2);
        assert_eq!(ring.encode(), vec![0u8; UsedRing::byte_len(2)]);
        assert_eq!(UsedRing::byte_len(2), 22);
    }

    #[test]
    fn test_reads_device_writes() {
        let region = HeapRegion::new(0x2000, 0x100);
        let mut ring = UsedRing::new(4);
        ring.attach(0x2040);

        region.write_u32(0x2040 + 4 + 8 * 3, 2).unwrap();
        region.write_u32(0x2040 + 4 + 8 * 3 + 4, 1500).unwrap();
        region.write_u16(0x2042, 1).unwrap();

        assert_eq!(ring.current_index(&region).unwrap(), 1);
        assert_eq!(ring.entry_at(&region, 3).unwrap(), UsedElem { id: 2, len: 1500 });
    }

    #[test]
    fn test_detached_uses_cache() {
        let region = HeapRegion::new(0, 0x100);
        let mut ring = UsedRing::new(4);
        region.write_u16(2, 9).unwrap();
        assert_eq!(ring.current_index(&region).unwrap(), 0);
    }

    #[test]
    fn test_entry_out_of_range() {
        let region = HeapRegion::new(0, 0x100);
        let mut ring = UsedRing::new(4);
        assert!(ring.entry_at(&region, 4).is_err());
    }

    #[test]
    fn test_elem_codec() {
        let elem = UsedElem { id: 0x0102_0304, len: 10 };
        assert_eq!(elem.encode(), [4, 3, 2, 1, 10, 0, 0, 0]);
        assert_eq!(UsedElem::decode(&elem.encode()), elem);
    }
}
