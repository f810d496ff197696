//! Available ring (driver area).
//!
//! Written by the driver, read by the device:
//!
//! ```text
//! Offset      Size        Content
//! 0           2           flags
//! 2           2           idx (free-running)
//! 4           2 * N       ring[N] descriptor indices
//! 4 + 2N      2           used_event
//! ```

use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

use super::ring_slot;
use crate::dma::PhysMemory;
use crate::error::{Result, VirtioError};

const INDEX_OFFSET: u64 = 2;
const RING_OFFSET: u64 = 4;

/// Driver-owned available ring.
///
/// Until [`attach`](Self::attach) is called the ring only exists in its
/// in-process cache; afterwards every mutation is written through to DMA
/// memory and mirrored in the cache.
#[derive(Debug)]
pub struct AvailableRing {
    flags: u16,
    index: u16,
    ring: Vec<u16>,
    event_index: u16,
    /// Physical address of the driver area once attached.
    base: Option<u64>,
}

impl AvailableRing {
    /// Create a ring of `size` slots pre-filled with `0..size`.
    pub fn new(size: u16) -> Self {
        AvailableRing {
            flags: 0,
            index: 0,
            ring: (0..size).collect(),
            event_index: 0,
            base: None,
        }
    }

    /// Byte size of the ring for `size` slots.
    pub const fn byte_len(size: u16) -> usize {
        4 + 2 * size as usize + 2
    }

    /// Number of slots.
    pub fn size(&self) -> u16 {
        self.ring.len() as u16
    }

    /// Serialize the ring for the initial DMA image.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::byte_len(self.size()));
        bytes.extend_from_slice(&self.flags.to_le_bytes());
        bytes.extend_from_slice(&self.index.to_le_bytes());
        for slot in &self.ring {
            bytes.extend_from_slice(&slot.to_le_bytes());
        }
        bytes.extend_from_slice(&self.event_index.to_le_bytes());
        bytes
    }

    /// Point the ring at its driver area in DMA memory.
    pub fn attach(&mut self, base: u64) {
        self.base = Some(base);
    }

    /// Drop the DMA view; later accessors only touch the cache.
    pub fn detach(&mut self) {
        self.base = None;
    }

    pub fn is_attached(&self) -> bool {
        self.base.is_some()
    }

    /// Last published index (cached; the driver is the only writer).
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Update the published index.
    pub fn set_index<M: PhysMemory + ?Sized>(&mut self, mem: &M, index: u16) -> Result<()> {
        if let Some(base) = self.base {
            mem.write_u16(base + INDEX_OFFSET, index)?;
        }
        self.index = index;
        Ok(())
    }

    /// Descriptor index stored at slot `n`, as currently seen in memory.
    ///
    /// The value comes from device-visible memory and is not trusted: it
    /// never updates the cache.
    pub fn ring_at<M: PhysMemory + ?Sized>(&self, mem: &M, n: u16) -> Result<u16> {
        self.check_slot(n)?;
        match self.base {
            Some(base) => mem.read_u16(base + RING_OFFSET + 2 * n as u64),
            None => Ok(self.ring[n as usize]),
        }
    }

    /// Descriptor index the driver last stored at slot `n`.
    pub fn cached(&self, n: u16) -> Result<u16> {
        self.check_slot(n)?;
        Ok(self.ring[n as usize])
    }

    /// Store descriptor index `desc` at slot `n` without publishing it.
    pub fn set_ring_at<M: PhysMemory + ?Sized>(&mut self, mem: &M, n: u16, desc: u16) -> Result<()> {
        self.check_slot(n)?;
        if desc >= self.size() {
            return Err(VirtioError::DescriptorOutOfRange {
                index: desc as u32,
                size: self.size(),
            });
        }

        if let Some(base) = self.base {
            mem.write_u16(base + RING_OFFSET + 2 * n as u64, desc)?;
        }
        self.ring[n as usize] = desc;
        Ok(())
    }

    /// Publish `desc` in the next slot and advance the index.
    ///
    /// The slot write is ordered before the index write: the device may
    /// read the index at any time and dereference the slot right away.
    pub fn publish<M: PhysMemory + ?Sized>(&mut self, mem: &M, desc: u16) -> Result<u16> {
        let slot = ring_slot(self.index, self.size());
        self.set_ring_at(mem, slot, desc)?;

        fence(Ordering::SeqCst);

        let next = self.index.wrapping_add(1);
        self.set_index(mem, next)?;
        Ok(next)
    }

    fn check_slot(&self, n: u16) -> Result<()> {
        if n >= self.size() {
            return Err(VirtioError::DescriptorOutOfRange {
                index: n as u32,
                size: self.size(),
            });
        }
        Ok(())
    }
}
