//! First-fit range allocator.
//!
//! Bookkeeping only: tracks which parts of a physical address range are
//! reserved. The regions in [`super::region`] wrap it with actual memory.

use alloc::collections::BTreeMap;

/// Address-ordered first-fit allocator over `[base, base + size)`.
#[derive(Debug)]
pub struct RangeAllocator {
    base: u64,
    size: usize,
    /// Live reservations: start address -> length.
    reserved: BTreeMap<u64, usize>,
}

impl RangeAllocator {
    pub fn new(base: u64, size: usize) -> Self {
        RangeAllocator {
            base,
            size,
            reserved: BTreeMap::new(),
        }
    }

    /// First address of the managed range.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size of the managed range in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Reserve `size` bytes at an address aligned to `align`.
    ///
    /// `align` of 0 or 1 means byte alignment; other values must be powers
    /// of two. Returns `None` when no gap is large enough.
    pub fn reserve(&mut self, size: usize, align: usize) -> Option<u64> {
        if size == 0 {
            return None;
        }

        let align = align.max(1) as u64;
        if !align.is_power_of_two() {
            return None;
        }

        let limit = self.base.checked_add(self.size as u64)?;
        let size = size as u64;
        let mut cursor = self.base;
        let mut found = None;

        for (&start, &len) in &self.reserved {
            let candidate = align_up(cursor, align)?;
            if candidate.checked_add(size)? <= start {
                found = Some(candidate);
                break;
            }
            cursor = cursor.max(start + len as u64);
        }

        let addr = match found {
            Some(addr) => addr,
            None => {
                let candidate = align_up(cursor, align)?;
                if candidate.checked_add(size)? > limit {
                    return None;
                }
                candidate
            }
        };

        self.reserved.insert(addr, size as usize);
        Some(addr)
    }

    /// Release the reservation starting at `addr`, returning its length.
    pub fn release(&mut self, addr: u64) -> Option<usize> {
        self.reserved.remove(&addr)
    }

    /// Whether `[addr, addr + len)` lies inside a single live reservation.
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        let Some(end) = addr.checked_add(len as u64) else {
            return false;
        };

        match self.reserved.range(..=addr).next_back() {
            Some((&start, &size)) => end <= start + size as u64,
            None => false,
        }
    }

    /// Total bytes currently reserved.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved.values().sum()
    }

    /// Number of live reservations.
    pub fn reservations(&self) -> usize {
        self.reserved.len()
    }
}

fn align_up(addr: u64, align: u64) -> Option<u64> {
    Some(addr.checked_add(align - 1)? & !(align - 1))
}
