//! Device register glue.
//!
//! The queue only needs two things from a transport: a place to write the
//! three physical addresses returned by `VirtQueue::address`, and a way to
//! tell the device that new available entries exist. Completion signalling
//! (an interrupt such as MSI-X) is configured separately.

pub mod mmio;
pub mod msix;

use crate::error::Result;
use crate::queue::QueueAddress;

pub use mmio::MmioTransport;
pub use msix::{MsixCapability, PciFunction};

/// Queue registration and notification.
pub trait QueueTransport {
    /// Largest queue size the device supports for `queue` (0 if absent).
    fn max_queue_size(&mut self, queue: u16) -> u32;

    /// Hand a queue's size and area addresses to the device and enable it.
    fn setup_queue(&mut self, queue: u16, size: u16, address: QueueAddress) -> Result<()>;

    /// Notify the device that `queue` has new available entries.
    fn notify(&mut self, queue: u16);

    /// Acknowledge pending interrupts, returning the status bits.
    fn ack_interrupt(&mut self) -> u32;
}

/// 32-bit register file addressed by byte offset.
///
/// The bit helpers are read-modify-write sequences and are not atomic with
/// respect to the device.
pub trait RegisterBlock {
    fn read32(&self, offset: usize) -> u32;

    fn write32(&self, offset: usize, value: u32);

    /// Whether bit `pos` is set.
    fn is_set(&self, offset: usize, pos: u32) -> bool {
        (self.read32(offset) >> pos) & 1 == 1
    }

    /// Field of `mask` width at bit `pos`.
    fn get(&self, offset: usize, pos: u32, mask: u32) -> u32 {
        (self.read32(offset) >> pos) & mask
    }

    fn set(&self, offset: usize, pos: u32) {
        let value = self.read32(offset) | (1 << pos);
        self.write32(offset, value);
    }

    fn clear(&self, offset: usize, pos: u32) {
        let value = self.read32(offset) & !(1 << pos);
        self.write32(offset, value);
    }

    fn set_to(&self, offset: usize, pos: u32, value: bool) {
        if value {
            self.set(offset, pos);
        } else {
            self.clear(offset, pos);
        }
    }

    /// Replace the field of `mask` width at bit `pos` with `value`.
    fn set_n(&self, offset: usize, pos: u32, mask: u32, value: u32) {
        let reg = self.read32(offset);
        self.write32(offset, (reg & !(mask << pos)) | ((value & mask) << pos));
    }

    fn clear_n(&self, offset: usize, pos: u32, mask: u32) {
        let value = self.read32(offset) & !(mask << pos);
        self.write32(offset, value);
    }

    fn or(&self, offset: usize, bits: u32) {
        let value = self.read32(offset) | bits;
        self.write32(offset, value);
    }
}

/// Memory-mapped register block at a fixed virtual address.
pub struct MmioRegisters {
    base: usize,
}

impl MmioRegisters {
    /// # Safety
    ///
    /// `base` must point to a mapped, device-backed register block large
    /// enough for every offset accessed through it.
    pub unsafe fn new(base: usize) -> Self {
        MmioRegisters { base }
    }

    pub fn base(&self) -> usize {
        self.base
    }
}

impl RegisterBlock for MmioRegisters {
    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: validity of the block is the contract of `new`.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write32(&self, offset: usize, value: u32) {
        // SAFETY: validity of the block is the contract of `new`.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}

unsafe impl Send for MmioRegisters {}
unsafe impl Sync for MmioRegisters {}

#[cfg(test)]
mod tests {
    use super::*;
    use spin::Mutex;

    struct Regs(Mutex<[u32; 4]>);

    impl RegisterBlock for Regs {
        fn read32(&self, offset: usize) -> u32 {
            self.0.lock()[offset / 4]
        }

        fn write32(&self, offset: usize, value: u32) {
            self.0.lock()[offset / 4] = value;
        }
    }

    #[test]
    fn test_bit_helpers() {
        let regs = Regs(Mutex::new([0; 4]));
        regs.set(4, 3);
        assert!(regs.is_set(4, 3));
        assert_eq!(regs.read32(4), 0b1000);

        regs.set_to(4, 0, true);
        regs.clear(4, 3);
        assert_eq!(regs.read32(4), 1);

        regs.set_n(8, 4, 0xf, 0xa);
        assert_eq!(regs.get(8, 4, 0xf), 0xa);
        regs.set_n(8, 4, 0xf, 0x13);
        assert_eq!(regs.read32(8), 0x30);

        regs.or(8, 1);
        regs.clear_n(8, 4, 0xf);
        assert_eq!(regs.read32(8), 1);
    }

    #[test]
    fn test_mmio_registers() {
        let mut backing = [0u32; 4];
        let regs = unsafe { MmioRegisters::new(backing.as_mut_ptr() as usize) };
        regs.write32(8, 0x1234);
        assert_eq!(regs.read32(8), 0x1234);
        drop(regs);
        assert_eq!(backing[2], 0x1234);
    }
}
