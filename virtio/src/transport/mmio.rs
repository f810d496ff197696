//! VirtIO-MMIO transport (version 2, "modern").
//!
//! # Register Map (subset used by the queue)
//! ```text
//! Offset  Name                Access
//! 0x000   MagicValue          R       0x74726976 ("virt")
//! 0x004   Version             R       2
//! 0x008   DeviceID            R
//! 0x030   QueueSel            W
//! 0x034   QueueNumMax         R
//! 0x038   QueueNum            W
//! 0x044   QueueReady          RW
//! 0x050   QueueNotify         W
//! 0x060   InterruptStatus     R
//! 0x064   InterruptACK        W
//! 0x070   Status              RW
//! 0x080   QueueDescLow/High   W
//! 0x090   QueueDriverLow/High W
//! 0x0a0   QueueDeviceLow/High W
//! ```

use super::{QueueTransport, RegisterBlock};
use crate::error::{Result, VirtioError};
use crate::queue::QueueAddress;

/// Default base of the first virtio-mmio slot on a microvm board.
pub const VIRTIO_MMIO_BASE: u64 = 0xc000_0000;

/// "virt" in little-endian.
pub const MAGIC: u32 = 0x7472_6976;

pub const VERSION: u32 = 2;

pub mod regs {
    pub const MAGIC_VALUE: usize = 0x000;
    pub const VERSION: usize = 0x004;
    pub const DEVICE_ID: usize = 0x008;
    pub const QUEUE_SEL: usize = 0x030;
    pub const QUEUE_NUM_MAX: usize = 0x034;
    pub const QUEUE_NUM: usize = 0x038;
    pub const QUEUE_READY: usize = 0x044;
    pub const QUEUE_NOTIFY: usize = 0x050;
    pub const INTERRUPT_STATUS: usize = 0x060;
    pub const INTERRUPT_ACK: usize = 0x064;
    pub const STATUS: usize = 0x070;
    pub const QUEUE_DESC_LOW: usize = 0x080;
    pub const QUEUE_DESC_HIGH: usize = 0x084;
    pub const QUEUE_DRIVER_LOW: usize = 0x090;
    pub const QUEUE_DRIVER_HIGH: usize = 0x094;
    pub const QUEUE_DEVICE_LOW: usize = 0x0a0;
    pub const QUEUE_DEVICE_HIGH: usize = 0x0a4;
}

bitflags::bitflags! {
    /// Device status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u32 {
        const ACKNOWLEDGE = 1 << 0;
        const DRIVER = 1 << 1;
        const DRIVER_OK = 1 << 2;
        const FEATURES_OK = 1 << 3;
        const DEVICE_NEEDS_RESET = 1 << 6;
        const FAILED = 1 << 7;
    }
}

/// A VirtIO-MMIO device.
pub struct MmioTransport<R: RegisterBlock> {
    regs: R,
    device_id: u32,
}

impl<R: RegisterBlock> MmioTransport<R> {
    /// Check the register block, rejecting anything but a version 2 device.
    pub fn new(block: R) -> Result<Self> {
        let magic = block.read32(regs::MAGIC_VALUE);
        let version = block.read32(regs::VERSION);
        if magic != MAGIC || version != VERSION {
            return Err(VirtioError::UnsupportedTransport { magic, version });
        }

        let device_id = block.read32(regs::DEVICE_ID);
        log::info!("[VirtIO] mmio device id={} found", device_id);
        Ok(MmioTransport {
            regs: block,
            device_id,
        })
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.regs.read32(regs::STATUS))
    }

    /// OR `status` into the device status register.
    pub fn add_status(&mut self, status: DeviceStatus) {
        self.regs.or(regs::STATUS, status.bits());
    }

    pub fn reset(&mut self) {
        self.regs.write32(regs::STATUS, 0);
    }

    fn write_addr(&self, low: usize, high: usize, addr: u64) {
        self.regs.write32(low, addr as u32);
        self.regs.write32(high, (addr >> 32) as u32);
    }
}

impl<R: RegisterBlock> QueueTransport for MmioTransport<R> {
    fn max_queue_size(&mut self, queue: u16) -> u32 {
        self.regs.write32(regs::QUEUE_SEL, queue as u32);
        self.regs.read32(regs::QUEUE_NUM_MAX)
    }

    fn setup_queue(&mut self, queue: u16, size: u16, address: QueueAddress) -> Result<()> {
        let max = self.max_queue_size(queue);
        if max == 0 {
            return Err(VirtioError::QueueUnavailable { queue, max });
        }
        if self.regs.is_set(regs::QUEUE_READY, 0) {
            log::warn!("[VirtIO] mmio queue {} already ready", queue);
            return Err(VirtioError::QueueUnavailable { queue, max });
        }
        if size as u32 > max {
            return Err(VirtioError::InvalidQueueSize(size));
        }

        self.regs.write32(regs::QUEUE_NUM, size as u32);
        self.write_addr(regs::QUEUE_DESC_LOW, regs::QUEUE_DESC_HIGH, address.desc);
        self.write_addr(regs::QUEUE_DRIVER_LOW, regs::QUEUE_DRIVER_HIGH, address.driver);
        self.write_addr(regs::QUEUE_DEVICE_LOW, regs::QUEUE_DEVICE_HIGH, address.device);
        self.regs.write32(regs::QUEUE_READY, 1);

        log::debug!(
            "[VirtIO] mmio queue {}: size={} desc={:#x} driver={:#x} device={:#x}",
            queue,
            size,
            address.desc,
            address.driver,
            address.device
        );
        Ok(())
    }

    fn notify(&mut self, queue: u16) {
        self.regs.write32(regs::QUEUE_NOTIFY, queue as u32);
    }

    fn ack_interrupt(&mut self) -> u32 {
        let status = self.regs.read32(regs::INTERRUPT_STATUS);
        if status != 0 {
            self.regs.write32(regs::INTERRUPT_ACK, status);
        }
        status
    }
}
