//! Queue configuration.
//!
//! A [`QueueConfig`] carries everything `VirtQueue::init` needs: the number
//! of descriptors, the size of the buffer bound to each descriptor, and the
//! descriptor flags. Receive-style queues (device writes into the buffers)
//! are marked with [`DescriptorFlags::WRITE`] and have all their buffers
//! handed to the device at initialization.

use crate::error::{Result, VirtioError};
use crate::queue::DescriptorFlags;

/// Maximum queue size allowed by the VirtIO split ring layout.
pub const MAX_QUEUE_SIZE: u16 = 32768;

/// Alignment of the descriptor table (and therefore the whole ring block).
pub const DESC_TABLE_ALIGN: usize = 16;

/// Alignment of the used ring relative to the ring block.
pub const USED_RING_ALIGN: usize = 4;

/// Alignment of the descriptor buffer pool.
///
/// Zero lets the allocator pick its natural alignment.
pub const BUFFER_POOL_ALIGN: usize = 0;

/// Virtqueue configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Number of descriptors (ring capacity).
    pub size: u16,
    /// Length in bytes of each descriptor buffer.
    pub buffer_len: usize,
    /// Flags applied to every descriptor.
    pub flags: DescriptorFlags,
}

impl QueueConfig {
    /// Create a transmit-style configuration (no flags).
    pub const fn new(size: u16, buffer_len: usize) -> Self {
        QueueConfig {
            size,
            buffer_len,
            flags: DescriptorFlags::empty(),
        }
    }

    /// Transmit queue: the driver fills buffers and pushes them.
    pub const fn tx(size: u16, buffer_len: usize) -> Self {
        Self::new(size, buffer_len)
    }

    /// Receive queue: all buffers are device-writable and pre-supplied.
    pub const fn rx(size: u16, buffer_len: usize) -> Self {
        Self::new(size, buffer_len).with_flags(DescriptorFlags::WRITE)
    }

    /// Replace the descriptor flags.
    pub const fn with_flags(mut self, flags: DescriptorFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Whether every buffer is handed to the device at initialization.
    pub fn is_receive(&self) -> bool {
        self.flags.contains(DescriptorFlags::WRITE)
    }

    /// Total bytes needed for the descriptor buffer pool.
    pub fn pool_len(&self) -> usize {
        self.size as usize * self.buffer_len
    }

    /// Check the configuration against the split ring constraints.
    ///
    /// The size must be a power of two so that ring positions stay
    /// consistent when the 16-bit free-running indices wrap.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 || self.size > MAX_QUEUE_SIZE || !self.size.is_power_of_two() {
            return Err(VirtioError::InvalidQueueSize(self.size));
        }

        if self.buffer_len == 0 || self.buffer_len > u32::MAX as usize {
            return Err(VirtioError::InvalidBufferLength(self.buffer_len));
        }

        Ok(())
    }
}
