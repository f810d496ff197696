//! Virtqueue descriptors.
//!
//! A descriptor points the device at one DMA buffer. The driver owns the
//! descriptor arena; the device only ever sees the 16-byte wire form in the
//! descriptor table.
//!
//! # Ownership
//! ```text
//!     DRIVER ──publish()──> DEVICE
//!       ▲                     │
//!       └──────reclaim()──────┘
//! ```
//!
//! Touching the buffer of a DEVICE-owned descriptor races with the peer.

use crate::dma::{DmaAllocator, DmaBuffer, PhysMemory};
use crate::error::{Result, VirtioError};

bitflags::bitflags! {
    /// Descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[repr(transparent)]
    pub struct DescriptorFlags: u16 {
        /// Buffer continues via the next field.
        const NEXT = 1 << 0;
        /// Buffer is write-only for the device (driver reads).
        const WRITE = 1 << 1;
        /// Buffer contains a list of buffer descriptors.
        const INDIRECT = 1 << 2;
    }
}

/// Wire form of a descriptor, as laid out in the descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawDescriptor {
    /// Physical address of the buffer.
    pub addr: u64,
    /// Length of the buffer.
    pub len: u32,
    /// Descriptor flags.
    pub flags: DescriptorFlags,
    /// Next descriptor index if NEXT is set.
    pub next: u16,
}

impl RawDescriptor {
    /// Size of a descriptor table entry.
    pub const SIZE: usize = 16;

    /// Offset of the length field within an entry.
    pub const LEN_OFFSET: usize = 8;

    /// Encode as little-endian `addr | len | flags | next`.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.addr.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.len.to_le_bytes());
        bytes[12..14].copy_from_slice(&self.flags.bits().to_le_bytes());
        bytes[14..16].copy_from_slice(&self.next.to_le_bytes());
        bytes
    }

    /// Decode a descriptor table entry. Unknown flag bits are retained.
    pub fn decode(bytes: &[u8; Self::SIZE]) -> Self {
        RawDescriptor {
            addr: u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
            len: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            flags: DescriptorFlags::from_bits_retain(u16::from_le_bytes([bytes[12], bytes[13]])),
            next: u16::from_le_bytes([bytes[14], bytes[15]]),
        }
    }
}

/// Which side of the ring currently owns a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Free or being filled/drained by the driver.
    Driver,
    /// Published on the available ring, not yet returned on the used ring.
    Device,
}

/// A descriptor bound to one DMA buffer.
#[derive(Debug)]
pub struct Descriptor {
    raw: RawDescriptor,
    buffer: DmaBuffer,
    owner: Owner,
}

impl Descriptor {
    /// Bind a descriptor to `buffer`, which must have been reserved through
    /// `dma`.
    ///
    /// An unbound buffer is a programmer error: the device would be handed
    /// an address nobody reserved.
    pub fn bind<D: DmaAllocator + ?Sized>(
        dma: &D,
        buffer: DmaBuffer,
        flags: DescriptorFlags,
    ) -> Result<Self> {
        if buffer.len() > u32::MAX as usize {
            return Err(VirtioError::InvalidBufferLength(buffer.len()));
        }
        if !dma.is_reserved(&buffer) {
            return Err(VirtioError::UnboundBuffer {
                addr: buffer.addr(),
                len: buffer.len(),
            });
        }

        Ok(Descriptor {
            raw: RawDescriptor {
                addr: buffer.addr(),
                len: buffer.len() as u32,
                flags,
                next: 0,
            },
            buffer,
            owner: Owner::Driver,
        })
    }

    /// Current wire-level fields.
    pub fn raw(&self) -> RawDescriptor {
        self.raw
    }

    /// Encode the 16-byte descriptor table entry.
    pub fn encode(&self) -> [u8; RawDescriptor::SIZE] {
        self.raw.encode()
    }

    pub fn addr(&self) -> u64 {
        self.raw.addr
    }

    /// Recorded data length.
    pub fn len(&self) -> u32 {
        self.raw.len
    }

    /// Size of the bound buffer.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn flags(&self) -> DescriptorFlags {
        self.raw.flags
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// Copy the start of the buffer into `dst`, returning the bytes copied.
    pub fn read<M: PhysMemory + ?Sized>(&self, mem: &M, dst: &mut [u8]) -> Result<usize> {
        let n = dst.len().min(self.capacity());
        mem.read(self.buffer.addr(), &mut dst[..n])?;
        Ok(n)
    }

    /// Copy `src` into the buffer and record its length.
    pub fn write<M: PhysMemory + ?Sized>(&mut self, mem: &M, src: &[u8]) -> Result<()> {
        if src.len() > self.capacity() {
            return Err(VirtioError::BufferTooLarge {
                len: src.len(),
                capacity: self.capacity(),
            });
        }

        self.raw.len = src.len() as u32;
        mem.write(self.buffer.addr(), src)
    }

    /// Return the buffer to the allocator.
    ///
    /// Consumes the descriptor: it must no longer be referenced by either
    /// ring. Returns `false` when the buffer is a slice of a larger
    /// reservation that does not start at this descriptor's address.
    pub fn release<D: DmaAllocator + ?Sized>(self, dma: &D) -> bool {
        dma.release(self.buffer.addr())
    }

    /// Driver -> Device, right before the index is published.
    pub(crate) fn publish(&mut self, id: u16) -> Result<()> {
        if self.owner != Owner::Driver {
            return Err(VirtioError::DescriptorBusy { id });
        }
        self.owner = Owner::Device;
        Ok(())
    }

    /// Device -> Driver, after the device returned it on the used ring.
    pub(crate) fn reclaim(&mut self, id: u32) -> Result<()> {
        if self.owner != Owner::Device {
            return Err(VirtioError::InvalidUsedId { id });
        }
        self.owner = Owner::Driver;
        Ok(())
    }
}
