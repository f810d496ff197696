//! Split virtqueue.
//!
//! A virtqueue is the mechanism for bulk data transport between the driver
//! and the device. This module owns its memory layout, its lifecycle and
//! the push/pop protocol.
//!
//! # Memory Layout (ring block)
//! ```text
//! Offset              Size        Content
//! 0                   16 * N      Descriptor Table
//! 16N                 6 + 2N      Available Ring (driver area)
//! 16N + 6 + 2N        0..3        padding to 4 bytes
//! device              6 + 8N      Used Ring (device area)
//! ```
//!
//! Descriptor buffers live in a separate single reservation of
//! `N * buffer_len` bytes, sliced per descriptor.
//!
//! # Slot accounting
//!
//! `avail` is the published available index, `last_seen` the number of used
//! entries the driver has taken back. Slots `[avail, avail + free)` of the
//! available ring hold the descriptors the driver currently owns, where
//! `free = N - (avail - last_seen)`. A returned descriptor is written to
//! slot `last_seen mod N`, which the device has already consumed, so every
//! used entry is recycled exactly once.

pub mod available;
pub mod descriptor;
pub mod used;

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};
use spin::Mutex;

use crate::config::{QueueConfig, BUFFER_POOL_ALIGN, DESC_TABLE_ALIGN, USED_RING_ALIGN};
use crate::dma::{DmaAllocator, DmaBuffer};
use crate::error::{Result, VirtioError};

pub use available::AvailableRing;
pub use descriptor::{Descriptor, DescriptorFlags, Owner, RawDescriptor};
pub use used::{UsedElem, UsedRing};

/// Ring position of a free-running index.
///
/// Indices wrap at 65536, not at `size`; with a power-of-two size the
/// position stays continuous across the wrap.
#[inline]
pub fn ring_slot(index: u16, size: u16) -> u16 {
    index % size
}

/// Byte offsets of the three areas inside the ring block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLayout {
    /// Offset of the available ring.
    pub driver: usize,
    /// Padding between the available and used rings.
    pub padding: usize,
    /// Offset of the used ring, 4-byte aligned.
    pub device: usize,
    /// Total block size.
    pub size: usize,
}

impl QueueLayout {
    pub fn new(size: u16) -> Self {
        let driver = RawDescriptor::SIZE * size as usize;
        let avail_end = driver + AvailableRing::byte_len(size);
        let device = (avail_end + USED_RING_ALIGN - 1) & !(USED_RING_ALIGN - 1);

        QueueLayout {
            driver,
            padding: device - avail_end,
            device,
            size: device + UsedRing::byte_len(size),
        }
    }
}

/// Physical addresses handed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueAddress {
    /// Descriptor table.
    pub desc: u64,
    /// Available ring (driver area).
    pub driver: u64,
    /// Used ring (device area).
    pub device: u64,
}

/// Driver-side state, guarded by the queue lock.
struct QueueState {
    size: u16,
    buffer_len: usize,
    descriptors: Vec<Descriptor>,
    available: AvailableRing,
    used: UsedRing,
    /// Backing reservation of every descriptor buffer.
    pool: DmaBuffer,
    /// Ring block shared with the device.
    block: DmaBuffer,
    address: QueueAddress,
    /// Used entries taken back by the driver.
    last_seen: u16,
}

/// Split virtqueue.
///
/// All operations serialize on a single lock; none of them blocks. `pop`
/// returning `None` is the only backpressure signal on the receive side,
/// `VirtioError::QueueFull` the only one on the transmit side. Waiting
/// (polling or an interrupt) is up to the caller.
///
/// Dropping the queue (or calling [`destroy`](Self::destroy)) releases all
/// of its DMA memory. The device must have been told to stop using the
/// queue before that.
pub struct VirtQueue<D: DmaAllocator> {
    dma: D,
    state: Mutex<QueueState>,
}

impl<D: DmaAllocator> VirtQueue<D> {
    /// Allocate and lay out a queue.
    ///
    /// On failure nothing stays reserved and no address exists that could
    /// be registered with a device.
    pub fn init(dma: D, config: QueueConfig) -> Result<Self> {
        config.validate()?;

        let size = config.size;
        let layout = QueueLayout::new(size);

        // A single reservation backs all descriptor buffers to avoid
        // fragmenting the DMA region.
        let pool = dma.reserve(config.pool_len(), BUFFER_POOL_ALIGN).map_err(|e| {
            log::error!("[VirtIO] queue init: buffer pool reservation failed: {}", e);
            e
        })?;

        let mut descriptors = Vec::with_capacity(size as usize);
        for chunk in pool.chunks(config.buffer_len) {
            match Descriptor::bind(&dma, chunk, config.flags) {
                Ok(desc) => descriptors.push(desc),
                Err(e) => {
                    dma.release(pool.addr());
                    return Err(e);
                }
            }
        }

        let mut available = AvailableRing::new(size);
        let mut used = UsedRing::new(size);

        let mut image = Vec::with_capacity(layout.size);
        for desc in &descriptors {
            image.extend_from_slice(&desc.encode());
        }
        image.extend_from_slice(&available.encode());
        image.resize(layout.device, 0);
        image.extend_from_slice(&used.encode());
        debug_assert_eq!(image.len(), layout.size);

        let block = match dma.reserve(layout.size, DESC_TABLE_ALIGN) {
            Ok(block) => block,
            Err(e) => {
                log::error!("[VirtIO] queue init: ring block reservation failed: {}", e);
                dma.release(pool.addr());
                return Err(e);
            }
        };

        if let Err(e) = dma.write(block.addr(), &image) {
            dma.release(block.addr());
            dma.release(pool.addr());
            return Err(e);
        }

        let address = QueueAddress {
            desc: block.addr(),
            driver: block.addr() + layout.driver as u64,
            device: block.addr() + layout.device as u64,
        };

        available.attach(address.driver);
        used.attach(address.device);

        if config.is_receive() {
            // Every buffer goes to the device without a push per buffer.
            let published = descriptors
                .iter_mut()
                .enumerate()
                .try_for_each(|(i, desc)| desc.publish(i as u16))
                .and_then(|()| available.set_index(&dma, size));
            if let Err(e) = published {
                dma.release(block.addr());
                dma.release(pool.addr());
                return Err(e);
            }
        }

        log::debug!(
            "[VirtIO] queue init: size={} buffer_len={} desc={:#x} driver={:#x} device={:#x}{}",
            size,
            config.buffer_len,
            address.desc,
            address.driver,
            address.device,
            if config.is_receive() { " (rx)" } else { "" }
        );

        Ok(VirtQueue {
            dma,
            state: Mutex::new(QueueState {
                size,
                buffer_len: config.buffer_len,
                descriptors,
                available,
                used,
                pool,
                block,
                address,
                last_seen: 0,
            }),
        })
    }

    /// Physical addresses of descriptor table, driver area and device area.
    pub fn address(&self) -> QueueAddress {
        self.state.lock().address
    }

    /// Number of descriptors.
    pub fn size(&self) -> u16 {
        self.state.lock().size
    }

    /// Capacity of each descriptor buffer.
    pub fn buffer_len(&self) -> usize {
        self.state.lock().buffer_len
    }

    /// The DMA allocator backing this queue.
    pub fn dma(&self) -> &D {
        &self.dma
    }

    /// Descriptors published and not yet taken back by the driver.
    pub fn len(&self) -> u16 {
        self.state.lock().in_flight()
    }

    /// Whether no descriptor is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Published available index.
    pub fn available_index(&self) -> u16 {
        self.state.lock().available.index()
    }

    /// Completions the device produced that the driver has not taken back.
    pub fn pending(&self) -> Result<u16> {
        let mut state = self.state.lock();
        let used = state.used.current_index(&self.dma)?;
        Ok(used.wrapping_sub(state.last_seen))
    }

    /// Whether `pop` would return a buffer.
    pub fn has_pending(&self) -> Result<bool> {
        Ok(self.pending()? > 0)
    }

    /// Ownership of every descriptor, indexed by descriptor.
    pub fn owners(&self) -> Vec<Owner> {
        self.state.lock().descriptors.iter().map(Descriptor::owner).collect()
    }

    /// Number of descriptors currently owned by the device.
    pub fn device_owned(&self) -> usize {
        self.state
            .lock()
            .descriptors
            .iter()
            .filter(|desc| desc.owner() == Owner::Device)
            .count()
    }

    /// Decode the descriptor table as the device sees it.
    pub fn descriptor_table(&self) -> Result<Vec<RawDescriptor>> {
        let state = self.state.lock();
        let mut table = Vec::with_capacity(state.size as usize);
        for i in 0..state.size as u64 {
            let mut bytes = [0u8; RawDescriptor::SIZE];
            self.dma
                .read(state.address.desc + i * RawDescriptor::SIZE as u64, &mut bytes)?;
            table.push(RawDescriptor::decode(&bytes));
        }
        Ok(table)
    }

    /// Supply a buffer to the device.
    ///
    /// Claims the driver-owned descriptor at the next available slot,
    /// copies `buf` into it and publishes it. Completions the device has
    /// returned in the meantime are recycled without going through `pop`.
    ///
    /// The descriptor id comes from the driver's copy of the available
    /// ring; the shared copy may have been scribbled on by the device.
    pub fn push(&self, buf: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let dma = &self.dma;

        if buf.len() > state.buffer_len {
            return Err(VirtioError::BufferTooLarge {
                len: buf.len(),
                capacity: state.buffer_len,
            });
        }

        state.recycle(dma)?;

        if state.in_flight() >= state.size {
            log::warn!("[VirtIO] push: queue full ({} in flight)", state.size);
            return Err(VirtioError::QueueFull { size: state.size });
        }

        let slot = ring_slot(state.available.index(), state.size);
        let id = state.claim(slot)?;
        let desc_addr = state.address.desc + (id as usize * RawDescriptor::SIZE) as u64;

        // Payload and length land before the index moves.
        dma.write_u32(desc_addr + RawDescriptor::LEN_OFFSET as u64, buf.len() as u32)?;
        state.descriptors[id as usize].write(dma, buf)?;
        state.descriptors[id as usize].publish(id)?;
        state.available.publish(dma, id)?;

        let recycled = state.recycle(dma)?;

        log::trace!(
            "[VirtIO] push: desc={} len={} avail={} recycled={}",
            id,
            buf.len(),
            state.available.index(),
            recycled
        );
        Ok(())
    }

    /// Receive a single used buffer.
    ///
    /// Returns `Ok(None)` when the device has nothing new; this is not an
    /// error. The returned buffer is sized to the length the device
    /// reported, and its descriptor goes straight back to the device.
    pub fn pop(&self) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        let dma = &self.dma;

        let used_index = state.used.current_index(dma)?;
        if used_index == state.last_seen {
            return Ok(None);
        }
        state.check_used_index(used_index)?;

        let size = state.size;
        let tail = ring_slot(state.last_seen, size);
        let elem = state.used.entry_at(dma, tail)?;
        let id = state.check_used(elem)?;

        let desc = &state.descriptors[id as usize];
        let len = (elem.len as usize).min(desc.capacity());
        if len < elem.len as usize {
            log::warn!(
                "[VirtIO] pop: device reported {} bytes for a {} byte buffer",
                elem.len,
                desc.capacity()
            );
        }
        let mut buf = vec![0u8; len];
        desc.read(dma, &mut buf)?;

        // Hand the descriptor back to the device at the head of the free
        // window. If other descriptors are free, the one displaced from the
        // head moves to the slot the used entry was recycled into.
        let free = size - state.in_flight();
        let head = ring_slot(state.available.index(), size);
        let displaced = if free > 0 {
            Some(state.available.cached(head)?)
        } else {
            None
        };

        // Nothing past this point reads device-visible state.
        state.descriptors[id as usize].reclaim(elem.id)?;
        if let Some(displaced) = displaced {
            state.available.set_ring_at(dma, tail, displaced)?;
        }
        state.last_seen = state.last_seen.wrapping_add(1);
        state.descriptors[id as usize].publish(id)?;
        state.available.publish(dma, id)?;

        log::trace!(
            "[VirtIO] pop: desc={} len={} avail={} last_seen={}",
            id,
            len,
            state.available.index(),
            state.last_seen
        );
        Ok(Some(buf))
    }

    /// Release every DMA buffer and the ring block.
    ///
    /// Consumes the queue, so no operation can follow.
    pub fn destroy(self) {
        drop(self);
    }
}

impl<D: DmaAllocator> Drop for VirtQueue<D> {
    fn drop(&mut self) {
        let state = self.state.get_mut();

        state.available.detach();
        state.used.detach();

        // Descriptor buffers are slices of the pool: the first one starts
        // the reservation, releasing the rest is a no-op.
        let mut released = 0;
        for desc in state.descriptors.drain(..) {
            if desc.release(&self.dma) {
                released += 1;
            }
        }
        if released == 0 && !state.pool.is_empty() {
            self.dma.release(state.pool.addr());
        }
        self.dma.release(state.block.addr());

        log::debug!(
            "[VirtIO] queue destroy: desc={:#x} pool={:#x}+{:#x}",
            state.address.desc,
            state.pool.addr(),
            state.pool.len()
        );
    }
}

impl QueueState {
    /// Published descriptors not yet taken back.
    fn in_flight(&self) -> u16 {
        self.available.index().wrapping_sub(self.last_seen)
    }

    fn check_used_index(&self, used_index: u16) -> Result<()> {
        if used_index.wrapping_sub(self.last_seen) > self.in_flight() {
            log::warn!(
                "[VirtIO] used index {} ahead of {} in-flight descriptors",
                used_index,
                self.in_flight()
            );
            return Err(VirtioError::UsedIndexOverrun {
                used: used_index,
                in_flight: self.in_flight(),
            });
        }
        Ok(())
    }

    /// Validate a used element without changing ownership.
    fn check_used(&self, elem: UsedElem) -> Result<u16> {
        if elem.id >= self.size as u32 {
            log::warn!("[VirtIO] device returned out-of-range descriptor {}", elem.id);
            return Err(VirtioError::InvalidUsedId { id: elem.id });
        }
        if self.descriptors[elem.id as usize].owner() != Owner::Device {
            log::warn!("[VirtIO] device returned descriptor {} it does not own", elem.id);
            return Err(VirtioError::InvalidUsedId { id: elem.id });
        }
        Ok(elem.id as u16)
    }

    /// Take a used element's descriptor back from the device.
    fn reclaim(&mut self, elem: UsedElem) -> Result<u16> {
        let id = self.check_used(elem)?;
        self.descriptors[id as usize].reclaim(elem.id)?;
        Ok(id)
    }

    /// Driver-owned descriptor stored at free slot `slot`.
    fn claim(&self, slot: u16) -> Result<u16> {
        let id = self.available.cached(slot)?;
        match self.descriptors.get(id as usize) {
            Some(desc) if desc.owner() == Owner::Driver => Ok(id),
            Some(_) => Err(VirtioError::DescriptorBusy { id }),
            None => Err(VirtioError::DescriptorOutOfRange {
                index: id as u32,
                size: self.size,
            }),
        }
    }

    /// Return every pending used entry to the free window, oldest first.
    fn recycle<D: DmaAllocator>(&mut self, dma: &D) -> Result<u16> {
        let used_index = self.used.current_index(dma)?;
        self.check_used_index(used_index)?;

        let pending = used_index.wrapping_sub(self.last_seen);
        for _ in 0..pending {
            let slot = ring_slot(self.last_seen, self.size);
            let elem = self.used.entry_at(dma, slot)?;
            let id = self.reclaim(elem)?;
            self.available.set_ring_at(dma, slot, id)?;
            self.last_seen = self.last_seen.wrapping_add(1);
        }

        if pending > 0 {
            fence(Ordering::SeqCst);
        }
        Ok(pending)
    }
}
