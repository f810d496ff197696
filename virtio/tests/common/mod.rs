//! Simulated VirtIO device.
//!
//! Plays the device side of the split-ring protocol against a queue's
//! memory, using nothing but `PhysMemory`: it follows the available index,
//! decodes descriptors from the table and writes used entries.

use std::collections::VecDeque;
use std::sync::atomic::{fence, Ordering};

use kpio_virtio::queue::{RawDescriptor, UsedElem};
use kpio_virtio::{PhysMemory, QueueAddress};

/// Device end of one virtqueue.
pub struct SimDevice<M: PhysMemory> {
    mem: M,
    address: QueueAddress,
    size: u16,
    next_avail: u16,
    next_used: u16,
}

impl<M: PhysMemory> SimDevice<M> {
    pub fn new(mem: M, address: QueueAddress, size: u16) -> Self {
        SimDevice {
            mem,
            address,
            size,
            next_avail: 0,
            next_used: 0,
        }
    }

    /// Driver's published available index.
    pub fn available_index(&self) -> u16 {
        self.mem.read_u16(self.address.driver + 2).unwrap()
    }

    /// Next used index the device will publish.
    pub fn used_index(&self) -> u16 {
        self.next_used
    }

    /// Available entries not yet consumed.
    pub fn backlog(&self) -> u16 {
        self.available_index().wrapping_sub(self.next_avail)
    }

    /// Consume the next available entry.
    pub fn take(&mut self) -> Option<(u16, RawDescriptor)> {
        if self.available_index() == self.next_avail {
            return None;
        }
        fence(Ordering::SeqCst);

        let slot = self.next_avail % self.size;
        let id = self.mem.read_u16(self.address.driver + 4 + 2 * slot as u64).unwrap();
        assert!(id < self.size, "driver published descriptor {} of {}", id, self.size);

        let mut bytes = [0u8; RawDescriptor::SIZE];
        self.mem
            .read(self.address.desc + id as u64 * RawDescriptor::SIZE as u64, &mut bytes)
            .unwrap();

        self.next_avail = self.next_avail.wrapping_add(1);
        Some((id, RawDescriptor::decode(&bytes)))
    }

    pub fn read_buffer(&self, desc: &RawDescriptor) -> Vec<u8> {
        let mut data = vec![0u8; desc.len as usize];
        self.mem.read(desc.addr, &mut data).unwrap();
        data
    }

    pub fn write_buffer(&self, desc: &RawDescriptor, data: &[u8]) {
        assert!(data.len() <= desc.len as usize, "frame larger than rx buffer");
        self.mem.write(desc.addr, data).unwrap();
    }

    /// Return descriptor `id` with `len` bytes written.
    pub fn complete(&mut self, id: u16, len: u32) {
        let slot = self.next_used % self.size;
        let elem = UsedElem { id: id as u32, len };
        self.mem
            .write(self.address.device + 4 + 8 * slot as u64, &elem.encode())
            .unwrap();
        fence(Ordering::SeqCst);

        self.next_used = self.next_used.wrapping_add(1);
        self.mem.write_u16(self.address.device + 2, self.next_used).unwrap();
    }

    /// Complete every available entry with the length the driver recorded.
    pub fn echo_all(&mut self) -> usize {
        let mut count = 0;
        while let Some((id, desc)) = self.take() {
            self.complete(id, desc.len);
            count += 1;
        }
        count
    }
}

/// Device that forwards every frame transmitted on one queue into the
/// receive buffers of another.
pub struct Loopback<M: PhysMemory> {
    pub tx: SimDevice<M>,
    pub rx: SimDevice<M>,
    pending: VecDeque<Vec<u8>>,
    delivered: usize,
}

impl<M: PhysMemory> Loopback<M> {
    pub fn new(tx: SimDevice<M>, rx: SimDevice<M>) -> Self {
        Loopback {
            tx,
            rx,
            pending: VecDeque::new(),
            delivered: 0,
        }
    }

    /// Frames delivered into receive buffers so far.
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Frames taken from the transmit queue but not yet delivered.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Move as many frames as possible; returns whether anything moved.
    pub fn step(&mut self) -> bool {
        let mut progress = false;

        while let Some((id, desc)) = self.tx.take() {
            self.pending.push_back(self.tx.read_buffer(&desc));
            self.tx.complete(id, 0);
            progress = true;
        }

        while !self.pending.is_empty() {
            let Some((id, desc)) = self.rx.take() else {
                break;
            };
            if let Some(frame) = self.pending.pop_front() {
                self.rx.write_buffer(&desc, &frame);
                self.rx.complete(id, frame.len() as u32);
                self.delivered += 1;
                progress = true;
            }
        }

        progress
    }
}
