//! Property 3: Ring block layout and alignment
//!
//! For any power-of-two queue size and buffer length, the descriptor table
//! is 16-byte aligned, the available ring directly follows it, and the used
//! ring starts 4-byte aligned relative to the block. Failed initialisation
//! leaves nothing reserved.

use kpio_virtio::queue::{AvailableRing, UsedRing};
use kpio_virtio::{HeapRegion, QueueConfig, QueueLayout, VirtQueue, VirtioError};
use proptest::prelude::*;

const BASE: u64 = 0x1000_0000;

fn arb_size() -> impl Strategy<Value = u16> {
    (0u32..=8).prop_map(|shift| 1u16 << shift)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Computed layout for every supported size.
    #[test]
    fn layout_offsets(shift in 0u32..=15) {
        let size = 1u16 << shift;
        let layout = QueueLayout::new(size);

        prop_assert_eq!(layout.driver, 16 * size as usize);
        prop_assert_eq!(layout.device % 4, 0);
        prop_assert!(layout.padding < 4);
        prop_assert_eq!(layout.device, layout.driver + AvailableRing::byte_len(size) + layout.padding);
        prop_assert_eq!(layout.size, layout.device + UsedRing::byte_len(size));
    }

    /// Addresses handed out by init honour the layout.
    #[test]
    fn init_addresses(size in arb_size(), buffer_len in 1usize..=512, rx in any::<bool>()) {
        let region = HeapRegion::new(BASE, 1 << 20);
        let config = if rx {
            QueueConfig::rx(size, buffer_len)
        } else {
            QueueConfig::tx(size, buffer_len)
        };
        let queue = VirtQueue::init(&region, config).unwrap();
        let addr = queue.address();
        let layout = QueueLayout::new(size);

        prop_assert_eq!(addr.desc % 16, 0);
        prop_assert_eq!(addr.driver - addr.desc, layout.driver as u64);
        prop_assert_eq!(addr.device - addr.desc, layout.device as u64);
        prop_assert_eq!((addr.device - addr.desc) % 4, 0);

        let table = queue.descriptor_table().unwrap();
        prop_assert_eq!(table.len(), size as usize);
        for (i, raw) in table.iter().enumerate() {
            prop_assert_eq!(raw.len as usize, buffer_len);
            prop_assert_eq!(raw.addr, table[0].addr + (i * buffer_len) as u64);
        }

        queue.destroy();
        prop_assert_eq!(region.reserved_bytes(), 0);
    }

    /// Running out of DMA memory at any point leaves the region untouched.
    #[test]
    fn init_out_of_memory(size in arb_size(), buffer_len in 1usize..=512, percent in 0usize..100) {
        let config = QueueConfig::tx(size, buffer_len);
        let needed = config.pool_len() + QueueLayout::new(size).size;
        let room = needed * percent / 100;

        let region = HeapRegion::new(BASE, room);
        let result = VirtQueue::init(&region, config);
        let is_oom = matches!(result, Err(VirtioError::OutOfDmaMemory { .. }));
        prop_assert!(is_oom);
        prop_assert_eq!(region.reservations(), 0);
    }
}
