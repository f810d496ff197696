//! MSI-X capability.
//!
//! Just enough of the capability to route one queue's completion interrupt:
//! program one table entry and turn MSI-X on.
//!
//! # Capability Structure
//! ```text
//! Offset  Size    Content
//! 0       1       Capability ID (0x11)
//! 1       1       Next pointer
//! 2       2       Message Control (bits 0..10 table size - 1, bit 15 enable)
//! 4       4       Table Offset (bits 0..2 BIR)
//! 8       4       PBA Offset (bits 0..2 BIR)
//! ```
//!
//! Each table entry is 16 bytes: message address (u64), message data (u32),
//! vector control (u32).

use crate::dma::PhysMemory;
use crate::error::{Result, VirtioError};

/// MSI-X capability ID.
pub const CAP_ID_MSIX: u8 = 0x11;

/// Size of an MSI-X table entry.
pub const TABLE_ENTRY_SIZE: u64 = 16;

/// MSI-X Enable, bit 15 of Message Control (bit 31 of the first dword).
const MSIX_ENABLE: u32 = 31;

/// Function Mask, bit 14 of Message Control.
const MSIX_FUNCTION_MASK: u32 = 30;

const BIR_MASK: u32 = 0b111;

/// Configuration space of a PCI device.
pub trait PciFunction {
    /// Read the dword at `offset` of function `func`.
    fn read(&self, func: u32, offset: u32) -> u32;

    /// Write the dword at `offset` of function `func`.
    fn write(&self, func: u32, offset: u32, value: u32);

    /// Physical base address decoded from BAR `bar`.
    fn base_address(&self, bar: u32) -> u64;
}

/// Decoded MSI-X capability, bound to the device it was read from.
#[derive(Debug)]
pub struct MsixCapability<'a, P: PciFunction> {
    pub id: u8,
    pub next: u8,
    pub message_control: u16,
    pub table_offset: u32,
    pub pba_offset: u32,
    device: Option<&'a P>,
    offset: u32,
}

impl<'a, P: PciFunction> Default for MsixCapability<'a, P> {
    /// An unbound capability; enabling any vector on it fails.
    fn default() -> Self {
        MsixCapability {
            id: 0,
            next: 0,
            message_control: 0,
            table_offset: 0,
            pba_offset: 0,
            device: None,
            offset: 0,
        }
    }
}

impl<'a, P: PciFunction> MsixCapability<'a, P> {
    /// Decode the capability at `offset` of function 0.
    pub fn unmarshal(device: &'a P, offset: u32) -> Result<Self> {
        let header = device.read(0, offset);
        let id = (header & 0xff) as u8;
        if id != CAP_ID_MSIX {
            return Err(VirtioError::InvalidCapability);
        }

        Ok(MsixCapability {
            id,
            next: (header >> 8) as u8,
            message_control: (header >> 16) as u16,
            table_offset: device.read(0, offset + 4),
            pba_offset: device.read(0, offset + 8),
            device: Some(device),
            offset,
        })
    }

    /// Number of entries in the MSI-X table.
    pub fn table_size(&self) -> u32 {
        (self.message_control & 0x7ff) as u32 + 1
    }

    pub fn is_bound(&self) -> bool {
        self.device.is_some()
    }

    /// BAR holding the table.
    pub fn table_bir(&self) -> u32 {
        self.table_offset & BIR_MASK
    }

    /// Physical address of table entry `n`, if it exists.
    pub fn entry_address(&self, n: u32) -> Option<u64> {
        let device = self.device?;
        if n >= self.table_size() {
            return None;
        }
        let table = device.base_address(self.table_bir()) + (self.table_offset & !BIR_MASK) as u64;
        Some(table + TABLE_ENTRY_SIZE * n as u64)
    }

    /// Program table entry `n` with `addr`/`data`, unmasked, and enable
    /// MSI-X on the function.
    ///
    /// Nothing is written unless `n` is a valid entry of a bound capability.
    pub fn enable_interrupt<M: PhysMemory + ?Sized>(
        &self,
        mem: &M,
        n: u32,
        addr: u64,
        data: u32,
    ) -> Result<()> {
        let (device, entry) = match (self.device, self.entry_address(n)) {
            (Some(device), Some(entry)) => (device, entry),
            _ => {
                log::warn!(
                    "[VirtIO] msix: vector {} rejected (table size {}, bound {})",
                    n,
                    self.table_size(),
                    self.is_bound()
                );
                return Err(VirtioError::InvalidCapability);
            }
        };

        let mut bytes = [0u8; TABLE_ENTRY_SIZE as usize];
        bytes[0..8].copy_from_slice(&addr.to_le_bytes());
        bytes[8..12].copy_from_slice(&data.to_le_bytes());
        // vector control: unmasked
        bytes[12..16].copy_from_slice(&0u32.to_le_bytes());
        mem.write(entry, &bytes)?;

        let header = device.read(0, self.offset);
        let header = (header | (1 << MSIX_ENABLE)) & !(1 << MSIX_FUNCTION_MASK);
        device.write(0, self.offset, header);

        log::debug!("[VirtIO] msix: vector {} -> addr={:#x} data={:#x}", n, addr, data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::HeapRegion;
    use alloc::vec::Vec;
    use spin::Mutex;

    const CAP: u32 = 0x70;
    const BAR: u64 = 0xfebf_0000;

    struct MockFunction {
        config: Mutex<[u32; 64]>,
        writes: Mutex<Vec<(u32, u32)>>,
    }

    impl MockFunction {
        /// MSI-X capability with `size` entries, table at `table_offset`.
        fn new(size: u16, table_offset: u32) -> Self {
            let mut config = [0u32; 64];
            config[CAP as usize / 4] = CAP_ID_MSIX as u32 | (0x80 << 8) | (((size - 1) as u32) << 16);
            config[CAP as usize / 4 + 1] = table_offset;
            config[CAP as usize / 4 + 2] = 0x800;
            MockFunction {
                config: Mutex::new(config),
                writes: Mutex::new(Vec::new()),
            }
        }
    }

    impl PciFunction for MockFunction {
        fn read(&self, _func: u32, offset: u32) -> u32 {
            self.config.lock()[offset as usize / 4]
        }

        fn write(&self, _func: u32, offset: u32, value: u32) {
            self.config.lock()[offset as usize / 4] = value;
            self.writes.lock().push((offset, value));
        }

        fn base_address(&self, bar: u32) -> u64 {
            BAR + 0x1_0000 * bar as u64
        }
    }

    #[test]
    fn test_unmarshal() {
        let function = MockFunction::new(4, 0x2001);
        let cap = MsixCapability::unmarshal(&function, CAP).unwrap();
        assert_eq!(cap.id, CAP_ID_MSIX);
        assert_eq!(cap.next, 0x80);
        assert_eq!(cap.table_size(), 4);
        assert_eq!(cap.table_bir(), 1);
        assert_eq!(cap.pba_offset, 0x800);
        assert_eq!(cap.entry_address(2), Some(BAR + 0x1_0000 + 0x2000 + 32));
    }

    #[test]
    fn test_unmarshal_wrong_id() {
        let function = MockFunction::new(4, 0);
        function.config.lock()[CAP as usize / 4] = 0x05;
        assert!(matches!(
            MsixCapability::unmarshal(&function, CAP),
            Err(VirtioError::InvalidCapability)
        ));
    }

    #[test]
    fn test_enable_interrupt() {
        let region = HeapRegion::new(BAR, 0x4000);
        let function = MockFunction::new(4, 0x1000);
        let cap = MsixCapability::unmarshal(&function, CAP).unwrap();

        cap.enable_interrupt(&region, 3, 0xfee0_0000, 0x41).unwrap();

        let entry = BAR + 0x1000 + 48;
        assert_eq!(region.read_u64(entry).unwrap(), 0xfee0_0000);
        assert_eq!(region.read_u32(entry + 8).unwrap(), 0x41);
        assert_eq!(region.read_u32(entry + 12).unwrap(), 0);

        let header = function.read(0, CAP);
        assert_eq!(header >> 31, 1);
        // table size and next pointer survive
        assert_eq!(header & 0x7ff_ffff, CAP_ID_MSIX as u32 | (0x80 << 8) | (3 << 16));
    }

    #[test]
    fn test_vector_out_of_range_writes_nothing() {
        let region = HeapRegion::new(BAR, 0x4000);
        let function = MockFunction::new(4, 0x1000);
        let cap = MsixCapability::unmarshal(&function, CAP).unwrap();

        assert_eq!(
            cap.enable_interrupt(&region, 5, 0xfee0_0000, 1),
            Err(VirtioError::InvalidCapability)
        );
        assert_eq!(
            cap.enable_interrupt(&region, 4, 0xfee0_0000, 1),
            Err(VirtioError::InvalidCapability)
        );
        assert!(function.writes.lock().is_empty());
        assert_eq!(region.read_u64(BAR + 0x1000 + 64).unwrap(), 0);
    }

    #[test]
    fn test_unbound_capability() {
        let region = HeapRegion::new(BAR, 0x100);
        let cap = MsixCapability::<MockFunction>::default();
        assert!(!cap.is_bound());
        assert_eq!(
            cap.enable_interrupt(&region, 0, 0, 0),
            Err(VirtioError::InvalidCapability)
        );
    }
}
