//! VirtIO error types

/// Result type used throughout the crate.
pub type Result<T> = core::result::Result<T, VirtioError>;

/// All errors produced by the virtqueue engine and its transport glue.
///
/// Variants fall into three groups:
/// - **Resource errors**: the DMA region could not satisfy a request
/// - **Programmer errors**: bad configuration, unbound buffers, out-of-range indices
/// - **Device errors**: the peer wrote something the protocol does not allow
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VirtioError {
    // ── Resource errors ──────────────────────────────────────────────

    #[error("DMA region exhausted: cannot reserve {size} bytes (align {align})")]
    OutOfDmaMemory { size: usize, align: usize },

    #[error("DMA address {0:#x} is not the start of a reservation")]
    NotReserved(u64),

    #[error("physical access out of bounds: {len} bytes at {addr:#x}")]
    OutOfBounds { addr: u64, len: usize },

    // ── Programmer errors ────────────────────────────────────────────

    #[error("buffer at {addr:#x} ({len} bytes) was not reserved through the DMA allocator")]
    UnboundBuffer { addr: u64, len: usize },

    #[error("invalid queue size {0}: must be a power of two in 1..=32768")]
    InvalidQueueSize(u16),

    #[error("invalid descriptor buffer length {0}")]
    InvalidBufferLength(usize),

    #[error("buffer of {len} bytes exceeds descriptor capacity of {capacity} bytes")]
    BufferTooLarge { len: usize, capacity: usize },

    #[error("index {index} out of range for queue of size {size}")]
    DescriptorOutOfRange { index: u32, size: u16 },

    #[error("virtqueue full: all {size} descriptors are in flight")]
    QueueFull { size: u16 },

    #[error("descriptor {id} is still owned by the device")]
    DescriptorBusy { id: u16 },

    #[error("invalid capability instance")]
    InvalidCapability,

    #[error("queue {queue} not available on device (max size {max})")]
    QueueUnavailable { queue: u16, max: u32 },

    // ── Device errors ────────────────────────────────────────────────

    #[error("device returned descriptor {id} which it does not own")]
    InvalidUsedId { id: u32 },

    #[error("used index {used} ran ahead of {in_flight} in-flight descriptors")]
    UsedIndexOverrun { used: u16, in_flight: u16 },

    #[error("unsupported VirtIO transport: magic {magic:#x}, version {version}")]
    UnsupportedTransport { magic: u32, version: u32 },
}

impl VirtioError {
    /// Whether the error originates from the device side of the protocol.
    ///
    /// Device errors leave the queue in a consistent driver-side state but
    /// indicate the peer can no longer be trusted.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidUsedId { .. }
                | Self::UsedIndexOverrun { .. }
                | Self::UnsupportedTransport { .. }
        )
    }
}
