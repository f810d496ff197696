//! KPIO VirtIO Split Virtqueue
//!
//! Guest-side engine for the VirtIO split virtqueue: the shared-memory
//! ring protocol a paravirtualized driver uses to hand buffers to a
//! hypervisor device and get them back.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        Device driver (net, blk, ...)     │
//! ├──────────────────────────────────────────┤
//! │   VirtQueue  push() / pop() / address()  │
//! │  ┌────────────┐ ┌──────────┐ ┌─────────┐ │
//! │  │ descriptor │ │ available│ │  used   │ │
//! │  │   table    │ │   ring   │ │  ring   │ │
//! │  └─────┬──────┘ └────┬─────┘ └────┬────┘ │
//! └────────┼─────────────┼────────────┼──────┘
//!          └─────────────┴────────────┘
//!                        │
//!           DmaAllocator / PhysMemory
//! ```
//!
//! # Modules
//!
//! - `config`: Queue configuration and limits
//! - `dma`: DMA memory contract and region implementations
//! - `queue`: Descriptors, rings and the virtqueue itself
//! - `transport`: VirtIO-MMIO registration and MSI-X interrupt routing
//! - `error`: Error types

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod config;
pub mod dma;
pub mod error;
pub mod queue;
pub mod transport;

// Re-exports for convenience
pub use config::{QueueConfig, MAX_QUEUE_SIZE};
pub use dma::{DmaAllocator, DmaBuffer, HeapRegion, IdentityRegion, PhysMemory};
pub use error::{Result, VirtioError};
pub use queue::{DescriptorFlags, Owner, QueueAddress, QueueLayout, RawDescriptor, VirtQueue};
pub use transport::{MmioTransport, MsixCapability, PciFunction, QueueTransport, RegisterBlock};
