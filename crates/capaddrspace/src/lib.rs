//! Guest physical address space management for the capvm hypervisor.
//!
//! The guest physical address space is a set of disjoint regions, each bound
//! to exactly one [`MmioDevice`]. Guest RAM is a device too: touching a page
//! of it maps that page into stage-2 and lets the guest retry.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;
extern crate alloc;

mod device;
mod ram;
mod region;
mod registry;
mod stage2;

pub use device::{AccessKind, AccessOutcome, AccessWidth, MmioAccess, MmioDevice};
pub use ram::{GuestMemory, GuestRam, RamWindow};
pub use region::GuestRegion;
pub use registry::{MmioHit, MmioRegistry};
pub use stage2::{MappingFlags, Stage2Mapper};

pub use memory_addr::{PhysAddr as HostPhysAddr, VirtAddr as HostVirtAddr, PAGE_SIZE_4K};

/// Guest physical address.
pub type GuestPhysAddr = usize;
