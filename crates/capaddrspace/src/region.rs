use core::fmt;

use axerrno::{ax_err, AxResult};
use memory_addr::{align_down_4k, PAGE_SIZE_4K};

use crate::GuestPhysAddr;

/// A half-open range `[start, end)` of guest physical addresses.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestRegion {
    start: GuestPhysAddr,
    end: GuestPhysAddr,
}

impl GuestRegion {
    /// Creates the region `[start, start + size)`.
    ///
    /// Empty regions and regions which wrap around the address space are
    /// rejected with `InvalidInput`.
    pub fn new(start: GuestPhysAddr, size: usize) -> AxResult<Self> {
        if size == 0 {
            return ax_err!(InvalidInput, "empty guest region");
        }
        match start.checked_add(size) {
            Some(end) => Ok(Self { start, end }),
            None => ax_err!(InvalidInput, "guest region wraps around"),
        }
    }

    /// Creates the region `[start, end)`.
    pub fn from_bounds(start: GuestPhysAddr, end: GuestPhysAddr) -> AxResult<Self> {
        if end <= start {
            return ax_err!(InvalidInput, "inverted guest region");
        }
        Ok(Self { start, end })
    }

    pub const fn start(&self) -> GuestPhysAddr {
        self.start
    }

    pub const fn end(&self) -> GuestPhysAddr {
        self.end
    }

    pub const fn size(&self) -> usize {
        self.end - self.start
    }

    pub const fn contains(&self, addr: GuestPhysAddr) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Whether `[addr, addr + len)` lies entirely inside the region.
    pub fn contains_range(&self, addr: GuestPhysAddr, len: usize) -> bool {
        match addr.checked_add(len) {
            Some(end) => self.start <= addr && end <= self.end,
            None => false,
        }
    }

    pub const fn overlaps(&self, other: &GuestRegion) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Offset of `addr` from the start of the region.
    pub const fn offset_of(&self, addr: GuestPhysAddr) -> usize {
        addr - self.start
    }

    /// The 4 KiB page containing `addr`.
    pub fn page_of(addr: GuestPhysAddr) -> GuestRegion {
        let start = align_down_4k(addr);
        GuestRegion {
            start,
            end: start + PAGE_SIZE_4K,
        }
    }
}

impl fmt::Debug for GuestRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

impl fmt::Display for GuestRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
