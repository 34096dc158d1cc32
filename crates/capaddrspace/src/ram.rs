use alloc::vec;
use alloc::vec::Vec;

use axerrno::{ax_err, AxResult};
use spin::Mutex;

use crate::{
    AccessOutcome, GuestPhysAddr, GuestRegion, HostVirtAddr, MappingFlags, MmioAccess, MmioDevice,
    Stage2Mapper,
};

/// Bounds-checked access to guest RAM.
///
/// Everything the guest publishes in memory (rings, descriptors, buffers) is
/// untrusted: every access is checked against the RAM region and out of range
/// accesses fail with `BadAddress` instead of touching host memory.
pub trait GuestMemory: Send + Sync {
    /// The guest physical range backed by this memory.
    fn region(&self) -> GuestRegion;

    fn read(&self, gpa: GuestPhysAddr, buf: &mut [u8]) -> AxResult;

    fn write(&self, gpa: GuestPhysAddr, data: &[u8]) -> AxResult;

    fn check_range(&self, gpa: GuestPhysAddr, len: usize) -> AxResult {
        if self.region().contains_range(gpa, len) {
            Ok(())
        } else {
            ax_err!(BadAddress)
        }
    }

    fn read_u16(&self, gpa: GuestPhysAddr) -> AxResult<u16> {
        let mut buf = [0; 2];
        self.read(gpa, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, gpa: GuestPhysAddr) -> AxResult<u32> {
        let mut buf = [0; 4];
        self.read(gpa, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, gpa: GuestPhysAddr) -> AxResult<u64> {
        let mut buf = [0; 8];
        self.read(gpa, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u16(&self, gpa: GuestPhysAddr, val: u16) -> AxResult {
        self.write(gpa, &val.to_le_bytes())
    }

    fn write_u32(&self, gpa: GuestPhysAddr, val: u32) -> AxResult {
        self.write(gpa, &val.to_le_bytes())
    }

    fn write_u64(&self, gpa: GuestPhysAddr, val: u64) -> AxResult {
        self.write(gpa, &val.to_le_bytes())
    }
}

enum Backing {
    /// A zeroed buffer owned by the VMM.
    Owned(Mutex<Vec<u8>>),
    /// The host mapping of the guest's RAM frames.
    Mapped(HostVirtAddr),
}

/// The guest's RAM as seen from the VMM.
pub struct GuestRam {
    region: GuestRegion,
    backing: Backing,
}

impl GuestRam {
    /// Creates zero-filled RAM owned by the VMM.
    pub fn new(region: GuestRegion) -> Self {
        Self {
            region,
            backing: Backing::Owned(Mutex::new(vec![0; region.size()])),
        }
    }

    /// Wraps the host's mapping of guest RAM.
    ///
    /// # Safety
    ///
    /// `hva` must point to `region.size()` bytes which stay mapped, readable
    /// and writable for the lifetime of the returned value.
    pub unsafe fn from_host_mapping(region: GuestRegion, hva: HostVirtAddr) -> Self {
        Self {
            region,
            backing: Backing::Mapped(hva),
        }
    }

    fn host_offset(&self, gpa: GuestPhysAddr, len: usize) -> AxResult<usize> {
        self.check_range(gpa, len)?;
        Ok(self.region.offset_of(gpa))
    }
}

impl GuestMemory for GuestRam {
    fn region(&self) -> GuestRegion {
        self.region
    }

    fn read(&self, gpa: GuestPhysAddr, buf: &mut [u8]) -> AxResult {
        let off = self.host_offset(gpa, buf.len())?;
        match &self.backing {
            Backing::Owned(mem) => buf.copy_from_slice(&mem.lock()[off..off + buf.len()]),
            // SAFETY: the range was checked against the mapping's size.
            Backing::Mapped(hva) => unsafe {
                core::ptr::copy_nonoverlapping(hva.as_ptr().add(off), buf.as_mut_ptr(), buf.len())
            },
        }
        Ok(())
    }

    fn write(&self, gpa: GuestPhysAddr, data: &[u8]) -> AxResult {
        let off = self.host_offset(gpa, data.len())?;
        match &self.backing {
            Backing::Owned(mem) => mem.lock()[off..off + data.len()].copy_from_slice(data),
            // SAFETY: the range was checked against the mapping's size.
            Backing::Mapped(hva) => unsafe {
                core::ptr::copy_nonoverlapping(data.as_ptr(), hva.as_mut_ptr().add(off), data.len())
            },
        }
        Ok(())
    }
}

/// The device covering guest RAM in the MMIO registry.
///
/// RAM is mapped into stage-2 lazily: the first touch of a page faults, the
/// page is mapped and the guest retries the access.
pub struct RamWindow {
    region: GuestRegion,
}

impl RamWindow {
    pub fn new(region: GuestRegion) -> Self {
        Self { region }
    }
}

impl MmioDevice for RamWindow {
    fn name(&self) -> &str {
        "ram"
    }

    fn access(&self, access: &MmioAccess, stage2: &dyn Stage2Mapper) -> AxResult<AccessOutcome> {
        let page = GuestRegion::page_of(access.addr);
        if !self.region.contains_range(page.start(), page.size()) {
            return ax_err!(BadAddress, "partial RAM page");
        }
        debug!("map RAM page {}", page);
        stage2.map_identity(page.start(), MappingFlags::RAM)?;
        Ok(AccessOutcome::Retry)
    }

    fn is_memory(&self) -> bool {
        true
    }
}
