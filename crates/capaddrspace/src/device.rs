use axerrno::AxResult;

use crate::{GuestPhysAddr, GuestRegion, Stage2Mapper};

/// The width of an access.
///
/// Note that the term "word" here refers to 16-bit data, as in the x86 architecture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessWidth {
    Byte,
    Word,
    Dword,
    Qword,
}

impl AccessWidth {
    /// Size of the access in bytes.
    pub const fn size(self) -> usize {
        match self {
            AccessWidth::Byte => 1,
            AccessWidth::Word => 2,
            AccessWidth::Dword => 4,
            AccessWidth::Qword => 8,
        }
    }

    /// Mask selecting the bits moved by an access of this width.
    pub const fn mask(self) -> u64 {
        match self {
            AccessWidth::Qword => u64::MAX,
            other => (1u64 << (other.size() * 8)) - 1,
        }
    }

    /// Sign-extends the low `self.size()` bytes of `value` to 64 bits.
    pub const fn sign_extend(self, value: u64) -> u64 {
        let shift = 64 - self.size() * 8;
        (((value << shift) as i64) >> shift) as u64
    }
}

impl TryFrom<usize> for AccessWidth {
    type Error = ();

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Byte),
            2 => Ok(Self::Word),
            4 => Ok(Self::Dword),
            8 => Ok(Self::Qword),
            _ => Err(()),
        }
    }
}

impl From<AccessWidth> for usize {
    fn from(width: AccessWidth) -> usize {
        width.size()
    }
}

/// The direction of an access, carrying the value for writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write(u64),
}

/// One trapped guest access to a registered region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmioAccess {
    /// Faulting guest physical address.
    pub addr: GuestPhysAddr,
    /// Offset of `addr` inside `region`.
    pub offset: usize,
    pub width: AccessWidth,
    pub kind: AccessKind,
    /// The bounds the device was registered with.
    pub region: GuestRegion,
}

impl MmioAccess {
    pub fn read(addr: GuestPhysAddr, width: AccessWidth, region: GuestRegion) -> Self {
        Self {
            addr,
            offset: region.offset_of(addr),
            width,
            kind: AccessKind::Read,
            region,
        }
    }

    /// A write of `value`, truncated to `width`.
    pub fn write(addr: GuestPhysAddr, width: AccessWidth, value: u64, region: GuestRegion) -> Self {
        Self {
            addr,
            offset: region.offset_of(addr),
            width,
            kind: AccessKind::Write(value & width.mask()),
            region,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self.kind, AccessKind::Write(_))
    }
}

/// What the dispatcher does after a device handled an access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessOutcome {
    /// The access is emulated. The value is the read result, ignored for
    /// writes. The trapped instruction is skipped.
    Completed(u64),
    /// The device mapped backing memory into stage-2. The guest re-runs the
    /// trapped instruction.
    Retry,
}

/// An emulated device bound to a region of guest physical memory.
pub trait MmioDevice: Send + Sync {
    /// A short name used in log lines.
    fn name(&self) -> &str;

    /// Handles one trapped access. Runs to completion on the faulting vCPU.
    fn access(&self, access: &MmioAccess, stage2: &dyn Stage2Mapper) -> AxResult<AccessOutcome>;

    /// Gives the device a chance to pick up host-side input. Called before a
    /// vCPU blocks in WFI.
    fn poll(&self) -> AxResult {
        Ok(())
    }

    /// Whether the region is backed by memory mapped on demand. Such accesses
    /// are satisfied without an instruction syndrome.
    fn is_memory(&self) -> bool {
        false
    }
}
