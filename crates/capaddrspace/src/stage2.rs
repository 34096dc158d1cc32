use axerrno::AxResult;
use bitflags::bitflags;

use crate::GuestPhysAddr;

bitflags! {
    /// Permissions of a stage-2 mapping.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MappingFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl MappingFlags {
    /// Normal guest RAM.
    pub const RAM: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE);
}

/// The host's stage-2 table programming interface.
pub trait Stage2Mapper: Send + Sync {
    /// Maps the 4 KiB page at `page` to the host frame backing the same guest
    /// physical address.
    fn map_identity(&self, page: GuestPhysAddr, flags: MappingFlags) -> AxResult;
}
