//! Register offsets and constants of the legacy (version 1) virtio-mmio
//! transport.

use bitflags::bitflags;

pub const VIRTIO_MMIO_MAGIC: u32 = 0x7472_6976; // "virt"
pub const VIRTIO_MMIO_VERSION_LEGACY: u32 = 1;
/// "QEMU", the vendor id guests expect behind a legacy transport.
pub const VIRTIO_VENDOR_ID: u32 = 0x554d_4551;

pub const MAGIC_VALUE: usize = 0x000;
pub const VERSION: usize = 0x004;
pub const DEVICE_ID: usize = 0x008;
pub const VENDOR_ID: usize = 0x00c;
pub const HOST_FEATURES: usize = 0x010;
pub const HOST_FEATURES_SEL: usize = 0x014;
pub const GUEST_FEATURES: usize = 0x020;
pub const GUEST_FEATURES_SEL: usize = 0x024;
pub const GUEST_PAGE_SIZE: usize = 0x028;
pub const QUEUE_SEL: usize = 0x030;
pub const QUEUE_NUM_MAX: usize = 0x034;
pub const QUEUE_NUM: usize = 0x038;
pub const QUEUE_ALIGN: usize = 0x03c;
pub const QUEUE_PFN: usize = 0x040;
pub const QUEUE_NOTIFY: usize = 0x050;
pub const INTERRUPT_STATUS: usize = 0x060;
pub const INTERRUPT_ACK: usize = 0x064;
pub const STATUS: usize = 0x070;
/// Start of the device specific configuration space.
pub const CONFIG: usize = 0x100;

pub const DEFAULT_PAGE_SIZE: u32 = 4096;
pub const DEFAULT_QUEUE_ALIGN: u32 = 4096;

/// Device ids.
pub const VIRTIO_ID_NET: u32 = 1;
pub const VIRTIO_ID_CONSOLE: u32 = 3;

/// Console: `cols` and `rows` in config space are valid.
pub const VIRTIO_CONSOLE_F_SIZE: u64 = 1 << 0;
/// Net: `mac` in config space is valid.
pub const VIRTIO_NET_F_MAC: u64 = 1 << 5;
/// Net: `status` in config space is valid.
pub const VIRTIO_NET_F_STATUS: u64 = 1 << 16;
pub const VIRTIO_NET_S_LINK_UP: u16 = 1;
/// Size of the legacy `virtio_net_hdr` without mergeable buffers.
pub const VIRTIO_NET_HDR_LEN: usize = 10;

bitflags! {
    /// The device status byte.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DeviceStatus: u32 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
        const DEVICE_NEEDS_RESET = 64;
        const FAILED = 128;
    }
}

bitflags! {
    /// Bits of the interrupt status register.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct InterruptStatus: u32 {
        const USED_BUFFER = 1;
        const CONFIG_CHANGE = 2;
    }
}

bitflags! {
    /// Descriptor flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        const NEXT = 1;
        const WRITE = 2;
        const INDIRECT = 4;
    }
}
