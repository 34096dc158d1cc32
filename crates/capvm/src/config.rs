use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use axerrno::{ax_err, ax_err_type, AxResult};
use capaddrspace::GuestRegion;

use crate::GuestPhysAddr;

/// The backend selected by a device's `compatible` string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Console,
    NetSwitch,
    Proxy,
}

impl DeviceKind {
    pub fn from_compatible(compatible: &str) -> Option<Self> {
        match compatible {
            "virtio,console" => Some(Self::Console),
            "virtio,net-switch" => Some(Self::NetSwitch),
            "virtio,proxy" => Some(Self::Proxy),
            _ => None,
        }
    }
}

/// One emulated device.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub compatible: String,
    pub base: usize,
    pub size: usize,
    /// SPI raised towards vCPU 0.
    pub irq: u32,
    /// Notification label routed to the device: host input for a console,
    /// completion from the remote side for a proxy.
    #[serde(default)]
    pub label: Option<u64>,
    /// Name of the proxy transport. Defaults to the device name.
    #[serde(default)]
    pub port: Option<String>,
}

impl DeviceConfig {
    pub fn kind(&self) -> AxResult<DeviceKind> {
        DeviceKind::from_compatible(&self.compatible).ok_or_else(|| {
            ax_err_type!(
                InvalidInput,
                format!("device {}: unknown compatible {:?}", self.name, self.compatible)
            )
        })
    }

    pub fn region(&self) -> AxResult<GuestRegion> {
        GuestRegion::new(self.base, self.size)
    }
}

fn default_clock_scale() -> u64 {
    1
}

/// The configuration of one VM.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct VmConfig {
    // Basic Information
    pub id: usize,
    pub name: String,

    // Resources.
    pub cpu_num: usize,
    pub entry_point: GuestPhysAddr,
    /// Passed to the boot vCPU in x0, usually the device tree.
    #[serde(default)]
    pub dtb_addr: usize,

    /// Memory Information
    pub ram_base: GuestPhysAddr,
    pub ram_size: usize,

    /// Virtual counter ticks per microsecond.
    #[serde(default = "default_clock_scale")]
    pub clock_scale: u64,

    /// Device Information
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl VmConfig {
    pub fn from_toml(raw_cfg_str: &str) -> AxResult<Self> {
        let config: Self = toml::from_str(raw_cfg_str).map_err(|err| {
            ax_err_type!(
                InvalidInput,
                format!("toml deserialize get err {err:?}")
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn ram_region(&self) -> AxResult<GuestRegion> {
        GuestRegion::new(self.ram_base, self.ram_size)
    }

    /// Checks the settings that do not depend on host resources.
    pub fn validate(&self) -> AxResult {
        if self.cpu_num == 0 {
            return ax_err!(InvalidInput, "VM needs at least one vCPU");
        }
        let ram = self.ram_region()?;
        if !ram.contains(self.entry_point) {
            return ax_err!(
                InvalidInput,
                format!("entry point {:#x} outside RAM {}", self.entry_point, ram)
            );
        }
        for dev in &self.devices {
            dev.kind()?;
            dev.region()?;
        }
        Ok(())
    }
}
