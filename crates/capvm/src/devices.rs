//! Instantiates the emulated devices named in a VM configuration.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use axerrno::{ax_err_type, AxResult};
use capaddrspace::{GuestMemory, GuestRegion, MmioDevice};
use capvcpu::{IrqLine, Vgic};
use capvirtio::{
    Console, HostConsole, NetPortConfig, NetSwitch, ProxyDevice, ProxyTransport, VirtioMmio,
};

use crate::config::{DeviceConfig, DeviceKind};
use crate::notify::{NotificationHandler, PollDevice, RaiseIrq};

/// Device interrupts are routed to the boot vCPU.
const DEVICE_IRQ_CPU: usize = 0;

/// The host resources devices are built over.
pub(crate) struct DeviceEnv<'a> {
    pub mem: &'a Arc<dyn GuestMemory>,
    pub vgic: &'a Arc<dyn Vgic>,
    pub console: &'a Arc<dyn HostConsole>,
    pub transports: &'a BTreeMap<String, Arc<dyn ProxyTransport>>,
}

#[derive(Default)]
pub(crate) struct DeviceSet {
    pub regions: Vec<(GuestRegion, Arc<dyn MmioDevice>)>,
    pub handlers: Vec<(u64, Arc<dyn NotificationHandler>)>,
    /// Ports only hold weak references to their switch.
    pub switches: Vec<Arc<NetSwitch>>,
}

/// Locally administered MAC of switch port `index`.
fn port_mac(index: usize) -> [u8; 6] {
    [0x52, 0x54, 0x00, 0x12, 0x34, 0x56u8.wrapping_add(index as u8)]
}

/// Builds every device in `configs`. All net-switch ports join one switch,
/// in configuration order.
pub(crate) fn instantiate(configs: &[DeviceConfig], env: &DeviceEnv<'_>) -> AxResult<DeviceSet> {
    let mut set = DeviceSet::default();
    let mut ports = Vec::new();

    for cfg in configs {
        let region = cfg.region()?;
        let irq = IrqLine::new(env.vgic.clone(), cfg.irq, DEVICE_IRQ_CPU);
        match cfg.kind()? {
            DeviceKind::Console => {
                let dev: Arc<dyn MmioDevice> = Arc::new(VirtioMmio::new(
                    cfg.name.clone(),
                    env.mem.clone(),
                    irq,
                    Console::new(env.console.clone()),
                ));
                if let Some(label) = cfg.label {
                    let handler: Arc<dyn NotificationHandler> = Arc::new(PollDevice(dev.clone()));
                    set.handlers.push((label, handler));
                }
                set.regions.push((region, dev));
            }
            DeviceKind::NetSwitch => {
                let mac = port_mac(ports.len());
                ports.push((region, NetPortConfig { mac, irq }));
            }
            DeviceKind::Proxy => {
                let port = cfg.port.as_deref().unwrap_or(cfg.name.as_str());
                let transport = env.transports.get(port).cloned().ok_or_else(|| {
                    ax_err_type!(
                        NotFound,
                        format!("device {}: no proxy transport {:?}", cfg.name, port)
                    )
                })?;
                let dev: Arc<dyn MmioDevice> = Arc::new(ProxyDevice::new(cfg.name.clone(), transport));
                if let Some(label) = cfg.label {
                    let handler: Arc<dyn NotificationHandler> = Arc::new(RaiseIrq(irq));
                    set.handlers.push((label, handler));
                }
                set.regions.push((region, dev));
            }
        }
        info!("device {} ({}) at {}", cfg.name, cfg.compatible, region);
    }

    if !ports.is_empty() {
        let (regions, port_configs): (Vec<_>, Vec<_>) = ports.into_iter().unzip();
        let switch = NetSwitch::new("net", env.mem.clone(), port_configs);
        for (region, port) in regions.into_iter().zip(switch.ports()) {
            let port: Arc<dyn MmioDevice> = port.clone();
            set.regions.push((region, port));
        }
        set.switches.push(switch);
    }
    Ok(set)
}
