//! Legacy virtio-mmio devices for the capvm hypervisor.
//!
//! - [`ring`]: the split virtqueue layout and the device side of the ring
//!   protocol, over bounds-checked guest memory.
//! - [`VirtioMmio`]: the generic register window, implementing
//!   [`capaddrspace::MmioDevice`] on top of a [`VirtioBackend`].
//! - Backends: [`Console`], the [`NetSwitch`] ports, and [`ProxyDevice`] for
//!   devices served from another protection domain.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;
extern crate alloc;

pub mod consts;
pub mod ring;

mod console;
mod mmio;
mod net;
mod proxy;

pub use console::{Console, HostConsole};
pub use mmio::{read_config_bytes, Deferred, DeviceContext, VirtioBackend, VirtioMmio};
pub use net::{NetPort, NetPortConfig, NetSwitch, MAX_PACKET};
pub use proxy::{LocalTransport, ProxyDevice, ProxyRequest, ProxyServer, ProxyTransport, PROXY_EINVAL};
