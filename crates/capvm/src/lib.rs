#![cfg_attr(not(test), no_std)]

//! A minimal trap-and-emulate VM monitor for one aarch64 guest running on a
//! capability microkernel.
//!
//! This crate contains:
//! - [`Vm`]: the VM object, owning the vCPUs, the MMIO registry and the
//!   notification table, and running one dispatch loop per vCPU.
//! - [`VmBuilder`]: assembles a [`Vm`] from a [`VmConfig`] and the host's
//!   capabilities.
//! - The exit handlers: stage-2 aborts, WFI/WFE, the DCC debug console and
//!   PSCI calls.

extern crate alloc;
#[macro_use]
extern crate log;

mod config;
mod dcc;
mod devices;
mod hal;
mod notify;
pub mod psci;
mod trap;
mod vm;
mod wfx;

pub use config::{DeviceConfig, DeviceKind, VmConfig};
pub use hal::{CapVmHal, HostEvent, HostIrq, HostPort};
pub use notify::{IrqBridge, NotificationHandler, NotificationTable};
pub use vm::{Vm, VmBuilder};

pub use capaddrspace::{GuestPhysAddr, GuestRegion, HostPhysAddr, HostVirtAddr};
pub use capvcpu::{VCpuState, VTIMER_IRQ};
