//! Virtual CPU abstractions for the capvm hypervisor.
//!
//! This crate contains:
//! - [`ArchVCpu`]: the interface of the host's vCPU control object. The host
//!   microkernel owns register save/restore and stage-2 programming; the VMM
//!   only reads and writes the guest context and resumes it.
//! - [`VCpu`]: a wrapper which tracks the lifecycle of a vCPU and caches its
//!   register context for the duration of one exit.
//! - [`ExitSyndrome`]: decoding of the aarch64 exception syndrome delivered on
//!   every guest exit.
//! - [`VirtualTimer`]: the guest's virtual timer snapshot, used to bound WFI.
//! - [`Vgic`] and [`IrqLine`]: the narrow interface to the virtual interrupt
//!   distributor.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

mod arch_vcpu;
mod context;
mod esr;
mod exit;
mod irq;
mod vcpu;
mod vtimer;

pub use arch_vcpu::ArchVCpu;
pub use context::ContextFrame;
pub use exit::{CoprocAccess, DataAbort, Exception, ExceptionClass, ExitSyndrome};
pub use irq::{EoiHandler, IrqLine, Vgic};
pub use vcpu::{VCpu, VCpuState};
pub use vtimer::{TimerDeadline, VirtualTimer, VTIMER_IRQ};

pub use capaddrspace::{AccessWidth, GuestPhysAddr, HostPhysAddr, HostVirtAddr};
