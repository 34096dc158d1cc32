use alloc::boxed::Box;
use alloc::sync::Arc;

use axerrno::AxResult;

/// Called with the INTID once the guest signals end-of-interrupt for it.
pub type EoiHandler = Box<dyn Fn(u32) + Send + Sync>;

/// The interfaces of the virtual interrupt distributor the VMM relies on.
pub trait Vgic: Send + Sync {
    /// Marks `irq` pending for the vCPU `cpu`.
    fn inject(&self, irq: u32, cpu: usize) -> AxResult;
    /// Loads pending interrupts into the vCPU's list registers. Returns `true`
    /// if at least one of them is deliverable right now.
    fn schedule_pending(&self, cpu: usize) -> bool;
    /// Installs the callback run when the guest EOIs `irq`.
    fn set_eoi_handler(&self, irq: u32, handler: EoiHandler) -> AxResult;
}

/// A device's interrupt line: one INTID routed to one vCPU.
#[derive(Clone)]
pub struct IrqLine {
    vgic: Arc<dyn Vgic>,
    irq: u32,
    cpu: usize,
}

impl IrqLine {
    pub fn new(vgic: Arc<dyn Vgic>, irq: u32, cpu: usize) -> Self {
        Self { vgic, irq, cpu }
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    /// Asserts the line.
    pub fn raise(&self) -> AxResult {
        trace!("raise irq {} on vcpu {}", self.irq, self.cpu);
        self.vgic.inject(self.irq, self.cpu)
    }
}

impl core::fmt::Debug for IrqLine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IrqLine")
            .field("irq", &self.irq)
            .field("cpu", &self.cpu)
            .finish()
    }
}
