use core::time::Duration;

use axerrno::AxResult;
use capvcpu::{ArchVCpu, ExitSyndrome};

/// A message delivered to a vCPU's dispatch loop.
#[derive(Clone, Copy, Debug)]
pub enum HostEvent {
    /// The vCPU stopped on an exit and waits for a reply.
    Fault(ExitSyndrome),
    /// The guest's virtual timer fired. The vCPU stays stopped until the PPI
    /// is acknowledged and the vCPU resumed.
    VirtualPpi { irq: u32 },
    /// A notification or interrupt upcall, identified by its label. The vCPU
    /// keeps running.
    Notification { label: u64 },
}

/// The endpoint one vCPU's exits and the VM's notifications arrive on.
pub trait HostPort: Send {
    /// Blocks for the next event.
    fn recv(&mut self) -> AxResult<HostEvent>;

    /// Blocks until a notification arrives or `timeout` passes, whichever is
    /// first. Returns the label of the notification that ended the wait.
    fn wait(&mut self, timeout: Option<Duration>) -> AxResult<Option<u64>>;

    /// Returns a pending notification label without blocking.
    fn poll(&mut self) -> AxResult<Option<u64>>;
}

/// A physical interrupt capability bound to the VM.
pub trait HostIrq: Send + Sync {
    /// Acknowledges the interrupt so that the host delivers it again.
    fn ack(&self) -> AxResult;
}

/// The interfaces which the underlying host must implement.
pub trait CapVmHal: Sized + 'static {
    /// The host's vCPU control object.
    type VCpu: ArchVCpu;
    /// The endpoint a vCPU's exits are delivered on.
    type Port: HostPort;
}
