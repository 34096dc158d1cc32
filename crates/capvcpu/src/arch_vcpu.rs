use axerrno::AxResult;

use crate::{ContextFrame, GuestPhysAddr, VirtualTimer};

/// The host's vCPU control object.
///
/// The host microkernel saves and restores guest state and programs stage-2
/// translation; a guest exit is delivered to the VMM as a fault message and
/// the vCPU stays stopped until [`ArchVCpu::resume`] is called.
pub trait ArchVCpu: Send {
    /// Starts executing the guest at `entry` with `arg` in x0.
    fn start(&mut self, entry: GuestPhysAddr, arg: usize) -> AxResult;
    /// Replies to the pending exit and lets the guest continue.
    fn resume(&mut self) -> AxResult;
    /// Reads the guest register file of the stopped vCPU.
    fn read_context(&mut self) -> AxResult<ContextFrame>;
    /// Writes the guest register file back before resuming.
    fn write_context(&mut self, ctx: &ContextFrame) -> AxResult;
    /// Reads the guest's virtual timer registers and the current counter.
    fn vtimer(&mut self) -> AxResult<VirtualTimer>;
    /// Acknowledges a virtual PPI event so the host unmasks it again.
    fn ack_vppi(&mut self, irq: u32) -> AxResult;
    /// Stops the vCPU without an intention to resume it.
    fn suspend(&mut self) -> AxResult;
}
