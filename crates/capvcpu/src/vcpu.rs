use alloc::format;

use axerrno::{ax_err, AxResult};

use crate::{ArchVCpu, ContextFrame, GuestPhysAddr, VirtualTimer};

/// The state of a virtual CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VCpuState {
    /// The vcpu is created but not started yet.
    Created = 1,
    /// The vcpu has been given an entry point and is being launched.
    Ready = 2,
    /// The vcpu is running, or stopped on an exit which is being handled.
    Running = 3,
    /// The vcpu is blocked in an emulated WFI/WFE.
    Blocked = 4,
    /// The vcpu is stopped for good, either by a fatal exit or `CPU_OFF`.
    Halted = 5,
}

/// A virtual CPU.
///
/// Wraps the host's vCPU control object, tracks its lifecycle and caches the
/// guest register file for the duration of one exit. The context is fetched
/// on first use and written back by [`VCpu::resume`] only if it was modified.
pub struct VCpu<A: ArchVCpu> {
    /// The id of the vcpu.
    id: usize,
    state: VCpuState,
    arch_vcpu: A,
    ctx: Option<ContextFrame>,
    dirty: bool,
}

impl<A: ArchVCpu> VCpu<A> {
    /// Create a new [`VCpu`].
    pub fn new(id: usize, arch_vcpu: A) -> Self {
        Self {
            id,
            state: VCpuState::Created,
            arch_vcpu,
            ctx: None,
            dirty: false,
        }
    }

    /// Get the id of the vcpu.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Get whether the vcpu is the BSP. We always assume the first vcpu is the BSP.
    pub fn is_bsp(&self) -> bool {
        self.id == 0
    }

    /// Get the state of the vcpu.
    pub fn state(&self) -> VCpuState {
        self.state
    }

    /// Transition the state of the vcpu. If the current state is not `from`, return an error.
    pub fn transition_state(&mut self, from: VCpuState, to: VCpuState) -> AxResult {
        if self.state != from {
            ax_err!(
                BadState,
                format!("VCpu state is not {:?}, but {:?}", from, self.state)
            )
        } else {
            self.state = to;
            Ok(())
        }
    }

    /// Launch the vcpu at `entry` with `arg` in x0. A halted vcpu may be
    /// started again.
    pub fn start(&mut self, entry: GuestPhysAddr, arg: usize) -> AxResult {
        match self.state {
            VCpuState::Created | VCpuState::Halted => self.state = VCpuState::Ready,
            state => {
                return ax_err!(
                    BadState,
                    format!("VCpu {} cannot start in state {:?}", self.id, state)
                )
            }
        }
        self.ctx = None;
        self.dirty = false;
        self.arch_vcpu.start(entry, arg)?;
        self.transition_state(VCpuState::Ready, VCpuState::Running)?;
        info!("vcpu {} started at {:#x}", self.id, entry);
        Ok(())
    }

    /// Enter an emulated wait.
    pub fn block(&mut self) -> AxResult {
        self.transition_state(VCpuState::Running, VCpuState::Blocked)
    }

    /// Leave an emulated wait.
    pub fn unblock(&mut self) -> AxResult {
        self.transition_state(VCpuState::Blocked, VCpuState::Running)
    }

    /// Stop the vcpu for good. Halting an already halted vcpu is a no-op.
    pub fn halt(&mut self) -> AxResult {
        if self.state == VCpuState::Halted {
            return Ok(());
        }
        let was_started = self.state != VCpuState::Created;
        self.state = VCpuState::Halted;
        self.ctx = None;
        self.dirty = false;
        info!("vcpu {} halted", self.id);
        if was_started {
            self.arch_vcpu.suspend()?;
        }
        Ok(())
    }

    /// Reply to the current exit and let the guest continue.
    ///
    /// Writes the cached context back first if it was modified while the exit
    /// was handled.
    pub fn resume(&mut self) -> AxResult {
        if self.state != VCpuState::Running {
            return ax_err!(
                BadState,
                format!("VCpu {} cannot resume in state {:?}", self.id, self.state)
            );
        }
        if self.dirty {
            if let Some(ctx) = self.ctx.as_ref() {
                self.arch_vcpu.write_context(ctx)?;
            }
        }
        self.ctx = None;
        self.dirty = false;
        self.arch_vcpu.resume()
    }

    fn ctx(&mut self) -> AxResult<&mut ContextFrame> {
        if self.ctx.is_none() {
            self.ctx = Some(self.arch_vcpu.read_context()?);
        }
        match self.ctx.as_mut() {
            Some(ctx) => Ok(ctx),
            None => ax_err!(BadState),
        }
    }

    /// A copy of the guest register file of the current exit.
    pub fn context(&mut self) -> AxResult<ContextFrame> {
        self.ctx().map(|ctx| *ctx)
    }

    /// Replace the guest register file of the current exit.
    pub fn set_context(&mut self, ctx: ContextFrame) -> AxResult {
        self.ctx = Some(ctx);
        self.dirty = true;
        Ok(())
    }

    /// Read general purpose register `index`, where 31 is the zero register.
    pub fn gpr(&mut self, index: usize) -> AxResult<u64> {
        Ok(self.ctx()?.gpr(index))
    }

    /// Write general purpose register `index`, writes to the zero register are dropped.
    pub fn set_gpr(&mut self, index: usize, val: u64) -> AxResult {
        self.ctx()?.set_gpr(index, val);
        self.dirty = true;
        Ok(())
    }

    pub fn pc(&mut self) -> AxResult<usize> {
        Ok(self.ctx()?.exception_pc())
    }

    pub fn set_pc(&mut self, pc: usize) -> AxResult {
        self.ctx()?.set_exception_pc(pc);
        self.dirty = true;
        Ok(())
    }

    /// Step over the trapped instruction.
    pub fn advance_pc(&mut self, step: usize) -> AxResult {
        let pc = self.pc()?;
        self.set_pc(pc.wrapping_add(step))
    }

    /// Snapshot of the guest's virtual timer.
    pub fn vtimer(&mut self) -> AxResult<VirtualTimer> {
        self.arch_vcpu.vtimer()
    }

    /// Acknowledge a virtual PPI event on the control object.
    pub fn ack_vppi(&mut self, irq: u32) -> AxResult {
        self.arch_vcpu.ack_vppi(irq)
    }
}
