//! Classification and dispatch of guest exits.

use axerrno::{ax_err, AxResult};
use capaddrspace::{AccessOutcome, AccessWidth, GuestRegion, MappingFlags, MmioAccess};
use capvcpu::{CoprocAccess, DataAbort, Exception, ExitSyndrome, VCpu, VCpuState};

use crate::dcc::DccRegister;
use crate::psci::*;
use crate::{CapVmHal, GuestPhysAddr, Vm};

/// What the dispatch loop does once an exit has been handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ExitAction {
    /// Reply to the exit and let the guest continue.
    Resume,
    /// Stop this vCPU, another vCPU may start it again.
    Halt,
    /// The guest powered the machine off.
    Shutdown,
}

/// The value a load writes into its transfer register.
fn load_value(abort: &DataAbort, raw: u64) -> u64 {
    let mut val = raw & abort.width.mask();
    if abort.sign_extend {
        val = abort.width.sign_extend(val);
    }
    if !abort.reg_64bit {
        val &= 0xffff_ffff;
    }
    val
}

impl<H: CapVmHal> Vm<H> {
    pub(crate) fn handle_exit(
        &self,
        vcpu: &mut VCpu<H::VCpu>,
        port: &mut H::Port,
        syndrome: &ExitSyndrome,
    ) -> AxResult<ExitAction> {
        let step = syndrome.next_instruction_step();
        let exception = syndrome.decode();
        debug!("vcpu {} exit: {:?}", vcpu.id(), exception);

        match exception {
            Exception::DataAbort(abort) => self.handle_data_abort(vcpu, &abort, step),
            Exception::InstructionAbort { addr } => self.handle_instruction_abort(vcpu, addr),
            Exception::Wfx { wfe } => {
                self.handle_wfx(vcpu, port, wfe)?;
                vcpu.advance_pc(step)?;
                Ok(ExitAction::Resume)
            }
            Exception::Cp14(access) => self.handle_coproc(vcpu, &access, true, step),
            Exception::SysReg(access) => self.handle_coproc(vcpu, &access, false, step),
            Exception::Cp15(access) => {
                warn!("vcpu {}: unhandled CP15 access {:?}", vcpu.id(), access);
                self.complete_coproc(vcpu, &access, true, 0)?;
                vcpu.advance_pc(step)?;
                Ok(ExitAction::Resume)
            }
            // The preferred return address of a trapped HVC is the next
            // instruction already.
            Exception::Hvc { .. } => self.handle_psci(vcpu),
            Exception::Smc { .. } => {
                let action = self.handle_psci(vcpu)?;
                if action == ExitAction::Resume {
                    vcpu.advance_pc(step)?;
                }
                Ok(action)
            }
            Exception::Unknown { class } => {
                error!(
                    "vcpu {}: unhandled exception class {:#x}, {:?}",
                    vcpu.id(),
                    class,
                    syndrome
                );
                if let Ok(ctx) = vcpu.context() {
                    error!("guest context:\n{}", ctx);
                }
                ax_err!(Unsupported, "unhandled guest exit")
            }
        }
    }

    /// Maps the RAM page containing `addr`, the guest then re-runs the
    /// faulting instruction.
    fn map_page(&self, addr: GuestPhysAddr) -> AxResult<ExitAction> {
        let page = GuestRegion::page_of(addr);
        debug!("map page {} on demand", page);
        self.stage2.map_identity(page.start(), MappingFlags::RAM)?;
        Ok(ExitAction::Resume)
    }

    fn handle_data_abort(
        &self,
        vcpu: &mut VCpu<H::VCpu>,
        abort: &DataAbort,
        step: usize,
    ) -> AxResult<ExitAction> {
        let Some(hit) = self.registry.lookup(abort.addr) else {
            return self.map_page(abort.addr);
        };
        let device = hit.device;
        if !abort.valid && !device.is_memory() {
            error!(
                "vcpu {}: access to {} at {:#x} has no valid syndrome",
                vcpu.id(),
                device.name(),
                abort.addr
            );
            if let Ok(ctx) = vcpu.context() {
                error!("guest context:\n{}", ctx);
            }
            return ax_err!(Unsupported, "MMIO access needs instruction emulation");
        }

        let access = if abort.write {
            MmioAccess::write(abort.addr, abort.width, vcpu.gpr(abort.reg)?, hit.region)
        } else {
            MmioAccess::read(abort.addr, abort.width, hit.region)
        };
        trace!(
            "{} {:?} {:?} at +{:#x}",
            device.name(),
            access.kind,
            access.width,
            access.offset
        );
        let outcome = device
            .access(&access, self.stage2.as_ref())
            .unwrap_or_else(|e| {
                warn!(
                    "{}: access at {:#x} failed: {:?}",
                    device.name(),
                    abort.addr,
                    e
                );
                AccessOutcome::Completed(0)
            });

        match outcome {
            AccessOutcome::Retry => Ok(ExitAction::Resume),
            AccessOutcome::Completed(val) => {
                if !abort.write {
                    vcpu.set_gpr(abort.reg, load_value(abort, val))?;
                }
                vcpu.advance_pc(step)?;
                Ok(ExitAction::Resume)
            }
        }
    }

    fn handle_instruction_abort(
        &self,
        vcpu: &mut VCpu<H::VCpu>,
        addr: GuestPhysAddr,
    ) -> AxResult<ExitAction> {
        let Some(hit) = self.registry.lookup(addr) else {
            return self.map_page(addr);
        };
        if hit.device.is_memory() {
            let access = MmioAccess::read(addr, AccessWidth::Dword, hit.region);
            if let AccessOutcome::Retry = hit.device.access(&access, self.stage2.as_ref())? {
                return Ok(ExitAction::Resume);
            }
        }
        error!(
            "vcpu {}: instruction fetch from {} at {:#x}",
            vcpu.id(),
            hit.device.name(),
            addr
        );
        ax_err!(Unsupported, "instruction fetch from a device region")
    }

    fn handle_coproc(
        &self,
        vcpu: &mut VCpu<H::VCpu>,
        access: &CoprocAccess,
        aarch32: bool,
        step: usize,
    ) -> AxResult<ExitAction> {
        match DccRegister::decode(access, aarch32) {
            Some(reg) if access.read => {
                let val = self.dcc.read(reg);
                self.complete_coproc(vcpu, access, aarch32, val)?;
            }
            Some(reg) => self.dcc.write(reg, vcpu.gpr(access.rt)?),
            None => {
                warn!(
                    "vcpu {}: unhandled system register access {:?}",
                    vcpu.id(),
                    access
                );
                self.complete_coproc(vcpu, access, aarch32, 0)?;
            }
        }
        vcpu.advance_pc(step)?;
        Ok(ExitAction::Resume)
    }

    /// Writes a read result into the transfer register. Writes are dropped.
    fn complete_coproc(
        &self,
        vcpu: &mut VCpu<H::VCpu>,
        access: &CoprocAccess,
        aarch32: bool,
        val: u64,
    ) -> AxResult {
        if !access.read {
            return Ok(());
        }
        // Rt = 15 in an aarch32 MRC targets the condition flags.
        if aarch32 && access.rt == 15 {
            return Ok(());
        }
        vcpu.set_gpr(access.rt, val)
    }

    fn handle_psci(&self, vcpu: &mut VCpu<H::VCpu>) -> AxResult<ExitAction> {
        let call = PsciCall::decode(vcpu.gpr(0)?, vcpu.gpr(1)?, vcpu.gpr(2)?, vcpu.gpr(3)?);
        debug!("vcpu {}: psci {:?}", vcpu.id(), call);

        let ret = match call {
            PsciCall::Version => PSCI_VERSION_0_2 as i64,
            PsciCall::CpuOn {
                target,
                entry,
                context,
            } => self.cpu_on(vcpu.id(), target, entry as usize, context as usize),
            PsciCall::CpuOff => return Ok(ExitAction::Halt),
            PsciCall::AffinityInfo { target, level } => {
                self.affinity_info(vcpu.id(), target, level)
            }
            PsciCall::MigrateInfoType => MIGRATE_NOT_REQUIRED,
            PsciCall::SystemOff | PsciCall::SystemReset => {
                info!("vcpu {}: guest requested {:?}", vcpu.id(), call);
                return Ok(ExitAction::Shutdown);
            }
            PsciCall::Features { fid } => {
                if PsciCall::is_implemented(fid) {
                    PSCI_SUCCESS
                } else {
                    PSCI_NOT_SUPPORTED
                }
            }
            PsciCall::Unknown { fid } => {
                warn!("vcpu {}: unsupported psci function {:#x}", vcpu.id(), fid);
                PSCI_NOT_SUPPORTED
            }
        };
        vcpu.set_gpr(0, ret as u64)?;
        Ok(ExitAction::Resume)
    }

    fn cpu_on(&self, caller: usize, target: u64, entry: usize, context: usize) -> i64 {
        let Some(target_id) = mpidr_to_vcpu(target) else {
            return PSCI_INVALID_PARAMETERS;
        };
        let Some(slot) = self.vcpu(target_id) else {
            return PSCI_INVALID_PARAMETERS;
        };
        if target_id == caller {
            return PSCI_ALREADY_ON;
        }
        // A vCPU which is busy with an exit is on.
        let Some(mut target_vcpu) = slot.try_lock() else {
            return PSCI_ALREADY_ON;
        };
        match target_vcpu.state() {
            VCpuState::Created | VCpuState::Halted => {}
            _ => return PSCI_ALREADY_ON,
        }
        match target_vcpu.start(entry, context) {
            Ok(()) => {
                info!("vcpu {} started vcpu {} at {:#x}", caller, target_id, entry);
                PSCI_SUCCESS
            }
            Err(e) => {
                warn!("vcpu {}: CPU_ON failed: {:?}", target_id, e);
                PSCI_INTERNAL_FAILURE
            }
        }
    }

    fn affinity_info(&self, caller: usize, target: u64, level: u64) -> i64 {
        if level != 0 {
            return PSCI_INVALID_PARAMETERS;
        }
        let Some(target_id) = mpidr_to_vcpu(target) else {
            return PSCI_INVALID_PARAMETERS;
        };
        let Some(slot) = self.vcpu(target_id) else {
            return PSCI_INVALID_PARAMETERS;
        };
        if target_id == caller {
            return AFFINITY_ON;
        }
        match slot.try_lock().map(|vcpu| vcpu.state()) {
            Some(VCpuState::Created) | Some(VCpuState::Halted) => AFFINITY_OFF,
            _ => AFFINITY_ON,
        }
    }
}
