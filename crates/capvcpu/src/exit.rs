use core::fmt;

use tock_registers::LocalRegisterCopy;

use crate::esr::*;
use crate::{AccessWidth, GuestPhysAddr};

/// Exception classes the VMM distinguishes, from `ESR_EL2.EC`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionClass {
    WfiWfe,
    Cp15McrMrc,
    Cp14McrMrc,
    Hvc32,
    Smc32,
    Hvc64,
    Smc64,
    SysReg64,
    InstrAbortLowerEl,
    DataAbortLowerEl,
    Other(u8),
}

impl From<u8> for ExceptionClass {
    fn from(ec: u8) -> Self {
        match ec {
            0x01 => Self::WfiWfe,
            0x03 => Self::Cp15McrMrc,
            0x05 => Self::Cp14McrMrc,
            0x12 => Self::Hvc32,
            0x13 => Self::Smc32,
            0x16 => Self::Hvc64,
            0x17 => Self::Smc64,
            0x18 => Self::SysReg64,
            0x20 => Self::InstrAbortLowerEl,
            0x24 => Self::DataAbortLowerEl,
            other => Self::Other(other),
        }
    }
}

/// A decoded stage-2 data abort.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataAbort {
    /// Faulting guest physical address.
    pub addr: GuestPhysAddr,
    pub width: AccessWidth,
    pub write: bool,
    /// Whether the syndrome describes the access (ISV). Without it the
    /// instruction would have to be emulated.
    pub valid: bool,
    pub sign_extend: bool,
    /// Transfer register index, 31 is the zero register.
    pub reg: usize,
    /// The transfer register is a 64-bit `X` register rather than `W`.
    pub reg_64bit: bool,
}

/// A decoded coprocessor (CP14/CP15) or system register access.
///
/// For aarch32 coprocessor traps `op0` is always 0 and `op1`/`op2` hold
/// `opc1`/`opc2`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoprocAccess {
    pub op0: u8,
    pub op1: u8,
    pub crn: u8,
    pub crm: u8,
    pub op2: u8,
    pub rt: usize,
    pub read: bool,
}

/// A guest exit decoded into its class-specific fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exception {
    DataAbort(DataAbort),
    InstructionAbort { addr: GuestPhysAddr },
    Wfx { wfe: bool },
    Cp14(CoprocAccess),
    Cp15(CoprocAccess),
    SysReg(CoprocAccess),
    Hvc { imm: u16 },
    Smc { imm: u16 },
    Unknown { class: u8 },
}

/// The syndrome of one guest exit: the raw `ESR_EL2` value plus the faulting
/// intermediate physical address reported by the host.
#[derive(Clone, Copy)]
pub struct ExitSyndrome {
    esr: LocalRegisterCopy<u64, ESR::Register>,
    fault_ipa: GuestPhysAddr,
}

impl ExitSyndrome {
    /// Creates a syndrome from the raw ESR and the faulting IPA.
    pub fn new(esr: u64, fault_ipa: GuestPhysAddr) -> Self {
        Self {
            esr: LocalRegisterCopy::new(esr),
            fault_ipa,
        }
    }

    /// Creates a syndrome from the raw `FAR_EL2`/`HPFAR_EL2` pair.
    ///
    /// `HPFAR_EL2[39:4]` holds `IPA[51:12]` and the page offset comes from FAR.
    pub fn from_hpfar(esr: u64, far: usize, hpfar: usize) -> Self {
        Self::new(esr, (far & 0xfff) | ((hpfar & !0xf) << 8))
    }

    pub fn esr(&self) -> u64 {
        self.esr.get()
    }

    pub fn fault_ipa(&self) -> GuestPhysAddr {
        self.fault_ipa
    }

    pub fn exception_class(&self) -> ExceptionClass {
        ExceptionClass::from(self.esr.read(ESR::EC) as u8)
    }

    pub fn iss(&self) -> u64 {
        self.esr.read(ESR::ISS)
    }

    /// Length in bytes of the trapped instruction.
    pub fn next_instruction_step(&self) -> usize {
        if self.esr.is_set(ESR::IL) {
            4
        } else {
            2
        }
    }

    fn abort(&self) -> LocalRegisterCopy<u64, ISS_ABORT::Register> {
        LocalRegisterCopy::new(self.esr.get())
    }

    pub fn data_abort_handleable(&self) -> bool {
        self.abort().is_set(ISS_ABORT::ISV)
    }

    pub fn data_abort_is_translate_fault(&self) -> bool {
        self.abort().read(ISS_ABORT::DFSC) & FSC_TYPE_MASK == FSC_TRANSLATION_FAULT
    }

    pub fn data_abort_access_width(&self) -> AccessWidth {
        match self.abort().read_as_enum(ISS_ABORT::SAS) {
            Some(ISS_ABORT::SAS::Value::Byte) => AccessWidth::Byte,
            Some(ISS_ABORT::SAS::Value::Halfword) => AccessWidth::Word,
            Some(ISS_ABORT::SAS::Value::Word) => AccessWidth::Dword,
            _ => AccessWidth::Qword,
        }
    }

    pub fn data_abort_access_is_write(&self) -> bool {
        self.abort().is_set(ISS_ABORT::WNR)
    }

    pub fn data_abort_access_reg(&self) -> usize {
        self.abort().read(ISS_ABORT::SRT) as usize
    }

    pub fn data_abort_access_reg_is_64bit(&self) -> bool {
        self.abort().is_set(ISS_ABORT::SF)
    }

    pub fn data_abort_access_is_sign_ext(&self) -> bool {
        self.abort().is_set(ISS_ABORT::SSE)
    }

    fn coproc(&self) -> CoprocAccess {
        let iss = LocalRegisterCopy::<u64, ISS_CP::Register>::new(self.esr.get());
        CoprocAccess {
            op0: 0,
            op1: iss.read(ISS_CP::OPC1) as u8,
            crn: iss.read(ISS_CP::CRN) as u8,
            crm: iss.read(ISS_CP::CRM) as u8,
            op2: iss.read(ISS_CP::OPC2) as u8,
            rt: iss.read(ISS_CP::RT) as usize,
            read: iss.matches_all(ISS_CP::DIRECTION::Read),
        }
    }

    fn sysreg(&self) -> CoprocAccess {
        let iss = LocalRegisterCopy::<u64, ISS_SYSREG::Register>::new(self.esr.get());
        CoprocAccess {
            op0: iss.read(ISS_SYSREG::OP0) as u8,
            op1: iss.read(ISS_SYSREG::OP1) as u8,
            crn: iss.read(ISS_SYSREG::CRN) as u8,
            crm: iss.read(ISS_SYSREG::CRM) as u8,
            op2: iss.read(ISS_SYSREG::OP2) as u8,
            rt: iss.read(ISS_SYSREG::RT) as usize,
            read: iss.matches_all(ISS_SYSREG::DIRECTION::Read),
        }
    }

    fn imm16(&self) -> u16 {
        LocalRegisterCopy::<u64, ISS_IMM::Register>::new(self.esr.get()).read(ISS_IMM::IMM16) as u16
    }

    /// Decodes the syndrome into its class-specific fields.
    pub fn decode(&self) -> Exception {
        match self.exception_class() {
            ExceptionClass::DataAbortLowerEl => Exception::DataAbort(DataAbort {
                addr: self.fault_ipa,
                width: self.data_abort_access_width(),
                write: self.data_abort_access_is_write(),
                valid: self.data_abort_handleable(),
                sign_extend: self.data_abort_access_is_sign_ext(),
                reg: self.data_abort_access_reg(),
                reg_64bit: self.data_abort_access_reg_is_64bit(),
            }),
            ExceptionClass::InstrAbortLowerEl => Exception::InstructionAbort {
                addr: self.fault_ipa,
            },
            ExceptionClass::WfiWfe => {
                let iss = LocalRegisterCopy::<u64, ISS_WFX::Register>::new(self.esr.get());
                Exception::Wfx {
                    wfe: !iss.matches_all(ISS_WFX::TI::Wfi),
                }
            }
            ExceptionClass::Cp14McrMrc => Exception::Cp14(self.coproc()),
            ExceptionClass::Cp15McrMrc => Exception::Cp15(self.coproc()),
            ExceptionClass::SysReg64 => Exception::SysReg(self.sysreg()),
            ExceptionClass::Hvc32 | ExceptionClass::Hvc64 => Exception::Hvc { imm: self.imm16() },
            ExceptionClass::Smc32 | ExceptionClass::Smc64 => Exception::Smc { imm: self.imm16() },
            ExceptionClass::Other(class) => Exception::Unknown { class },
        }
    }
}

impl fmt::Debug for ExitSyndrome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitSyndrome")
            .field("esr", &format_args!("{:#x}", self.esr.get()))
            .field("ec", &self.exception_class())
            .field("fault_ipa", &format_args!("{:#x}", self.fault_ipa))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn esr(ec: u64, il: bool, iss: u64) -> u64 {
        (ec << 26) | ((il as u64) << 25) | iss
    }

    #[test]
    fn decodes_data_abort_write() {
        // ISV, SAS=word, SRT=x3, WnR, translation fault level 1.
        let iss = (1 << 24) | (2 << 22) | (3 << 16) | (1 << 6) | 0b000101;
        let syndrome = ExitSyndrome::new(esr(0x24, true, iss), 0x0a00_0050);
        assert_eq!(syndrome.next_instruction_step(), 4);
        assert!(syndrome.data_abort_is_translate_fault());
        assert_eq!(
            syndrome.decode(),
            Exception::DataAbort(DataAbort {
                addr: 0x0a00_0050,
                width: AccessWidth::Dword,
                write: true,
                valid: true,
                sign_extend: false,
                reg: 3,
                reg_64bit: false,
            })
        );
    }

    #[test]
    fn decodes_sign_extended_byte_read() {
        let iss = (1 << 24) | (1 << 21) | (7 << 16) | (1 << 15);
        match ExitSyndrome::new(esr(0x24, true, iss), 0x1000).decode() {
            Exception::DataAbort(abort) => {
                assert_eq!(abort.width, AccessWidth::Byte);
                assert!(!abort.write);
                assert!(abort.sign_extend);
                assert!(abort.reg_64bit);
                assert_eq!(abort.reg, 7);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn decodes_wfi_and_wfe() {
        assert_eq!(
            ExitSyndrome::new(esr(0x01, true, 0), 0).decode(),
            Exception::Wfx { wfe: false }
        );
        assert_eq!(
            ExitSyndrome::new(esr(0x01, true, 1), 0).decode(),
            Exception::Wfx { wfe: true }
        );
    }

    #[test]
    fn decodes_mdccsr_read() {
        // MRS x5, MDCCSR_EL0: op0=2 op1=3 CRn=0 CRm=1 op2=0.
        let iss = (2 << 20) | (3 << 14) | (5 << 5) | (1 << 1) | 1;
        assert_eq!(
            ExitSyndrome::new(esr(0x18, true, iss), 0).decode(),
            Exception::SysReg(CoprocAccess {
                op0: 2,
                op1: 3,
                crn: 0,
                crm: 1,
                op2: 0,
                rt: 5,
                read: true,
            })
        );
    }

    #[test]
    fn decodes_smc_immediate_and_unknown_class() {
        assert_eq!(
            ExitSyndrome::new(esr(0x17, true, 0x42), 0).decode(),
            Exception::Smc { imm: 0x42 }
        );
        assert_eq!(
            ExitSyndrome::new(esr(0x07, true, 0), 0).decode(),
            Exception::Unknown { class: 0x07 }
        );
    }

    #[test]
    fn aarch32_calls_decode_like_aarch64() {
        assert_eq!(ExceptionClass::from(0x12), ExceptionClass::Hvc32);
        assert_eq!(
            ExitSyndrome::new(esr(0x12, false, 0), 0).decode(),
            Exception::Hvc { imm: 0 }
        );
        assert_eq!(
            ExitSyndrome::new(esr(0x13, true, 0x7), 0).decode(),
            Exception::Smc { imm: 0x7 }
        );
    }

    #[test]
    fn computes_ipa_from_hpfar() {
        let syndrome = ExitSyndrome::from_hpfar(esr(0x24, true, 0), 0xffff_0123, 0x0a00_0 << 4);
        assert_eq!(syndrome.fault_ipa(), 0x0a00_0123);
    }
}
