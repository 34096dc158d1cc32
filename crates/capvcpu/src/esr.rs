//! Bitfield layouts of the aarch64 exception syndrome register (ESR_EL2).
//!
//! The ISS layouts are declared over the full 64-bit syndrome so a single
//! [`tock_registers::LocalRegisterCopy`] can be read through any of them.

use tock_registers::register_bitfields;

register_bitfields! {u64,
    pub ESR [
        EC OFFSET(26) NUMBITS(6) [],
        /// 1 means a 32-bit instruction, 0 a 16-bit one.
        IL OFFSET(25) NUMBITS(1) [],
        ISS OFFSET(0) NUMBITS(25) []
    ],

    /// ISS of data and instruction aborts.
    pub ISS_ABORT [
        ISV OFFSET(24) NUMBITS(1) [],
        SAS OFFSET(22) NUMBITS(2) [
            Byte = 0,
            Halfword = 1,
            Word = 2,
            Doubleword = 3
        ],
        SSE OFFSET(21) NUMBITS(1) [],
        SRT OFFSET(16) NUMBITS(5) [],
        SF OFFSET(15) NUMBITS(1) [],
        AR OFFSET(14) NUMBITS(1) [],
        CM OFFSET(8) NUMBITS(1) [],
        S1PTW OFFSET(7) NUMBITS(1) [],
        WNR OFFSET(6) NUMBITS(1) [],
        DFSC OFFSET(0) NUMBITS(6) []
    ],

    /// ISS of trapped WFI/WFE.
    pub ISS_WFX [
        TI OFFSET(0) NUMBITS(2) [
            Wfi = 0,
            Wfe = 1
        ]
    ],

    /// ISS of trapped MCR/MRC accesses to CP14/CP15 (aarch32 guests).
    pub ISS_CP [
        CV OFFSET(24) NUMBITS(1) [],
        COND OFFSET(20) NUMBITS(4) [],
        OPC2 OFFSET(17) NUMBITS(3) [],
        OPC1 OFFSET(14) NUMBITS(3) [],
        CRN OFFSET(10) NUMBITS(4) [],
        RT OFFSET(5) NUMBITS(5) [],
        CRM OFFSET(1) NUMBITS(4) [],
        DIRECTION OFFSET(0) NUMBITS(1) [
            Write = 0,
            Read = 1
        ]
    ],

    /// ISS of trapped MSR/MRS system register accesses (aarch64 guests).
    pub ISS_SYSREG [
        OP0 OFFSET(20) NUMBITS(2) [],
        OP2 OFFSET(17) NUMBITS(3) [],
        OP1 OFFSET(14) NUMBITS(3) [],
        CRN OFFSET(10) NUMBITS(4) [],
        RT OFFSET(5) NUMBITS(5) [],
        CRM OFFSET(1) NUMBITS(4) [],
        DIRECTION OFFSET(0) NUMBITS(1) [
            Write = 0,
            Read = 1
        ]
    ],

    /// ISS of HVC/SMC.
    pub ISS_IMM [
        IMM16 OFFSET(0) NUMBITS(16) []
    ]
}

/// Fault status codes with the level bits masked off.
pub const FSC_TRANSLATION_FAULT: u64 = 0b000100;
/// Mask selecting the fault type part of DFSC/IFSC.
pub const FSC_TYPE_MASK: u64 = 0b111100;
