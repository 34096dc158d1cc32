//! PSCI 0.2 calls made by the guest with HVC or SMC.

pub const PSCI_VERSION: u32 = 0x8400_0000;
pub const PSCI_CPU_SUSPEND_32: u32 = 0x8400_0001;
pub const PSCI_CPU_OFF: u32 = 0x8400_0002;
pub const PSCI_CPU_ON_32: u32 = 0x8400_0003;
pub const PSCI_AFFINITY_INFO_32: u32 = 0x8400_0004;
pub const PSCI_MIGRATE_INFO_TYPE: u32 = 0x8400_0006;
pub const PSCI_SYSTEM_OFF: u32 = 0x8400_0008;
pub const PSCI_SYSTEM_RESET: u32 = 0x8400_0009;
pub const PSCI_FEATURES: u32 = 0x8400_000a;
pub const PSCI_CPU_ON_64: u32 = 0xc400_0003;
pub const PSCI_AFFINITY_INFO_64: u32 = 0xc400_0004;

/// Version 0.2, major in the upper half.
pub const PSCI_VERSION_0_2: u64 = 2;

pub const PSCI_SUCCESS: i64 = 0;
pub const PSCI_NOT_SUPPORTED: i64 = -1;
pub const PSCI_INVALID_PARAMETERS: i64 = -2;
pub const PSCI_ALREADY_ON: i64 = -4;
pub const PSCI_INTERNAL_FAILURE: i64 = -6;

pub const AFFINITY_ON: i64 = 0;
pub const AFFINITY_OFF: i64 = 1;

/// The trusted OS needs no migration.
pub const MIGRATE_NOT_REQUIRED: i64 = 2;

/// A decoded PSCI call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PsciCall {
    Version,
    CpuOff,
    CpuOn {
        target: u64,
        entry: u64,
        context: u64,
    },
    AffinityInfo {
        target: u64,
        level: u64,
    },
    MigrateInfoType,
    SystemOff,
    SystemReset,
    Features {
        fid: u32,
    },
    Unknown {
        fid: u64,
    },
}

impl PsciCall {
    /// Decodes the function id in x0 and its arguments in x1..x3. SMC32
    /// calling convention arguments are truncated to 32 bits.
    pub(crate) fn decode(x0: u64, x1: u64, x2: u64, x3: u64) -> Self {
        let w = |x: u64| x as u32 as u64;
        if x0 > u32::MAX as u64 {
            return Self::Unknown { fid: x0 };
        }
        match x0 as u32 {
            PSCI_VERSION => Self::Version,
            PSCI_CPU_OFF => Self::CpuOff,
            PSCI_CPU_ON_32 => Self::CpuOn {
                target: w(x1),
                entry: w(x2),
                context: w(x3),
            },
            PSCI_CPU_ON_64 => Self::CpuOn {
                target: x1,
                entry: x2,
                context: x3,
            },
            PSCI_AFFINITY_INFO_32 => Self::AffinityInfo {
                target: w(x1),
                level: w(x2),
            },
            PSCI_AFFINITY_INFO_64 => Self::AffinityInfo {
                target: x1,
                level: x2,
            },
            PSCI_MIGRATE_INFO_TYPE => Self::MigrateInfoType,
            PSCI_SYSTEM_OFF => Self::SystemOff,
            PSCI_SYSTEM_RESET => Self::SystemReset,
            PSCI_FEATURES => Self::Features { fid: x1 as u32 },
            _ => Self::Unknown { fid: x0 },
        }
    }

    pub(crate) fn is_implemented(fid: u32) -> bool {
        matches!(
            fid,
            PSCI_VERSION
                | PSCI_CPU_OFF
                | PSCI_CPU_ON_32
                | PSCI_CPU_ON_64
                | PSCI_AFFINITY_INFO_32
                | PSCI_AFFINITY_INFO_64
                | PSCI_MIGRATE_INFO_TYPE
                | PSCI_SYSTEM_OFF
                | PSCI_SYSTEM_RESET
                | PSCI_FEATURES
        )
    }
}

/// Maps an MPIDR affinity value to a vCPU id. Only Aff0 is used.
pub(crate) fn mpidr_to_vcpu(mpidr: u64) -> Option<usize> {
    if mpidr & !0xff != 0 {
        return None;
    }
    Some(mpidr as usize)
}
