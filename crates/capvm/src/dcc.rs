//! The debug communications channel, as used by early console drivers.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use capvcpu::CoprocAccess;
use capvirtio::HostConsole;

/// `TXfull` in `DBGDSCRint` and `MDCCSR_EL0`.
const DCC_TX_FULL: u64 = 1 << 29;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DccRegister {
    /// `DBGDSCRint` / `MDCCSR_EL0`.
    Status,
    /// `DBGDTRTXint` / `DBGDTRTX_EL0` on writes, the RX alias on reads.
    Data,
}

impl DccRegister {
    /// Identifies a CP14 `MRC`/`MCR` or an aarch64 `MRS`/`MSR` encoding.
    pub(crate) fn decode(access: &CoprocAccess, aarch32: bool) -> Option<Self> {
        let enc = (access.op1, access.crn, access.crm, access.op2);
        if aarch32 {
            match enc {
                (0, 0, 1, 0) => Some(Self::Status),
                (0, 0, 5, 0) => Some(Self::Data),
                _ => None,
            }
        } else if access.op0 == 2 {
            match enc {
                (3, 0, 1, 0) => Some(Self::Status),
                (3, 0, 5, 0) => Some(Self::Data),
                _ => None,
            }
        } else {
            None
        }
    }
}

pub(crate) struct Dcc {
    tx_full: AtomicBool,
    console: Arc<dyn HostConsole>,
}

impl Dcc {
    pub(crate) fn new(console: Arc<dyn HostConsole>) -> Self {
        Self {
            tx_full: AtomicBool::new(false),
            console,
        }
    }

    /// Every status read flips `TXfull`, so a polling driver sees the
    /// transmitter drain after one more read.
    pub(crate) fn read(&self, reg: DccRegister) -> u64 {
        match reg {
            DccRegister::Status => {
                if self.tx_full.fetch_xor(true, Ordering::Relaxed) {
                    DCC_TX_FULL
                } else {
                    0
                }
            }
            DccRegister::Data => 0,
        }
    }

    pub(crate) fn write(&self, reg: DccRegister, value: u64) {
        match reg {
            DccRegister::Data => {
                if let Err(e) = self.console.write(&[value as u8]) {
                    warn!("dcc: host console write failed: {:?}", e);
                }
            }
            DccRegister::Status => trace!("dcc: status write {:#x} ignored", value),
        }
    }
}
