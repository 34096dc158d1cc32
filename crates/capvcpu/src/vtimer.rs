use core::time::Duration;

use tock_registers::{register_bitfields, LocalRegisterCopy};

register_bitfields! {u64,
    CNTV_CTL [
        ENABLE OFFSET(0) NUMBITS(1) [],
        IMASK OFFSET(1) NUMBITS(1) [],
        ISTATUS OFFSET(2) NUMBITS(1) []
    ]
}

/// INTID of the EL1 virtual timer PPI.
pub const VTIMER_IRQ: u32 = 27;

/// A snapshot of the guest's EL1 virtual timer taken at exit time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VirtualTimer {
    /// `CNTV_CTL_EL0`.
    pub ctl: u64,
    /// `CNTV_CVAL_EL0`.
    pub cval: u64,
    /// `CNTVCT_EL0` at the time of the snapshot.
    pub counter: u64,
}

/// How long a WFI may block according to the virtual timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerDeadline {
    /// The comparator is disabled or masked, there is no upper bound.
    Disarmed,
    /// The comparator is already in the past.
    Expired,
    /// The comparator fires after this long.
    After(Duration),
}

impl VirtualTimer {
    /// The comparator is enabled and its interrupt is not masked.
    pub fn is_armed(&self) -> bool {
        let ctl = LocalRegisterCopy::<u64, CNTV_CTL::Register>::new(self.ctl);
        ctl.is_set(CNTV_CTL::ENABLE) && !ctl.is_set(CNTV_CTL::IMASK)
    }

    /// Computes the wait bound at `clock_scale` counter ticks per microsecond.
    pub fn deadline(&self, clock_scale: u64) -> TimerDeadline {
        if !self.is_armed() {
            return TimerDeadline::Disarmed;
        }
        if self.cval <= self.counter {
            return TimerDeadline::Expired;
        }
        let ticks = self.cval - self.counter;
        TimerDeadline::After(Duration::from_micros(ticks / clock_scale.max(1)))
    }
}
