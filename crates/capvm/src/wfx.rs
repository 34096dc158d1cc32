use axerrno::AxResult;
use capvcpu::{TimerDeadline, VCpu};

use crate::{CapVmHal, HostPort, Vm};

impl<H: CapVmHal> Vm<H> {
    /// Emulates WFI and WFE.
    ///
    /// Devices are polled first so host input can raise an interrupt. The
    /// vCPU then blocks in a single host wait, bounded by its virtual timer,
    /// unless an interrupt is already deliverable or the timer has expired.
    pub(crate) fn handle_wfx(
        &self,
        vcpu: &mut VCpu<H::VCpu>,
        port: &mut H::Port,
        wfe: bool,
    ) -> AxResult {
        for (region, device) in self.registry.iter() {
            if let Err(e) = device.poll() {
                warn!("{} at {}: poll failed: {:?}", device.name(), region, e);
            }
        }

        if self.vgic.schedule_pending(vcpu.id()) {
            trace!("vcpu {}: interrupt pending, no wait", vcpu.id());
            return Ok(());
        }

        let timeout = match vcpu.vtimer()?.deadline(self.clock_scale) {
            TimerDeadline::Expired => {
                trace!("vcpu {}: timer expired, no wait", vcpu.id());
                return Ok(());
            }
            TimerDeadline::Disarmed => None,
            TimerDeadline::After(timeout) => Some(timeout),
        };

        debug!(
            "vcpu {}: {} waits {:?}",
            vcpu.id(),
            if wfe { "wfe" } else { "wfi" },
            timeout
        );
        vcpu.block()?;
        let woken = port.wait(timeout);
        vcpu.unblock()?;
        if let Some(label) = woken? {
            self.dispatch_notification(label);
        }
        self.drain_notifications(port)
    }
}
