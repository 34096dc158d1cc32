use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::sync::Arc;

use axerrno::{ax_err, AxResult};
use capaddrspace::MmioDevice;
use capvcpu::{EoiHandler, IrqLine};

use crate::HostIrq;

/// Reacts to a notification label.
pub trait NotificationHandler: Send + Sync {
    fn handle(&self, label: u64) -> AxResult;
}

impl<F> NotificationHandler for F
where
    F: Fn(u64) -> AxResult + Send + Sync,
{
    fn handle(&self, label: u64) -> AxResult {
        self(label)
    }
}

/// Maps notification labels to their handlers.
#[derive(Default)]
pub struct NotificationTable {
    handlers: BTreeMap<u64, Arc<dyn NotificationHandler>>,
}

impl NotificationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `label`. Each label has a single handler.
    pub fn register(&mut self, label: u64, handler: Arc<dyn NotificationHandler>) -> AxResult {
        if self.handlers.contains_key(&label) {
            return ax_err!(
                AlreadyExists,
                format!("notification label {} already bound", label)
            );
        }
        self.handlers.insert(label, handler);
        Ok(())
    }

    pub fn contains(&self, label: u64) -> bool {
        self.handlers.contains_key(&label)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the handler of `label`. Unknown labels are logged and ignored.
    pub fn dispatch(&self, label: u64) -> AxResult {
        match self.handlers.get(&label) {
            Some(handler) => {
                trace!("notification {}", label);
                handler.handle(label)
            }
            None => {
                warn!("notification with unknown label {}", label);
                Ok(())
            }
        }
    }
}

/// Forwards a physical interrupt to the guest.
///
/// The host notification raises the virtual line. Once the guest EOIs it the
/// physical interrupt is acknowledged so that it can fire again.
pub struct IrqBridge {
    host: Arc<dyn HostIrq>,
    line: IrqLine,
}

impl IrqBridge {
    pub fn new(host: Arc<dyn HostIrq>, line: IrqLine) -> Self {
        Self { host, line }
    }

    pub fn line(&self) -> &IrqLine {
        &self.line
    }

    /// The callback to install for the virtual INTID.
    pub fn eoi_handler(&self) -> EoiHandler {
        let host = self.host.clone();
        Box::new(move |irq| {
            if let Err(e) = host.ack() {
                warn!("ack of passthrough irq {} failed: {:?}", irq, e);
            }
        })
    }
}

impl NotificationHandler for IrqBridge {
    fn handle(&self, _label: u64) -> AxResult {
        self.line.raise()
    }
}

/// Lets a device pick up host input when its label fires.
pub(crate) struct PollDevice(pub Arc<dyn MmioDevice>);

impl NotificationHandler for PollDevice {
    fn handle(&self, _label: u64) -> AxResult {
        self.0.poll()
    }
}

/// Raises a device's interrupt, for devices whose queues are served
/// elsewhere.
pub(crate) struct RaiseIrq(pub IrqLine);

impl NotificationHandler for RaiseIrq {
    fn handle(&self, _label: u64) -> AxResult {
        self.0.raise()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axerrno::AxError;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dispatches_by_label() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut table = NotificationTable::new();
        let counter = hits.clone();
        table
            .register(
                7,
                Arc::new(move |label: u64| -> AxResult {
                    counter.fetch_add(label as usize, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
        assert_eq!(
            table.register(7, Arc::new(|_: u64| -> AxResult { Ok(()) })),
            Err(AxError::AlreadyExists)
        );
        table.dispatch(7).unwrap();
        table.dispatch(8).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 7);
        assert_eq!(table.len(), 1);
        assert!(table.contains(7));
    }
}
