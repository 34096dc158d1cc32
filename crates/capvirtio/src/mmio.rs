use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use axerrno::AxResult;
use capaddrspace::{
    AccessKind, AccessOutcome, AccessWidth, GuestMemory, MmioAccess, MmioDevice, Stage2Mapper,
};
use capvcpu::IrqLine;
use spin::Mutex;

use crate::consts::*;
use crate::ring::Ring;

/// Work a backend schedules to run after the device lock is released.
pub type Deferred = Box<dyn FnOnce() + Send>;

/// The device-specific half of a virtio device.
///
/// Every method runs with the device lock held. Anything that has to touch
/// another device goes through [`DeviceContext::defer`].
pub trait VirtioBackend: Send {
    /// The virtio device id.
    fn device_id(&self) -> u32;

    /// Maximum size of each queue. The length is the number of queues.
    fn queue_max(&self) -> &[u16];

    /// Feature bits offered to the driver.
    fn host_features(&self) -> u64 {
        0
    }

    /// Reads the device configuration space.
    fn read_config(&self, _offset: usize, _width: AccessWidth) -> u64 {
        0
    }

    /// Writes the device configuration space.
    fn write_config(&mut self, offset: usize, _width: AccessWidth, value: u64) {
        warn!("ignored config write {:#x} at {:#x}", value, offset);
    }

    /// The driver notified `queue`.
    fn kick(&mut self, ctx: &mut DeviceContext<'_>, queue: usize) -> AxResult;

    /// Picks up host-side input.
    fn poll(&mut self, _ctx: &mut DeviceContext<'_>) -> AxResult {
        Ok(())
    }

    /// The driver reset the device.
    fn reset(&mut self) {}
}

/// Reads `width` bytes at `offset` out of a little endian config space image.
///
/// Bytes past the end of `space` read as zero.
pub fn read_config_bytes(space: &[u8], offset: usize, width: AccessWidth) -> u64 {
    let mut out = [0u8; 8];
    for (i, byte) in out.iter_mut().take(width.size()).enumerate() {
        if let Some(b) = offset.checked_add(i).and_then(|at| space.get(at)) {
            *byte = *b;
        }
    }
    u64::from_le_bytes(out)
}

struct QueueState {
    max_num: u16,
    num: u16,
    align: u32,
    pfn: u32,
    ring: Option<Ring>,
}

impl QueueState {
    fn new(max_num: u16) -> Self {
        Self {
            max_num,
            num: 0,
            align: DEFAULT_QUEUE_ALIGN,
            pfn: 0,
            ring: None,
        }
    }
}

/// What a backend sees of its device while handling a kick or a poll.
pub struct DeviceContext<'a> {
    mem: &'a dyn GuestMemory,
    queues: &'a mut [QueueState],
    interrupt_status: &'a mut InterruptStatus,
    irq: &'a IrqLine,
    deferred: &'a mut Vec<Deferred>,
}

impl<'a> DeviceContext<'a> {
    pub fn mem(&self) -> &'a dyn GuestMemory {
        self.mem
    }

    /// The ring of `queue`, if the driver has set it up.
    pub fn queue(&mut self, queue: usize) -> Option<(&mut Ring, &'a dyn GuestMemory)> {
        let mem = self.mem;
        self.queues
            .get_mut(queue)
            .and_then(|q| q.ring.as_mut())
            .map(|ring| (ring, mem))
    }

    /// Flags a used buffer notification and raises the interrupt.
    pub fn signal_used(&mut self) -> AxResult {
        self.interrupt_status.insert(InterruptStatus::USED_BUFFER);
        self.irq.raise()
    }

    /// Flags a configuration change and raises the interrupt.
    pub fn signal_config(&mut self) -> AxResult {
        self.interrupt_status.insert(InterruptStatus::CONFIG_CHANGE);
        self.irq.raise()
    }

    /// Runs `f` once the device lock has been released.
    pub fn defer(&mut self, f: impl FnOnce() + Send + 'static) {
        self.deferred.push(Box::new(f));
    }
}

struct Inner<B> {
    host_features_sel: u32,
    guest_features: u64,
    guest_features_sel: u32,
    page_size: u32,
    queue_sel: u32,
    queues: Vec<QueueState>,
    interrupt_status: InterruptStatus,
    status: DeviceStatus,
    backend: B,
}

impl<B: VirtioBackend> Inner<B> {
    fn reset(&mut self) {
        self.host_features_sel = 0;
        self.guest_features = 0;
        self.guest_features_sel = 0;
        self.page_size = DEFAULT_PAGE_SIZE;
        self.queue_sel = 0;
        for q in self.queues.iter_mut() {
            *q = QueueState::new(q.max_num);
        }
        self.interrupt_status = InterruptStatus::empty();
        self.status = DeviceStatus::empty();
        self.backend.reset();
    }

    fn selected(&mut self) -> Option<&mut QueueState> {
        let sel = self.queue_sel as usize;
        let q = self.queues.get_mut(sel);
        if q.is_none() {
            warn!("access to unselected queue {}", sel);
        }
        q
    }

    fn setup_ring(&mut self, mem: &dyn GuestMemory, pfn: u32) {
        let page_size = self.page_size as usize;
        let Some(q) = self.selected() else {
            return;
        };
        q.pfn = pfn;
        q.ring = None;
        if pfn == 0 {
            return;
        }
        let base = match (pfn as usize).checked_mul(page_size) {
            Some(base) => base,
            None => {
                warn!("queue pfn {:#x} out of range", pfn);
                return;
            }
        };
        match Ring::new(mem, base, q.num, q.align as usize) {
            Ok(ring) => q.ring = Some(ring),
            Err(e) => warn!("queue at {:#x} num {} rejected: {:?}", base, q.num, e),
        }
    }
}

/// A legacy virtio-mmio device: the generic register window in front of a
/// [`VirtioBackend`].
pub struct VirtioMmio<B: VirtioBackend> {
    name: String,
    mem: Arc<dyn GuestMemory>,
    irq: IrqLine,
    inner: Mutex<Inner<B>>,
}

impl<B: VirtioBackend> VirtioMmio<B> {
    pub fn new(name: impl Into<String>, mem: Arc<dyn GuestMemory>, irq: IrqLine, backend: B) -> Self {
        let queues = backend.queue_max().iter().map(|&max| QueueState::new(max)).collect();
        Self {
            name: name.into(),
            mem,
            irq,
            inner: Mutex::new(Inner {
                host_features_sel: 0,
                guest_features: 0,
                guest_features_sel: 0,
                page_size: DEFAULT_PAGE_SIZE,
                queue_sel: 0,
                queues,
                interrupt_status: InterruptStatus::empty(),
                status: DeviceStatus::empty(),
                backend,
            }),
        }
    }

    pub fn irq(&self) -> &IrqLine {
        &self.irq
    }

    pub fn status(&self) -> DeviceStatus {
        self.inner.lock().status
    }

    /// The features the driver accepted.
    pub fn guest_features(&self) -> u64 {
        self.inner.lock().guest_features
    }

    /// Whether `queue` has a usable ring.
    pub fn queue_ready(&self, queue: usize) -> bool {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(false, |q| q.ring.is_some())
    }

    /// Runs `f` on the backend with the device locked, then runs whatever the
    /// backend deferred.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut B, &mut DeviceContext<'_>) -> R) -> R {
        let mut deferred = Vec::new();
        let ret = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let mut ctx = DeviceContext {
                mem: &*self.mem,
                queues: &mut inner.queues,
                interrupt_status: &mut inner.interrupt_status,
                irq: &self.irq,
                deferred: &mut deferred,
            };
            f(&mut inner.backend, &mut ctx)
        };
        for work in deferred {
            work();
        }
        ret
    }

    /// Delivers a notification for `queue` to the backend.
    pub fn kick(&self, queue: usize) -> AxResult {
        if !self.queue_ready(queue) {
            warn!("{}: notify on queue {} without a ring", self.name, queue);
            return Ok(());
        }
        debug!("{}: kick queue {}", self.name, queue);
        self.with_device(|backend, ctx| backend.kick(ctx, queue))
    }

    /// Kicks every queue which has a ring.
    pub fn kick_configured(&self) -> AxResult {
        let ready: Vec<usize> = {
            let inner = self.inner.lock();
            (0..inner.queues.len())
                .filter(|&i| inner.queues[i].ring.is_some())
                .collect()
        };
        for queue in ready {
            self.kick(queue)?;
        }
        Ok(())
    }

    /// Lets the backend pick up host-side input.
    pub fn poll_backend(&self) -> AxResult {
        self.with_device(|backend, ctx| backend.poll(ctx))
    }

    /// Reads the register at `offset`.
    pub fn read_register(&self, offset: usize, width: AccessWidth) -> u64 {
        if offset >= CONFIG {
            return self.inner.lock().backend.read_config(offset - CONFIG, width);
        }
        if width != AccessWidth::Dword || offset % 4 != 0 {
            warn!("{}: bad register read {:#x} {:?}", self.name, offset, width);
            return 0;
        }
        let mut inner = self.inner.lock();
        let val = match offset {
            MAGIC_VALUE => VIRTIO_MMIO_MAGIC,
            VERSION => VIRTIO_MMIO_VERSION_LEGACY,
            DEVICE_ID => inner.backend.device_id(),
            VENDOR_ID => VIRTIO_VENDOR_ID,
            HOST_FEATURES => match inner.host_features_sel {
                0 => inner.backend.host_features() as u32,
                1 => (inner.backend.host_features() >> 32) as u32,
                _ => 0,
            },
            QUEUE_NUM_MAX => inner.selected().map_or(0, |q| q.max_num as u32),
            QUEUE_PFN => inner.selected().map_or(0, |q| q.pfn),
            INTERRUPT_STATUS => inner.interrupt_status.bits(),
            STATUS => inner.status.bits(),
            _ => {
                warn!("{}: read of write-only register {:#x}", self.name, offset);
                0
            }
        };
        trace!("{}: read {:#x} -> {:#x}", self.name, offset, val);
        val as u64
    }

    /// Writes `value` to the register at `offset`.
    pub fn write_register(&self, offset: usize, width: AccessWidth, value: u64) -> AxResult {
        if offset >= CONFIG {
            self.inner
                .lock()
                .backend
                .write_config(offset - CONFIG, width, value);
            return Ok(());
        }
        if width != AccessWidth::Dword || offset % 4 != 0 {
            warn!("{}: bad register write {:#x} {:?}", self.name, offset, width);
            return Ok(());
        }
        let val = value as u32;
        trace!("{}: write {:#x} <- {:#x}", self.name, offset, val);
        if offset == QUEUE_NOTIFY {
            return self.kick(val as usize);
        }
        let mut inner = self.inner.lock();
        match offset {
            HOST_FEATURES_SEL => inner.host_features_sel = val,
            GUEST_FEATURES => match inner.guest_features_sel {
                0 => inner.guest_features = (inner.guest_features & !0xffff_ffff) | val as u64,
                1 => {
                    inner.guest_features =
                        (inner.guest_features & 0xffff_ffff) | ((val as u64) << 32)
                }
                sel => warn!("{}: guest features window {} ignored", self.name, sel),
            },
            GUEST_FEATURES_SEL => inner.guest_features_sel = val,
            GUEST_PAGE_SIZE => inner.page_size = val,
            QUEUE_SEL => inner.queue_sel = val,
            QUEUE_NUM => {
                if let Some(q) = inner.selected() {
                    q.num = (val.min(q.max_num as u32)) as u16;
                }
            }
            QUEUE_ALIGN => {
                if let Some(q) = inner.selected() {
                    q.align = val;
                }
            }
            QUEUE_PFN => inner.setup_ring(&*self.mem, val),
            INTERRUPT_ACK => {
                inner.interrupt_status &= !InterruptStatus::from_bits_truncate(val);
            }
            STATUS => {
                if val == 0 {
                    info!("{}: reset", self.name);
                    inner.reset();
                } else {
                    inner.status = DeviceStatus::from_bits_retain(val);
                    if inner.status.contains(DeviceStatus::FAILED) {
                        warn!("{}: driver gave up on the device", self.name);
                    }
                }
            }
            _ => warn!("{}: write to read-only register {:#x}", self.name, offset),
        }
        Ok(())
    }
}

impl<B: VirtioBackend> MmioDevice for VirtioMmio<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn access(&self, access: &MmioAccess, _stage2: &dyn Stage2Mapper) -> AxResult<AccessOutcome> {
        match access.kind {
            AccessKind::Read => Ok(AccessOutcome::Completed(
                self.read_register(access.offset, access.width),
            )),
            AccessKind::Write(value) => {
                self.write_register(access.offset, access.width, value)?;
                Ok(AccessOutcome::Completed(0))
            }
        }
    }

    fn poll(&self) -> AxResult {
        self.poll_backend()
    }
}
