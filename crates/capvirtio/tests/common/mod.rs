#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axerrno::AxResult;
use capaddrspace::{AccessWidth, GuestMemory, GuestRam, GuestRegion};
use capvcpu::{EoiHandler, IrqLine, Vgic};
use capvirtio::consts::*;
use capvirtio::ring::{RingLayout, DESC_SIZE, USED_ELEM_SIZE};
use capvirtio::{VirtioBackend, VirtioMmio};

pub const RAM_BASE: usize = 0x4000_0000;
pub const RAM_SIZE: usize = 0x20_0000;
pub const PAGE: usize = 4096;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn guest_ram() -> Arc<GuestRam> {
    Arc::new(GuestRam::new(GuestRegion::new(RAM_BASE, RAM_SIZE).unwrap()))
}

#[derive(Default)]
pub struct RecordingVgic {
    pub injected: Mutex<Vec<(u32, usize)>>,
}

impl RecordingVgic {
    pub fn count(&self, irq: u32) -> usize {
        self.injected
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, _)| *i == irq)
            .count()
    }
}

impl Vgic for RecordingVgic {
    fn inject(&self, irq: u32, cpu: usize) -> AxResult {
        self.injected.lock().unwrap().push((irq, cpu));
        Ok(())
    }

    fn schedule_pending(&self, _cpu: usize) -> bool {
        !self.injected.lock().unwrap().is_empty()
    }

    fn set_eoi_handler(&self, _irq: u32, _handler: EoiHandler) -> AxResult {
        Ok(())
    }
}

pub fn irq_line(vgic: &Arc<RecordingVgic>, irq: u32) -> IrqLine {
    IrqLine::new(vgic.clone(), irq, 0)
}

struct DriverQueue {
    num: u16,
    layout: RingLayout,
    avail_idx: u16,
    next_desc: u16,
    last_used: u16,
}

/// Plays the guest driver's side of a legacy virtio-mmio device.
pub struct Driver {
    pub mem: Arc<GuestRam>,
    queues: HashMap<usize, DriverQueue>,
    next_buf: usize,
}

impl Driver {
    pub fn new(mem: Arc<GuestRam>) -> Self {
        Self {
            mem,
            queues: HashMap::new(),
            next_buf: RAM_BASE + 0x10_0000,
        }
    }

    pub fn write<B: VirtioBackend>(&self, dev: &VirtioMmio<B>, offset: usize, val: u32) {
        dev.write_register(offset, AccessWidth::Dword, val as u64)
            .unwrap();
    }

    pub fn read<B: VirtioBackend>(&self, dev: &VirtioMmio<B>, offset: usize) -> u32 {
        dev.read_register(offset, AccessWidth::Dword) as u32
    }

    /// Runs the legacy handshake and sets up every queue at `num` entries.
    /// Each device gets its rings at a distinct `slot`.
    pub fn init<B: VirtioBackend>(&mut self, dev: &VirtioMmio<B>, slot: usize, queues: usize, num: u16) {
        self.write(dev, STATUS, 0);
        self.write(dev, STATUS, DeviceStatus::ACKNOWLEDGE.bits());
        self.write(dev, STATUS, (DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER).bits());
        self.write(dev, GUEST_PAGE_SIZE, PAGE as u32);
        for q in 0..queues {
            let base = RAM_BASE + 0x1_0000 * (slot * 4 + q + 1);
            self.write(dev, QUEUE_SEL, q as u32);
            assert!(self.read(dev, QUEUE_NUM_MAX) >= num as u32);
            self.write(dev, QUEUE_NUM, num as u32);
            self.write(dev, QUEUE_ALIGN, PAGE as u32);
            self.write(dev, QUEUE_PFN, (base / PAGE) as u32);
            self.queues.insert(
                slot * 4 + q,
                DriverQueue {
                    num,
                    layout: RingLayout::new(base, num, PAGE).unwrap(),
                    avail_idx: 0,
                    next_desc: 0,
                    last_used: 0,
                },
            );
        }
        self.write(
            dev,
            STATUS,
            (DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER | DeviceStatus::DRIVER_OK).bits(),
        );
    }

    /// Allocates a guest buffer, optionally filled with `data`.
    pub fn alloc(&mut self, len: usize, data: Option<&[u8]>) -> usize {
        let addr = self.next_buf;
        self.next_buf += (len + 63) & !63;
        assert!(self.next_buf <= RAM_BASE + RAM_SIZE);
        if let Some(data) = data {
            self.mem.write(addr, data).unwrap();
        }
        addr
    }

    /// Publishes a chain of `(addr, len, device_writable)` buffers and
    /// returns its head.
    pub fn post(&mut self, slot: usize, q: usize, bufs: &[(usize, u32, bool)]) -> u16 {
        let mem = self.mem.clone();
        let queue = self.queues.get_mut(&(slot * 4 + q)).unwrap();
        let head = queue.next_desc;
        for (i, &(addr, len, writable)) in bufs.iter().enumerate() {
            let index = queue.next_desc;
            queue.next_desc = (queue.next_desc + 1) % queue.num;
            let mut flags = DescFlags::empty();
            if writable {
                flags |= DescFlags::WRITE;
            }
            if i + 1 < bufs.len() {
                flags |= DescFlags::NEXT;
            }
            let at = queue.layout.desc + DESC_SIZE * index as usize;
            mem.write_u64(at, addr as u64).unwrap();
            mem.write_u32(at + 8, len).unwrap();
            mem.write_u16(at + 12, flags.bits()).unwrap();
            mem.write_u16(at + 14, queue.next_desc).unwrap();
        }
        let slot_at = queue.layout.avail + 4 + 2 * (queue.avail_idx % queue.num) as usize;
        mem.write_u16(slot_at, head).unwrap();
        queue.avail_idx = queue.avail_idx.wrapping_add(1);
        mem.write_u16(queue.layout.avail + 2, queue.avail_idx).unwrap();
        head
    }

    /// Makes descriptor `index` continue to a descriptor outside the table.
    pub fn dangle(&self, slot: usize, q: usize, index: u16) {
        let queue = &self.queues[&(slot * 4 + q)];
        let at = queue.layout.desc + DESC_SIZE * index as usize;
        let flags = self.mem.read_u16(at + 12).unwrap() | DescFlags::NEXT.bits();
        self.mem.write_u16(at + 12, flags).unwrap();
        self.mem.write_u16(at + 14, 999).unwrap();
    }

    /// Used entries published since the last call, as `(head, len)`.
    pub fn used(&mut self, slot: usize, q: usize) -> Vec<(u16, u32)> {
        let queue = self.queues.get_mut(&(slot * 4 + q)).unwrap();
        let idx = self.mem.read_u16(queue.layout.used + 2).unwrap();
        let mut out = Vec::new();
        while queue.last_used != idx {
            let at = queue.layout.used + 4 + USED_ELEM_SIZE * (queue.last_used % queue.num) as usize;
            let id = self.mem.read_u32(at).unwrap();
            let len = self.mem.read_u32(at + 4).unwrap();
            out.push((id as u16, len));
            queue.last_used = queue.last_used.wrapping_add(1);
        }
        out
    }

    pub fn read_buf(&self, addr: usize, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.mem.read(addr, &mut buf).unwrap();
        buf
    }
}

/// A host console which records output and serves queued input.
#[derive(Default)]
pub struct RecordingConsole {
    pub output: Mutex<Vec<u8>>,
    pub input: Mutex<std::collections::VecDeque<u8>>,
}

impl capvirtio::HostConsole for RecordingConsole {
    fn read(&self, buf: &mut [u8]) -> AxResult<usize> {
        let mut input = self.input.lock().unwrap();
        if input.is_empty() {
            return Err(axerrno::AxError::WouldBlock);
        }
        let n = buf.len().min(input.len());
        for b in buf.iter_mut().take(n) {
            *b = input.pop_front().unwrap();
        }
        Ok(n)
    }

    fn write(&self, data: &[u8]) -> AxResult {
        self.output.lock().unwrap().extend_from_slice(data);
        Ok(())
    }
}
