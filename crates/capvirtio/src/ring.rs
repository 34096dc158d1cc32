//! Split virtqueue layout and the device side of the ring protocol.
//!
//! All ring memory belongs to the guest. It is only touched through
//! [`GuestMemory`], and every index, length and address read from it is
//! validated before use.

use core::sync::atomic::{fence, Ordering};

use axerrno::{ax_err, AxResult};
use capaddrspace::{GuestMemory, GuestPhysAddr};

use crate::consts::DescFlags;

/// Size of one descriptor table entry.
pub const DESC_SIZE: usize = 16;
/// Size of one used ring element.
pub const USED_ELEM_SIZE: usize = 8;

/// A descriptor table entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: DescFlags,
    pub next: u16,
}

impl Descriptor {
    fn read(mem: &dyn GuestMemory, gpa: GuestPhysAddr) -> AxResult<Self> {
        let mut raw = [0u8; DESC_SIZE];
        mem.read(gpa, &mut raw)?;
        let word = |range: core::ops::Range<usize>| {
            let mut out = [0u8; 8];
            out[..range.len()].copy_from_slice(&raw[range]);
            u64::from_le_bytes(out)
        };
        Ok(Self {
            addr: word(0..8),
            len: word(8..12) as u32,
            flags: DescFlags::from_bits_retain(word(12..14) as u16),
            next: word(14..16) as u16,
        })
    }

    /// The device may write to the buffer.
    pub fn is_write_only(&self) -> bool {
        self.flags.contains(DescFlags::WRITE)
    }
}

/// Guest physical addresses of the three parts of a ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingLayout {
    pub desc: GuestPhysAddr,
    pub avail: GuestPhysAddr,
    pub used: GuestPhysAddr,
    /// Total extent from `desc` to the end of the used ring.
    pub size: usize,
}

impl RingLayout {
    /// Computes the legacy layout of a ring of `num` entries at `base`.
    ///
    /// `align` must be a power of two. Returns `None` if the layout does not
    /// fit in the address space.
    pub fn new(base: GuestPhysAddr, num: u16, align: usize) -> Option<Self> {
        let num = num as usize;
        if !align.is_power_of_two() {
            return None;
        }
        let avail = base.checked_add(num * DESC_SIZE)?;
        let avail_end = avail.checked_add(4 + 2 * num + 2)?;
        let used = avail_end.checked_add(align - 1)? & !(align - 1);
        let used_end = used.checked_add(4 + USED_ELEM_SIZE * num + 2)?;
        Some(Self {
            desc: base,
            avail,
            used,
            size: used_end - base,
        })
    }
}

/// The device side of one virtqueue.
#[derive(Debug)]
pub struct Ring {
    num: u16,
    layout: RingLayout,
    /// Next avail ring slot the device will consume.
    current_avail: u16,
    /// Next used ring slot the device will fill.
    current_used: u16,
}

impl Ring {
    /// Sets up a ring of `num` entries at `base`.
    ///
    /// `num` must be a non-zero power of two and the whole ring must lie in
    /// guest memory.
    pub fn new(mem: &dyn GuestMemory, base: GuestPhysAddr, num: u16, align: usize) -> AxResult<Self> {
        if num == 0 || !num.is_power_of_two() {
            return ax_err!(InvalidInput, "queue size is not a power of two");
        }
        let layout = match RingLayout::new(base, num, align) {
            Some(layout) => layout,
            None => return ax_err!(InvalidInput, "bad ring layout"),
        };
        mem.check_range(layout.desc, layout.size)?;
        debug!(
            "ring num={} desc={:#x} avail={:#x} used={:#x}",
            num, layout.desc, layout.avail, layout.used
        );
        Ok(Self {
            num,
            layout,
            current_avail: 0,
            current_used: 0,
        })
    }

    pub fn num(&self) -> u16 {
        self.num
    }

    pub fn layout(&self) -> &RingLayout {
        &self.layout
    }

    /// Number of entries the guest has made available and the device has not
    /// consumed yet.
    fn outstanding(&self, mem: &dyn GuestMemory) -> AxResult<u16> {
        let avail_idx = mem.read_u16(self.layout.avail + 2)?;
        let pending = avail_idx.wrapping_sub(self.current_avail);
        if pending > self.num {
            warn!(
                "avail.idx {} runs {} entries ahead of a ring of {}",
                avail_idx, pending, self.num
            );
            return ax_err!(InvalidData, "avail index out of range");
        }
        Ok(pending)
    }

    /// The head of the next available chain, without consuming it.
    pub fn peek_avail(&self, mem: &dyn GuestMemory) -> AxResult<Option<u16>> {
        if self.outstanding(mem)? == 0 {
            return Ok(None);
        }
        let slot = (self.current_avail % self.num) as usize;
        let head = mem.read_u16(self.layout.avail + 4 + 2 * slot)?;
        if head >= self.num {
            return ax_err!(InvalidData, "avail ring entry out of range");
        }
        Ok(Some(head))
    }

    /// Takes the head of the next available chain.
    ///
    /// An out of range head is skipped and reported as `InvalidData`.
    pub fn pop_avail(&mut self, mem: &dyn GuestMemory) -> AxResult<Option<u16>> {
        match self.peek_avail(mem) {
            Ok(Some(head)) => {
                self.current_avail = self.current_avail.wrapping_add(1);
                Ok(Some(head))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                if self.outstanding(mem).map_or(false, |n| n > 0) {
                    self.current_avail = self.current_avail.wrapping_add(1);
                }
                Err(e)
            }
        }
    }

    /// Like [`Ring::peek_avail`], but drops out of range entries in front of
    /// the next valid head. Fails only if the avail index itself is corrupt.
    pub fn peek_valid_avail(&mut self, mem: &dyn GuestMemory) -> AxResult<Option<u16>> {
        loop {
            match self.peek_avail(mem) {
                Err(e) => {
                    if self.outstanding(mem)? == 0 {
                        return Err(e);
                    }
                    warn!("dropping avail entry {}: {:?}", self.current_avail, e);
                    self.current_avail = self.current_avail.wrapping_add(1);
                }
                other => return other,
            }
        }
    }

    /// Takes the head of the next valid available chain.
    pub fn next_avail(&mut self, mem: &dyn GuestMemory) -> AxResult<Option<u16>> {
        let head = self.peek_valid_avail(mem)?;
        if head.is_some() {
            self.current_avail = self.current_avail.wrapping_add(1);
        }
        Ok(head)
    }

    /// Iterates the descriptor chain starting at `head`.
    pub fn chain<'a>(&self, mem: &'a dyn GuestMemory, head: u16) -> DescChain<'a> {
        DescChain {
            mem,
            table: self.layout.desc,
            num: self.num,
            next: Some(head),
            hops: 0,
        }
    }

    /// Gathers the device-readable buffers of a chain into `buf`.
    ///
    /// Stops at the first writable descriptor. Returns the number of bytes
    /// copied, which is truncated to `buf.len()`.
    pub fn read_chain(&self, mem: &dyn GuestMemory, head: u16, buf: &mut [u8]) -> AxResult<usize> {
        let mut copied = 0;
        for desc in self.chain(mem, head) {
            let desc = desc?;
            if desc.is_write_only() {
                break;
            }
            let len = (desc.len as usize).min(buf.len() - copied);
            mem.read(desc.addr as usize, &mut buf[copied..copied + len])?;
            copied += len;
            if copied == buf.len() {
                break;
            }
        }
        Ok(copied)
    }

    /// Scatters `data` into the device-writable buffers of a chain.
    ///
    /// Returns the number of bytes written, which is less than `data.len()`
    /// if the chain is too short.
    pub fn write_chain(&self, mem: &dyn GuestMemory, head: u16, data: &[u8]) -> AxResult<usize> {
        let mut written = 0;
        for desc in self.chain(mem, head) {
            let desc = desc?;
            if !desc.is_write_only() {
                continue;
            }
            if written == data.len() {
                break;
            }
            let len = (desc.len as usize).min(data.len() - written);
            mem.write(desc.addr as usize, &data[written..written + len])?;
            written += len;
        }
        Ok(written)
    }

    /// Total size of the device-writable buffers of a chain.
    ///
    /// Every writable buffer must lie inside guest memory.
    pub fn writable_capacity(&self, mem: &dyn GuestMemory, head: u16) -> AxResult<usize> {
        let mut total = 0usize;
        for desc in self.chain(mem, head) {
            let desc = desc?;
            if desc.is_write_only() {
                mem.check_range(desc.addr as usize, desc.len as usize)?;
                total = total.saturating_add(desc.len as usize);
            }
        }
        Ok(total)
    }

    /// Returns the chain at `head` to the guest with `len` bytes written.
    ///
    /// The used element is written before `used.idx` is published.
    pub fn consumed(&mut self, mem: &dyn GuestMemory, head: u16, len: u32) -> AxResult {
        let slot = (self.current_used % self.num) as usize;
        let elem = self.layout.used + 4 + USED_ELEM_SIZE * slot;
        mem.write_u32(elem, head as u32)?;
        mem.write_u32(elem + 4, len)?;

        publish_barrier();

        let next = self.current_used.wrapping_add(1);
        mem.write_u16(self.layout.used + 2, next)?;
        self.current_used = next;
        trace!("used head={} len={} idx={}", head, len, next);
        Ok(())
    }
}

/// Orders the used element stores before the index store as observed by
/// other CPUs.
fn publish_barrier() {
    fence(Ordering::Release);
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "aarch64")] {
            aarch64_cpu::asm::barrier::dmb(aarch64_cpu::asm::barrier::ISHST);
        }
    }
}

/// Iterator over a descriptor chain.
///
/// Yields an error and ends on an out of range index, an indirect
/// descriptor, or after `num` hops.
pub struct DescChain<'a> {
    mem: &'a dyn GuestMemory,
    table: GuestPhysAddr,
    num: u16,
    next: Option<u16>,
    hops: u16,
}

impl Iterator for DescChain<'_> {
    type Item = AxResult<Descriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next.take()?;
        if index >= self.num {
            warn!("descriptor index {} out of range", index);
            return Some(ax_err!(InvalidData));
        }
        if self.hops == self.num {
            warn!("descriptor chain loops");
            return Some(ax_err!(InvalidData));
        }
        self.hops += 1;
        let desc = match Descriptor::read(self.mem, self.table + DESC_SIZE * index as usize) {
            Ok(desc) => desc,
            Err(e) => return Some(Err(e)),
        };
        if desc.flags.contains(DescFlags::INDIRECT) {
            warn!("indirect descriptors are not supported");
            return Some(ax_err!(InvalidData));
        }
        if desc.flags.contains(DescFlags::NEXT) {
            self.next = Some(desc.next);
        }
        Some(Ok(desc))
    }
}
