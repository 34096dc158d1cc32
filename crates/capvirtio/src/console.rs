use alloc::sync::Arc;

use axerrno::{AxError, AxResult};
use capaddrspace::{AccessWidth, GuestMemory};

use crate::consts::{VIRTIO_CONSOLE_F_SIZE, VIRTIO_ID_CONSOLE};
use crate::mmio::{read_config_bytes, DeviceContext, VirtioBackend};
use crate::ring::Ring;

const RX_QUEUE: usize = 0;
const TX_QUEUE: usize = 1;
const QUEUE_SIZE: u16 = 64;

/// Bytes moved to or from the host console per call.
const CHUNK: usize = 256;

/// The host console capability.
pub trait HostConsole: Send + Sync {
    /// Reads pending input without blocking. Returns `WouldBlock` or `Ok(0)`
    /// when there is nothing to read.
    fn read(&self, buf: &mut [u8]) -> AxResult<usize>;

    fn write(&self, data: &[u8]) -> AxResult;
}

/// A virtio console passing bytes through to the host console.
///
/// Queue 0 carries input to the guest, queue 1 output from it.
pub struct Console {
    host: Arc<dyn HostConsole>,
    cols: u16,
    rows: u16,
}

impl Console {
    pub fn new(host: Arc<dyn HostConsole>) -> Self {
        Self::with_size(host, 80, 25)
    }

    pub fn with_size(host: Arc<dyn HostConsole>, cols: u16, rows: u16) -> Self {
        Self { host, cols, rows }
    }

    /// Writes every available output chain to the host console.
    fn transmit(&mut self, ctx: &mut DeviceContext<'_>) -> AxResult {
        let Some((ring, mem)) = ctx.queue(TX_QUEUE) else {
            return Ok(());
        };
        let mut consumed = false;
        let result = self.write_chains(ring, mem, &mut consumed);
        if consumed {
            ctx.signal_used()?;
        }
        result
    }

    fn write_chains(
        &self,
        ring: &mut Ring,
        mem: &dyn GuestMemory,
        consumed: &mut bool,
    ) -> AxResult {
        let mut buf = [0u8; CHUNK];
        loop {
            let head = match ring.next_avail(mem) {
                Ok(Some(head)) => head,
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!("console tx: {:?}", e);
                    return Ok(());
                }
            };
            for desc in ring.chain(mem, head) {
                let desc = match desc {
                    Ok(desc) => desc,
                    Err(e) => {
                        warn!("console tx chain {}: {:?}", head, e);
                        break;
                    }
                };
                if desc.is_write_only() {
                    continue;
                }
                let mut addr = desc.addr as usize;
                let mut left = desc.len as usize;
                while left > 0 {
                    let n = left.min(CHUNK);
                    if let Err(e) = mem.read(addr, &mut buf[..n]) {
                        warn!("console tx buffer {:#x}: {:?}", addr, e);
                        break;
                    }
                    if let Err(e) = self.host.write(&buf[..n]) {
                        warn!("host console write failed: {:?}", e);
                        break;
                    }
                    addr += n;
                    left -= n;
                }
            }
            // Nothing is written back into output chains.
            ring.consumed(mem, head, 0)?;
            *consumed = true;
        }
    }

    /// Copies pending host input into the guest's receive buffers.
    fn receive(&mut self, ctx: &mut DeviceContext<'_>) -> AxResult {
        let Some((ring, mem)) = ctx.queue(RX_QUEUE) else {
            return Ok(());
        };
        let mut delivered = false;
        let result = self.fill_chains(ring, mem, &mut delivered);
        if delivered {
            ctx.signal_used()?;
        }
        result
    }

    /// A chain is only taken once there is input for it. Chains which cannot
    /// hold any input are returned empty.
    fn fill_chains(
        &self,
        ring: &mut Ring,
        mem: &dyn GuestMemory,
        delivered: &mut bool,
    ) -> AxResult {
        let mut buf = [0u8; CHUNK];
        loop {
            let head = match ring.peek_valid_avail(mem) {
                Ok(Some(head)) => head,
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!("console rx: {:?}", e);
                    return Ok(());
                }
            };
            let room = match ring.writable_capacity(mem, head) {
                Ok(0) => {
                    warn!("console rx chain {} has no room", head);
                    0
                }
                Ok(room) => room.min(CHUNK),
                Err(e) => {
                    warn!("console rx chain {}: {:?}", head, e);
                    0
                }
            };
            if room == 0 {
                ring.next_avail(mem)?;
                ring.consumed(mem, head, 0)?;
                *delivered = true;
                continue;
            }
            let n = match self.host.read(&mut buf[..room]) {
                Ok(0) | Err(AxError::WouldBlock) => return Ok(()),
                Ok(n) => n,
                Err(e) => {
                    warn!("host console read failed: {:?}", e);
                    return Ok(());
                }
            };
            ring.next_avail(mem)?;
            let written = match ring.write_chain(mem, head, &buf[..n]) {
                Ok(written) => written,
                Err(e) => {
                    warn!("console rx chain {}: {:?}, {} bytes of input lost", head, e, n);
                    0
                }
            };
            ring.consumed(mem, head, written as u32)?;
            *delivered = true;
        }
    }
}

impl VirtioBackend for Console {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_CONSOLE
    }

    fn queue_max(&self) -> &[u16] {
        &[QUEUE_SIZE, QUEUE_SIZE]
    }

    fn host_features(&self) -> u64 {
        VIRTIO_CONSOLE_F_SIZE
    }

    fn read_config(&self, offset: usize, width: AccessWidth) -> u64 {
        let mut space = [0u8; 8];
        space[0..2].copy_from_slice(&self.cols.to_le_bytes());
        space[2..4].copy_from_slice(&self.rows.to_le_bytes());
        // max_nr_ports
        space[4..8].copy_from_slice(&1u32.to_le_bytes());
        read_config_bytes(&space, offset, width)
    }

    fn kick(&mut self, ctx: &mut DeviceContext<'_>, queue: usize) -> AxResult {
        match queue {
            TX_QUEUE => self.transmit(ctx),
            // New receive buffers, there may be input waiting for them.
            RX_QUEUE => self.receive(ctx),
            _ => {
                warn!("console: notify on unknown queue {}", queue);
                Ok(())
            }
        }
    }

    fn poll(&mut self, ctx: &mut DeviceContext<'_>) -> AxResult {
        self.receive(ctx)
    }
}
