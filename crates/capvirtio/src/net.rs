//! A software switch connecting several virtio-net ports.
//!
//! Every packet sent on one port is flooded to every other port. A port's
//! lock is never held while another port is locked: transmitted packets are
//! staged under the sender's lock and delivered after it has been released.

use alloc::format;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;

use axerrno::AxResult;
use capaddrspace::{AccessWidth, GuestMemory};
use capvcpu::IrqLine;

use crate::consts::*;
use crate::mmio::{read_config_bytes, DeviceContext, VirtioBackend, VirtioMmio};
use crate::ring::Ring;

const RX_QUEUE: usize = 0;
const TX_QUEUE: usize = 1;
const QUEUE_SIZE: u16 = 256;

/// Largest frame accepted from a guest, header included.
pub const MAX_PACKET: usize = VIRTIO_NET_HDR_LEN + 65535;

/// Configuration of one switch port.
pub struct NetPortConfig {
    pub mac: [u8; 6],
    pub irq: IrqLine,
}

/// The backend of one switch port.
pub struct NetPort {
    index: usize,
    mac: [u8; 6],
    switch: Weak<NetSwitch>,
}

impl NetPort {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    /// Drains the transmit queue. Packets are staged here and handed to the
    /// switch once this port is unlocked.
    fn transmit(&mut self, ctx: &mut DeviceContext<'_>) -> AxResult {
        let Some((ring, mem)) = ctx.queue(TX_QUEUE) else {
            return Ok(());
        };
        let mut staged = Vec::new();
        let mut consumed = false;
        let result = self.drain(ring, mem, &mut staged, &mut consumed);
        if consumed {
            ctx.signal_used()?;
        }
        if staged.is_empty() {
            return result;
        }

        let switch = self.switch.clone();
        let from = self.index;
        ctx.defer(move || {
            if let Some(switch) = switch.upgrade() {
                for packet in staged {
                    switch.forward(from, &packet);
                }
            }
        });
        result
    }

    fn drain(
        &self,
        ring: &mut Ring,
        mem: &dyn GuestMemory,
        staged: &mut Vec<Vec<u8>>,
        consumed: &mut bool,
    ) -> AxResult {
        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            let head = match ring.next_avail(mem) {
                Ok(Some(head)) => head,
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!("port {} tx: {:?}", self.index, e);
                    return Ok(());
                }
            };
            match ring.read_chain(mem, head, &mut buf) {
                Ok(len) if len > VIRTIO_NET_HDR_LEN => {
                    staged.push(buf[VIRTIO_NET_HDR_LEN..len].to_vec());
                }
                Ok(len) => warn!("port {} tx: runt frame of {} bytes", self.index, len),
                Err(e) => warn!("port {} tx chain {}: {:?}", self.index, head, e),
            }
            ring.consumed(mem, head, 0)?;
            *consumed = true;
        }
    }

    /// Copies one packet into the next receive chain.
    fn receive(&mut self, ctx: &mut DeviceContext<'_>, packet: &[u8]) -> AxResult {
        let Some((ring, mem)) = ctx.queue(RX_QUEUE) else {
            debug!("port {}: rx queue not ready, packet dropped", self.index);
            return Ok(());
        };
        let head = match ring.next_avail(mem) {
            Ok(Some(head)) => head,
            Ok(None) => {
                debug!("port {}: no rx buffers, packet dropped", self.index);
                return Ok(());
            }
            Err(e) => {
                warn!("port {} rx: {:?}, packet dropped", self.index, e);
                return Ok(());
            }
        };
        let written = match deliver(ring, mem, head, packet) {
            Ok(written) => written,
            Err(e) => {
                warn!("port {} rx chain {}: {:?}, packet dropped", self.index, head, e);
                ring.consumed(mem, head, 0)?;
                return ctx.signal_used();
            }
        };
        if written < VIRTIO_NET_HDR_LEN + packet.len() {
            warn!(
                "port {}: packet of {} bytes truncated to {}",
                self.index,
                packet.len(),
                written.saturating_sub(VIRTIO_NET_HDR_LEN)
            );
        }
        ring.consumed(mem, head, written as u32)?;
        ctx.signal_used()
    }
}

fn deliver(
    ring: &Ring,
    mem: &dyn GuestMemory,
    head: u16,
    packet: &[u8],
) -> AxResult<usize> {
    let mut frame = Vec::with_capacity(VIRTIO_NET_HDR_LEN + packet.len());
    frame.resize(VIRTIO_NET_HDR_LEN, 0);
    frame.extend_from_slice(packet);
    ring.write_chain(mem, head, &frame)
}

impl VirtioBackend for NetPort {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_NET
    }

    fn queue_max(&self) -> &[u16] {
        &[QUEUE_SIZE, QUEUE_SIZE]
    }

    fn host_features(&self) -> u64 {
        VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS
    }

    fn read_config(&self, offset: usize, width: AccessWidth) -> u64 {
        let mut space = [0u8; 8];
        space[..6].copy_from_slice(&self.mac);
        space[6..8].copy_from_slice(&VIRTIO_NET_S_LINK_UP.to_le_bytes());
        read_config_bytes(&space, offset, width)
    }

    fn kick(&mut self, ctx: &mut DeviceContext<'_>, queue: usize) -> AxResult {
        match queue {
            TX_QUEUE => self.transmit(ctx),
            // Buffers are only consumed when a packet arrives.
            RX_QUEUE => Ok(()),
            _ => {
                warn!("port {}: notify on unknown queue {}", self.index, queue);
                Ok(())
            }
        }
    }
}

/// An N-port switch whose ports are virtio-net devices.
pub struct NetSwitch {
    ports: Vec<Arc<VirtioMmio<NetPort>>>,
}

impl NetSwitch {
    pub fn new(name: &str, mem: Arc<dyn GuestMemory>, ports: Vec<NetPortConfig>) -> Arc<Self> {
        Arc::new_cyclic(|switch| NetSwitch {
            ports: ports
                .into_iter()
                .enumerate()
                .map(|(index, cfg)| {
                    let port = NetPort {
                        index,
                        mac: cfg.mac,
                        switch: switch.clone(),
                    };
                    Arc::new(VirtioMmio::new(
                        format!("{}.{}", name, index),
                        mem.clone(),
                        cfg.irq,
                        port,
                    ))
                })
                .collect(),
        })
    }

    pub fn ports(&self) -> &[Arc<VirtioMmio<NetPort>>] {
        &self.ports
    }

    pub fn port(&self, index: usize) -> Option<&Arc<VirtioMmio<NetPort>>> {
        self.ports.get(index)
    }

    /// Floods `packet` from port `from` to every other port.
    pub fn forward(&self, from: usize, packet: &[u8]) {
        for (index, port) in self.ports.iter().enumerate() {
            if index == from {
                continue;
            }
            if let Err(e) = port.with_device(|backend, ctx| backend.receive(ctx, packet)) {
                warn!("port {} rx: {:?}", index, e);
            }
        }
    }
}
