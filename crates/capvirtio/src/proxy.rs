//! Virtio devices living in another protection domain.
//!
//! [`ProxyDevice`] is registered in the VMM and forwards register accesses
//! over a synchronous call; queue notifications become an asynchronous
//! signal. [`ProxyServer`] is the other end, answering those calls against a
//! local [`VirtioMmio`] device.

use alloc::string::String;
use alloc::sync::Arc;

use axerrno::{ax_err_type, AxResult};
use capaddrspace::{
    AccessKind, AccessOutcome, AccessWidth, MmioAccess, MmioDevice, Stage2Mapper,
};

use crate::consts::QUEUE_NOTIFY;
use crate::mmio::{VirtioBackend, VirtioMmio};

/// Status returned for a request the server cannot decode.
pub const PROXY_EINVAL: i32 = -22;

/// A forwarded register access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProxyRequest {
    pub offset: usize,
    pub width: AccessWidth,
    pub kind: AccessKind,
}

impl ProxyRequest {
    const WRITE: u64 = 1 << 40;

    /// Packs the request into two message words: offset, width and direction
    /// in the first, the write value in the second.
    pub fn to_words(&self) -> [u64; 2] {
        let mut w0 = (self.offset as u32 as u64) | ((self.width.size() as u64) << 32);
        let mut w1 = 0;
        if let AccessKind::Write(value) = self.kind {
            w0 |= Self::WRITE;
            w1 = value;
        }
        [w0, w1]
    }

    pub fn from_words(words: [u64; 2]) -> Option<Self> {
        let width = AccessWidth::try_from(((words[0] >> 32) & 0xff) as usize).ok()?;
        let kind = if words[0] & Self::WRITE != 0 {
            AccessKind::Write(words[1] & width.mask())
        } else {
            AccessKind::Read
        };
        Some(Self {
            offset: words[0] as u32 as usize,
            width,
            kind,
        })
    }
}

/// The cross-domain call and notify transport.
pub trait ProxyTransport: Send + Sync {
    /// Sends `request` and waits for the reply. Errors are negative statuses
    /// from the remote side.
    fn call(&self, request: &ProxyRequest) -> Result<u64, i32>;

    /// Raises the remote side's notification without waiting.
    fn signal(&self) -> AxResult;
}

/// The VMM side of a proxied device.
pub struct ProxyDevice {
    name: String,
    transport: Arc<dyn ProxyTransport>,
}

impl ProxyDevice {
    pub fn new(name: impl Into<String>, transport: Arc<dyn ProxyTransport>) -> Self {
        Self {
            name: name.into(),
            transport,
        }
    }

    fn call(&self, request: &ProxyRequest) -> AxResult<u64> {
        self.transport.call(request).map_err(|status| {
            warn!(
                "{}: proxy call {:?} failed with {}",
                self.name, request, status
            );
            ax_err_type!(Io)
        })
    }
}

impl MmioDevice for ProxyDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn access(&self, access: &MmioAccess, _stage2: &dyn Stage2Mapper) -> AxResult<AccessOutcome> {
        if access.offset == QUEUE_NOTIFY && access.is_write() {
            trace!("{}: notify", self.name);
            self.transport.signal()?;
            return Ok(AccessOutcome::Completed(0));
        }
        let request = ProxyRequest {
            offset: access.offset,
            width: access.width,
            kind: access.kind,
        };
        let val = self.call(&request)?;
        Ok(AccessOutcome::Completed(match access.kind {
            AccessKind::Read => val,
            AccessKind::Write(_) => 0,
        }))
    }
}

/// The remote end of a [`ProxyDevice`].
pub struct ProxyServer<B: VirtioBackend> {
    device: Arc<VirtioMmio<B>>,
}

impl<B: VirtioBackend> ProxyServer<B> {
    pub fn new(device: Arc<VirtioMmio<B>>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Arc<VirtioMmio<B>> {
        &self.device
    }

    /// Answers one forwarded register access.
    pub fn handle_call(&self, request: &ProxyRequest) -> Result<u64, i32> {
        match request.kind {
            AccessKind::Read => Ok(self.device.read_register(request.offset, request.width)),
            AccessKind::Write(value) => self
                .device
                .write_register(request.offset, request.width, value)
                .map(|_| 0)
                .map_err(|e| {
                    warn!("proxied write {:#x} failed: {:?}", request.offset, e);
                    PROXY_EINVAL
                }),
        }
    }

    /// Answers a call received as raw message words.
    pub fn handle_words(&self, words: [u64; 2]) -> Result<u64, i32> {
        match ProxyRequest::from_words(words) {
            Some(request) => self.handle_call(&request),
            None => {
                warn!("malformed proxy request {:x?}", words);
                Err(PROXY_EINVAL)
            }
        }
    }

    /// The client signalled: kick every queue that has a ring.
    pub fn handle_signal(&self) -> AxResult {
        self.device.kick_configured()
    }
}

/// A transport which calls straight into a [`ProxyServer`] in the same
/// address space.
pub struct LocalTransport<B: VirtioBackend> {
    server: ProxyServer<B>,
}

impl<B: VirtioBackend> LocalTransport<B> {
    pub fn new(server: ProxyServer<B>) -> Self {
        Self { server }
    }
}

impl<B: VirtioBackend> ProxyTransport for LocalTransport<B> {
    fn call(&self, request: &ProxyRequest) -> Result<u64, i32> {
        self.server.handle_words(request.to_words())
    }

    fn signal(&self) -> AxResult {
        self.server.handle_signal()
    }
}
