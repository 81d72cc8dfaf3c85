//! In-memory transport pair.
//!
//! [`memory_link`] returns a [`MemoryTransport`] for the session and a
//! [`DeviceEndpoint`] that scripts the device side: accept or refuse each
//! connection attempt, push frames to the host, observe what the host sent,
//! and drop the link to simulate a lost connection. Used by the session
//! property tests and handy for development without hardware.

use crate::transport::{LinkError, LinkEvent, LinkHandle, LinkTransport};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

pub fn memory_link() -> (MemoryTransport, DeviceEndpoint) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryTransport { requests: tx },
        DeviceEndpoint { requests: rx },
    )
}

struct HostLinkParts {
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
}

struct ConnectRequest {
    reply: oneshot::Sender<Result<HostLinkParts, LinkError>>,
}

pub struct MemoryTransport {
    requests: mpsc::UnboundedSender<ConnectRequest>,
}

#[async_trait]
impl LinkTransport for MemoryTransport {
    async fn connect(&mut self) -> Result<Box<dyn LinkHandle>, LinkError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(ConnectRequest { reply })
            .map_err(|_| LinkError::NotFound)?;
        match response.await {
            Ok(Ok(parts)) => Ok(Box::new(MemoryHandle {
                incoming: parts.incoming,
                outgoing: Some(parts.outgoing),
                lost: false,
            })),
            Ok(Err(error)) => Err(error),
            // Endpoint dropped the request without answering.
            Err(_) => Err(LinkError::NotFound),
        }
    }
}

struct MemoryHandle {
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    lost: bool,
}

#[async_trait]
impl LinkHandle for MemoryHandle {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        match &self.outgoing {
            Some(tx) => tx
                .send(bytes.to_vec())
                .map_err(|_| LinkError::WriteFailed("peer closed".into())),
            None => Err(LinkError::WriteFailed("link released".into())),
        }
    }

    async fn recv(&mut self) -> LinkEvent {
        if self.lost {
            return LinkEvent::Lost(LinkError::Dropped("link closed".into()));
        }
        match self.incoming.recv().await {
            Some(bytes) => LinkEvent::Data(bytes),
            None => {
                self.lost = true;
                LinkEvent::Lost(LinkError::Dropped("link closed".into()))
            }
        }
    }

    async fn disconnect(&mut self) {
        self.incoming.close();
        self.outgoing = None;
        self.lost = true;
    }
}

/// Device side of the pair.
pub struct DeviceEndpoint {
    requests: mpsc::UnboundedReceiver<ConnectRequest>,
}

impl DeviceEndpoint {
    /// Wait for the next connection attempt and accept it. Returns `None`
    /// once the transport has been dropped.
    pub async fn accept(&mut self) -> Option<DeviceLink> {
        loop {
            let request = self.requests.recv().await?;
            let (to_host, host_incoming) = mpsc::unbounded_channel();
            let (host_outgoing, from_host) = mpsc::unbounded_channel();
            let parts = HostLinkParts {
                incoming: host_incoming,
                outgoing: host_outgoing,
            };
            if request.reply.send(Ok(parts)).is_ok() {
                return Some(DeviceLink { to_host, from_host });
            }
            // Connect attempt was cancelled; wait for the next one.
        }
    }

    /// Wait for the next connection attempt and refuse it with `error`.
    /// Returns `false` once the transport has been dropped.
    pub async fn refuse(&mut self, error: LinkError) -> bool {
        match self.requests.recv().await {
            Some(request) => {
                let _ = request.reply.send(Err(error));
                true
            }
            None => false,
        }
    }
}

/// One accepted link, seen from the device. Dropping it ends the link and
/// surfaces `LinkEvent::Lost` on the host side.
pub struct DeviceLink {
    to_host: mpsc::UnboundedSender<Vec<u8>>,
    from_host: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl DeviceLink {
    /// Push raw bytes to the host. Returns `false` if the host already
    /// released the link.
    pub fn send(&self, bytes: &[u8]) -> bool {
        self.to_host.send(bytes.to_vec()).is_ok()
    }

    /// Next chunk written by the host, or `None` once the host released the
    /// link.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.from_host.recv().await
    }
}
