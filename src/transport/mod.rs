//! Link Transport
//!
//! Abstraction over the physical connection to the device. A transport hands
//! out one connected [`LinkHandle`] at a time; the session always releases
//! the previous handle before asking for a new one.
//!
//! The session folds every [`LinkError`] into the same reconnect path — the
//! variants exist for diagnostics, not for control flow.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error("device not found")]
    NotFound,
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("link dropped: {0}")]
    Dropped(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("adapter unavailable: {0}")]
    Adapter(String),
}

/// Inbound link traffic, delivered strictly in arrival order.
#[derive(Debug)]
pub enum LinkEvent {
    Data(Vec<u8>),
    /// Terminal: the link is gone. No further `Data` will follow.
    Lost(LinkError),
}

#[async_trait]
pub trait LinkTransport: Send {
    /// Establish a connection. Cancelling the returned future aborts the
    /// attempt and releases anything acquired so far.
    async fn connect(&mut self) -> Result<Box<dyn LinkHandle>, LinkError>;
}

#[async_trait]
pub trait LinkHandle: Send {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Next inbound event. After `Lost` has been returned the handle only
    /// ever returns `Lost` again.
    async fn recv(&mut self) -> LinkEvent;

    /// Release the link. Idempotent.
    async fn disconnect(&mut self);
}
