//! Mock Location Sink
//!
//! Seam between the session and the host's mock-location mechanism. The
//! session calls [`MockLocationSink::apply`] once per telemetry frame, in
//! frame order, from its processing step — implementations must return
//! quickly and never block on I/O.
//!
//! Last write wins; calls are serialized by the session. A rejection (for
//! example, the host's mock-location permission is not granted) is surfaced
//! to observers as a status message, never treated as a connection fault.

use crate::domain::models::MockFix;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
#[error("mock location rejected: {0}")]
pub struct SinkRejected(pub String);

pub trait MockLocationSink: Send {
    fn apply(&mut self, fix: &MockFix) -> Result<(), SinkRejected>;
}

/// Reference sink that logs each applied fix. Host integrations substitute
/// their own implementation wired to the platform location service.
#[derive(Default)]
pub struct TracingSink;

impl TracingSink {
    pub fn new() -> Self {
        Self
    }
}

impl MockLocationSink for TracingSink {
    fn apply(&mut self, fix: &MockFix) -> Result<(), SinkRejected> {
        debug!(
            "mock location lat={} lon={} accuracy={}m altitude={:?} speed={:?}",
            fix.latitude, fix.longitude, fix.accuracy_m, fix.altitude_m, fix.speed_mps
        );
        Ok(())
    }
}
