//! Session Module
//!
//! The connection/session manager: owns the link lifecycle, decodes and
//! dispatches device frames, reconciles configuration writes with device
//! acknowledgements, and republishes everything as session events.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Session                           │
//! │   (public handle — activate/deactivate, queries,         │
//! │    commands; safe to call from any thread)               │
//! └────────────────────────┬─────────────────────────────────┘
//!                          │ inputs (mpsc)
//!                          ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Machine task                        │
//! │  Transport ─bytes─▶ Codec ─messages─▶ dispatch ─▶ Bus    │
//! │        │                     │                           │
//! │     backoff              Mock Location                   │
//! │     timers                   Sink                        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`events`] - observer fan-out
//! - [`machine`] - the owner-task state machine
//! - [`pending`] - in-flight configuration requests

pub mod events;
pub mod machine;
pub mod pending;

use crate::domain::models::{SessionEvent, SettingKind, SettingValue, SettingsSnapshot, TelemetrySnapshot};
use crate::domain::prefs::PrefsStore;
use crate::infrastructure::mock_location::MockLocationSink;
use crate::protocol::FrameCodec;
use crate::transport::LinkTransport;
use machine::{Machine, SessionInput, SharedState};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

pub use machine::SessionConfig;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not connected to the device")]
    NotConnected,
    #[error("value does not fit the {0} setting")]
    InvalidValue(SettingKind),
    #[error("session terminated")]
    Terminated,
}

/// Handle to the sole long-lived session. Cloneable; the machine task stops
/// once every handle has been dropped.
#[derive(Clone)]
pub struct Session {
    inputs: mpsc::UnboundedSender<SessionInput>,
    shared: Arc<SharedState>,
    prefs: Arc<Mutex<Option<PrefsStore>>>,
}

impl Session {
    /// Build the session and spawn its owner task on the current runtime.
    ///
    /// `prefs` persists the enabled/disabled flag across restarts; pass
    /// `None` to run without persistence (tests, one-off tools).
    pub fn spawn(
        config: SessionConfig,
        transport: Box<dyn LinkTransport>,
        codec: Box<dyn FrameCodec>,
        sink: Box<dyn MockLocationSink>,
        prefs: Option<PrefsStore>,
    ) -> Self {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SharedState::default());
        let machine = Machine::new(config, transport, codec, sink, inputs_rx, Arc::clone(&shared));
        tokio::spawn(machine.run());
        Self {
            inputs: inputs_tx,
            shared,
            prefs: Arc::new(Mutex::new(prefs)),
        }
    }

    /// Start the session. Idempotent: activating an active session is a
    /// no-op. Persists the enabled flag for restart collaborators.
    pub fn activate(&self) {
        self.persist_enabled(true);
        let _ = self.inputs.send(SessionInput::Activate);
    }

    /// Stop the session, releasing the link and cancelling pending requests
    /// and timers. Idempotent.
    pub fn deactivate(&self) {
        self.persist_enabled(false);
        let _ = self.inputs.send(SessionInput::Deactivate);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Last-known telemetry, retained across link drops.
    pub fn last_telemetry(&self) -> Option<TelemetrySnapshot> {
        self.shared.telemetry.lock().unwrap().clone()
    }

    /// Last-known device settings; fields never resolved stay unknown.
    pub fn last_settings(&self) -> SettingsSnapshot {
        self.shared.settings.lock().unwrap().clone()
    }

    /// Register an observer. Events from this point on are delivered in the
    /// machine's processing order; a slow observer only delays itself.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.inputs.send(SessionInput::Subscribe(tx));
        rx
    }

    /// Ask the device to change a setting. Resolves as soon as the request
    /// is accepted (queued for send) or rejected — never waits for the
    /// device. The ack or timeout arrives later via events.
    pub async fn request_setting_change(
        &self,
        kind: SettingKind,
        value: SettingValue,
    ) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.inputs
            .send(SessionInput::RequestSettingChange { kind, value, reply })
            .map_err(|_| SessionError::Terminated)?;
        response.await.map_err(|_| SessionError::Terminated)?
    }

    /// Re-query every device setting. No-op unless connected.
    pub fn refresh_settings(&self) {
        let _ = self.inputs.send(SessionInput::RefreshSettings);
    }

    fn persist_enabled(&self, enabled: bool) {
        if let Some(store) = self.prefs.lock().unwrap().as_mut() {
            if let Err(error) = store.set_mock_enabled(enabled) {
                warn!("failed to persist enabled flag: {error}");
            }
        }
    }
}
