//! Session state machine.
//!
//! A single owner task drives the link lifecycle
//! (`Idle → Connecting → Connected → Reconnecting`), dispatches decoded
//! frames, tracks in-flight configuration requests, and publishes session
//! events. All snapshot mutation happens on this task; queries read the
//! mirrored copies in [`SharedState`].

use crate::domain::models::{
    now_millis, ConnectionState, MessageSeverity, MockFix, SatelliteCounts, SessionEvent,
    SettingKind, SettingValue, SettingsSnapshot, StatusMessage, TelemetrySnapshot,
};
use crate::domain::prefs::Prefs;
use crate::infrastructure::mock_location::MockLocationSink;
use crate::protocol::{Command, Decoded, FrameCodec, Message, TelemetryFrame};
use crate::session::events::EventBus;
use crate::session::pending::{PendingTable, RequestKind};
use crate::session::SessionError;
use crate::transport::{LinkError, LinkEvent, LinkHandle, LinkTransport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

// Accuracy is derived from HDOP the way the device's companion app does it.
const DEFAULT_HDOP_FALLBACK: f64 = 1.5;
const HDOP_TO_ACCURACY_METERS: f64 = 5.0;
const MIN_ACCURACY_METERS: f32 = 3.0;
const MAX_ACCURACY_METERS: f32 = 50.0;
/// Movement below this between fixes reports speed 0 instead of jitter.
const MIN_MOVEMENT_THRESHOLD_METERS: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub request_timeout: Duration,
    pub provider_label: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(3),
            backoff_cap: Duration::from_secs(60),
            request_timeout: Duration::from_secs(5),
            provider_label: "gps".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn from_prefs(prefs: &Prefs) -> Self {
        Self {
            backoff_base: prefs.backoff_base(),
            backoff_cap: prefs.backoff_cap(),
            request_timeout: prefs.request_timeout(),
            provider_label: prefs.provider_label.clone(),
        }
    }
}

/// Inputs marshaled onto the owner task from any thread.
pub(crate) enum SessionInput {
    Activate,
    Deactivate,
    RequestSettingChange {
        kind: SettingKind,
        value: SettingValue,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    RefreshSettings,
    Subscribe(mpsc::UnboundedSender<SessionEvent>),
}

/// Snapshot mirrors written only by the machine, cloned out by queries.
#[derive(Default)]
pub(crate) struct SharedState {
    pub(crate) connected: AtomicBool,
    pub(crate) telemetry: Mutex<Option<TelemetrySnapshot>>,
    pub(crate) settings: Mutex<SettingsSnapshot>,
}

pub(crate) struct Machine {
    config: SessionConfig,
    transport: Box<dyn LinkTransport>,
    codec: Box<dyn FrameCodec>,
    sink: Box<dyn MockLocationSink>,
    inputs: mpsc::UnboundedReceiver<SessionInput>,
    bus: EventBus,
    shared: Arc<SharedState>,

    state: ConnectionState,
    link: Option<Box<dyn LinkHandle>>,
    pending: PendingTable,
    backoff: Duration,
    retries: u32,
    telemetry: Option<TelemetrySnapshot>,
    settings: SettingsSnapshot,
    /// Previous fix (lat, lon, timestamp ms) for speed derivation.
    last_fix: Option<(f64, f64, i64)>,
}

enum ConnectOutcome {
    Connected(Box<dyn LinkHandle>),
    Failed(LinkError),
    Deactivated,
    Shutdown,
}

enum Wake {
    Link(LinkEvent),
    Input(Option<SessionInput>),
    Timeout,
}

impl Machine {
    pub(crate) fn new(
        config: SessionConfig,
        transport: Box<dyn LinkTransport>,
        codec: Box<dyn FrameCodec>,
        sink: Box<dyn MockLocationSink>,
        inputs: mpsc::UnboundedReceiver<SessionInput>,
        shared: Arc<SharedState>,
    ) -> Self {
        let backoff = config.backoff_base;
        Self {
            config,
            transport,
            codec,
            sink,
            inputs,
            bus: EventBus::new(),
            shared,
            state: ConnectionState::Idle,
            link: None,
            pending: PendingTable::new(),
            backoff,
            retries: 0,
            telemetry: None,
            settings: SettingsSnapshot::default(),
            last_fix: None,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let next = match self.state {
                ConnectionState::Idle => self.run_idle().await,
                ConnectionState::Connecting => self.run_connecting().await,
                ConnectionState::Connected => self.run_connected().await,
                ConnectionState::Reconnecting => self.run_reconnecting().await,
            };
            match next {
                Some(state) => self.state = state,
                None => break,
            }
        }

        if let Some(mut link) = self.link.take() {
            link.disconnect().await;
        }
        self.pending.clear();
        info!("session machine stopped");
    }

    async fn run_idle(&mut self) -> Option<ConnectionState> {
        loop {
            match self.inputs.recv().await {
                None => return None,
                Some(SessionInput::Activate) => {
                    self.backoff = self.config.backoff_base;
                    self.retries = 0;
                    return Some(ConnectionState::Connecting);
                }
                Some(SessionInput::Deactivate) => {}
                Some(SessionInput::Subscribe(tx)) => self.bus.attach(tx),
                Some(SessionInput::RequestSettingChange { reply, .. }) => {
                    let _ = reply.send(Err(SessionError::NotConnected));
                }
                Some(SessionInput::RefreshSettings) => {}
            }
        }
    }

    async fn run_connecting(&mut self) -> Option<ConnectionState> {
        info!("connecting to device");
        let outcome = {
            let connect = self.transport.connect();
            tokio::pin!(connect);
            loop {
                tokio::select! {
                    result = &mut connect => {
                        break match result {
                            Ok(link) => ConnectOutcome::Connected(link),
                            Err(error) => ConnectOutcome::Failed(error),
                        };
                    }
                    maybe = self.inputs.recv() => match maybe {
                        None => break ConnectOutcome::Shutdown,
                        Some(SessionInput::Deactivate) => break ConnectOutcome::Deactivated,
                        Some(SessionInput::Activate) => {}
                        Some(SessionInput::Subscribe(tx)) => self.bus.attach(tx),
                        Some(SessionInput::RequestSettingChange { reply, .. }) => {
                            let _ = reply.send(Err(SessionError::NotConnected));
                        }
                        Some(SessionInput::RefreshSettings) => {}
                    },
                }
            }
        };

        match outcome {
            ConnectOutcome::Connected(link) => {
                self.link = Some(link);
                Some(ConnectionState::Connected)
            }
            ConnectOutcome::Failed(error) => {
                warn!("connect attempt failed: {error}");
                Some(ConnectionState::Reconnecting)
            }
            ConnectOutcome::Deactivated => Some(ConnectionState::Idle),
            ConnectOutcome::Shutdown => None,
        }
    }

    async fn run_connected(&mut self) -> Option<ConnectionState> {
        let Some(mut link) = self.link.take() else {
            return Some(ConnectionState::Reconnecting);
        };

        info!("link established");
        self.backoff = self.config.backoff_base;
        self.retries = 0;
        self.shared.connected.store(true, Ordering::SeqCst);
        self.bus.publish(SessionEvent::ConnectionChanged(true));

        let mut next: Option<ConnectionState> = None;
        if let Err(error) = self.send_refresh_burst(&mut link).await {
            next = Some(self.lose_link(&mut link, error).await);
        }

        while next.is_none() {
            let deadline = self.pending.next_deadline();
            let wake = {
                let timeout = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    event = link.recv() => Wake::Link(event),
                    maybe = self.inputs.recv() => Wake::Input(maybe),
                    _ = timeout => Wake::Timeout,
                }
            };

            match wake {
                Wake::Link(LinkEvent::Data(bytes)) => {
                    self.codec.feed(&bytes);
                    loop {
                        match self.codec.decode() {
                            Ok(Decoded::Message(message)) => {
                                if let Err(error) = self.dispatch(&mut link, message).await {
                                    next = Some(self.lose_link(&mut link, error).await);
                                    break;
                                }
                            }
                            Ok(Decoded::Incomplete) => break,
                            Err(error) => warn!("dropping malformed frame: {error}"),
                        }
                    }
                }
                Wake::Link(LinkEvent::Lost(error)) => {
                    next = Some(self.lose_link(&mut link, error).await);
                }
                Wake::Input(None) => {
                    link.disconnect().await;
                    self.pending.clear();
                    return None;
                }
                Wake::Input(Some(input)) => match input {
                    SessionInput::Deactivate => {
                        link.disconnect().await;
                        self.mark_disconnected();
                        next = Some(ConnectionState::Idle);
                    }
                    SessionInput::Activate => {}
                    SessionInput::Subscribe(tx) => self.bus.attach(tx),
                    SessionInput::RefreshSettings => {
                        if let Err(error) = self.send_refresh_burst(&mut link).await {
                            next = Some(self.lose_link(&mut link, error).await);
                        }
                    }
                    SessionInput::RequestSettingChange { kind, value, reply } => {
                        if !kind.accepts(&value) {
                            let _ = reply.send(Err(SessionError::InvalidValue(kind)));
                        } else {
                            let id = self.pending.insert(
                                kind,
                                RequestKind::Change,
                                Instant::now() + self.config.request_timeout,
                            );
                            // Accepted means queued for send; the outcome
                            // arrives via events.
                            let _ = reply.send(Ok(()));
                            let command = Command::ChangeSetting {
                                kind,
                                value,
                                request_id: id,
                            };
                            if let Err(error) = self.send_command(&mut link, command).await {
                                next = Some(self.lose_link(&mut link, error).await);
                            }
                        }
                    }
                },
                Wake::Timeout => self.expire_pending(),
            }
        }
        next
    }

    async fn run_reconnecting(&mut self) -> Option<ConnectionState> {
        let delay = self.backoff;
        info!(
            "retrying connection in {:.1}s (attempt {})",
            delay.as_secs_f64(),
            self.retries + 1
        );
        enum RetryWake {
            Timer,
            Input(Option<SessionInput>),
        }
        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);
        loop {
            let wake = tokio::select! {
                _ = &mut timer => RetryWake::Timer,
                maybe = self.inputs.recv() => RetryWake::Input(maybe),
            };
            match wake {
                RetryWake::Timer => {
                    self.retries += 1;
                    self.backoff = (self.backoff * 2).min(self.config.backoff_cap);
                    return Some(ConnectionState::Connecting);
                }
                RetryWake::Input(None) => return None,
                RetryWake::Input(Some(input)) => match input {
                    SessionInput::Deactivate => return Some(ConnectionState::Idle),
                    SessionInput::Activate => {}
                    SessionInput::Subscribe(tx) => self.bus.attach(tx),
                    SessionInput::RequestSettingChange { reply, .. } => {
                        let _ = reply.send(Err(SessionError::NotConnected));
                    }
                    SessionInput::RefreshSettings => {}
                },
            }
        }
    }

    /// Link-loss exit from Connected: pending requests are considered failed
    /// and cleared; telemetry and settings snapshots are retained as last
    /// known.
    async fn lose_link(
        &mut self,
        link: &mut Box<dyn LinkHandle>,
        error: LinkError,
    ) -> ConnectionState {
        warn!("link lost: {error}");
        link.disconnect().await;
        self.mark_disconnected();
        self.bus.publish(SessionEvent::StatusMessage(StatusMessage::new(
            format!("link lost: {error}"),
            MessageSeverity::Warning,
        )));
        ConnectionState::Reconnecting
    }

    fn mark_disconnected(&mut self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.bus.publish(SessionEvent::ConnectionChanged(false));
        let abandoned = self.pending.clear();
        if !abandoned.is_empty() {
            debug!("{} pending request(s) failed with the link", abandoned.len());
        }
    }

    async fn dispatch(
        &mut self,
        link: &mut Box<dyn LinkHandle>,
        message: Message,
    ) -> Result<(), LinkError> {
        match message {
            Message::Telemetry(frame) => {
                self.apply_telemetry(frame);
                Ok(())
            }
            Message::SettingsValue {
                kind,
                value,
                ssid_hint,
            } => {
                if self.pending.resolve_refresh(kind).is_some() {
                    debug!("refresh for {kind} resolved");
                }
                let changed = self.settings.apply(kind, value, ssid_hint);
                *self.shared.settings.lock().unwrap() = self.settings.clone();
                let changed_fields = if changed { vec![kind] } else { Vec::new() };
                self.bus.publish(SessionEvent::SettingsChanged(
                    self.settings.clone(),
                    changed_fields,
                ));
                Ok(())
            }
            Message::CommandAck {
                request_id,
                success,
            } => {
                let Some(request) = self.pending.resolve_by_id(request_id) else {
                    debug!("ack for unknown or superseded request {request_id}");
                    return Ok(());
                };
                if !success {
                    self.bus.publish(SessionEvent::StatusMessage(StatusMessage::new(
                        format!("device rejected {} change", request.setting),
                        MessageSeverity::Warning,
                    )));
                }
                // Reconcile with actual device state regardless of outcome.
                if request.request == RequestKind::Change {
                    self.send_refresh(link, request.setting).await?;
                }
                Ok(())
            }
            Message::StatusNotice(text) => {
                self.bus.publish(SessionEvent::StatusMessage(StatusMessage::new(
                    text,
                    MessageSeverity::Info,
                )));
                Ok(())
            }
        }
    }

    fn apply_telemetry(&mut self, frame: TelemetryFrame) {
        let captured_at_ms = now_millis();
        let satellites = SatelliteCounts::from_signal_levels(&frame.signal_levels);
        let accuracy_m = accuracy_from_hdop(frame.hdop);
        let speed_mps = self.resolve_speed(&frame, captured_at_ms);
        // The fix keeps the previous altitude when the device omits one; the
        // snapshot itself is replaced wholesale and never merges old fields.
        let fix_altitude = frame
            .altitude_m
            .filter(|a| a.is_finite())
            .or_else(|| self.telemetry.as_ref().and_then(|t| t.altitude_m));

        let snapshot = TelemetrySnapshot {
            latitude: frame.latitude,
            longitude: frame.longitude,
            altitude_m: frame.altitude_m,
            speed_mps: frame.speed_mps,
            bearing_deg: frame.bearing_deg,
            hdop: frame.hdop,
            has_fix: frame.has_fix,
            ttff_seconds: frame.ttff_seconds,
            satellites,
            provider: self.config.provider_label.clone(),
            captured_at_ms,
        };
        self.telemetry = Some(snapshot.clone());
        *self.shared.telemetry.lock().unwrap() = Some(snapshot.clone());

        let fix = MockFix {
            latitude: frame.latitude,
            longitude: frame.longitude,
            accuracy_m,
            altitude_m: fix_altitude,
            speed_mps,
            timestamp_ms: captured_at_ms,
        };
        if let Err(rejected) = self.sink.apply(&fix) {
            warn!("{rejected}");
            self.bus.publish(SessionEvent::StatusMessage(StatusMessage::new(
                rejected.to_string(),
                MessageSeverity::Warning,
            )));
        }
        self.last_fix = Some((frame.latitude, frame.longitude, captured_at_ms));

        self.bus.publish(SessionEvent::TelemetryUpdated(snapshot));
    }

    /// Device-reported speed when valid, otherwise derived from the distance
    /// to the previous fix.
    fn resolve_speed(&self, frame: &TelemetryFrame, now_ms: i64) -> Option<f64> {
        if let Some(speed) = frame.speed_mps.filter(|s| s.is_finite() && *s >= 0.0) {
            return Some(speed);
        }
        let (last_lat, last_lon, last_ms) = self.last_fix?;
        let delta_seconds = (now_ms - last_ms) as f64 / 1000.0;
        if delta_seconds <= 0.0 {
            return None;
        }
        let distance = distance_meters(last_lat, last_lon, frame.latitude, frame.longitude);
        if distance < MIN_MOVEMENT_THRESHOLD_METERS {
            return Some(0.0);
        }
        let speed = distance / delta_seconds;
        (speed.is_finite() && speed >= 0.0).then_some(speed)
    }

    async fn send_refresh_burst(&mut self, link: &mut Box<dyn LinkHandle>) -> Result<(), LinkError> {
        for kind in SettingKind::ALL {
            self.send_refresh(link, kind).await?;
        }
        Ok(())
    }

    async fn send_refresh(
        &mut self,
        link: &mut Box<dyn LinkHandle>,
        kind: SettingKind,
    ) -> Result<(), LinkError> {
        let id = self.pending.insert(
            kind,
            RequestKind::Refresh,
            Instant::now() + self.config.request_timeout,
        );
        let command = Command::QuerySetting {
            kind,
            request_id: id,
        };
        self.send_command(link, command).await
    }

    async fn send_command(
        &mut self,
        link: &mut Box<dyn LinkHandle>,
        command: Command,
    ) -> Result<(), LinkError> {
        let bytes = match self.codec.encode(&command) {
            Ok(bytes) => bytes,
            Err(error) => {
                // Nothing went on the wire; drop the request it belonged to.
                warn!("cannot encode command: {error}");
                let _ = self.pending.resolve_by_id(command.request_id());
                return Ok(());
            }
        };
        link.send(&bytes).await
    }

    fn expire_pending(&mut self) {
        for request in self.pending.expire(Instant::now()) {
            warn!("request {} for {} timed out", request.id, request.setting);
            self.bus.publish(SessionEvent::StatusMessage(StatusMessage::new(
                format!("no response from device for {} request", request.setting),
                MessageSeverity::Warning,
            )));
        }
    }
}

fn accuracy_from_hdop(hdop: Option<f64>) -> f32 {
    let hdop = hdop
        .filter(|h| h.is_finite() && *h > 0.0)
        .unwrap_or(DEFAULT_HDOP_FALLBACK);
    let accuracy = (hdop * HDOP_TO_ACCURACY_METERS) as f32;
    accuracy.clamp(MIN_ACCURACY_METERS, MAX_ACCURACY_METERS)
}

/// Great-circle distance between two coordinates, in meters.
fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}
