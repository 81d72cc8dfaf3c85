//! End-to-end session behavior against a scripted in-memory device.
//!
//! All tests run under paused virtual time, so backoff and request-timeout
//! windows elapse deterministically.

use gnss_bridge::domain::models::{MockFix, SessionEvent, SettingKind, SettingValue};
use gnss_bridge::infrastructure::mock_location::{MockLocationSink, SinkRejected};
use gnss_bridge::protocol::DeviceProfile;
use gnss_bridge::session::{Session, SessionConfig, SessionError};
use gnss_bridge::transport::memory::{memory_link, DeviceEndpoint, DeviceLink};
use gnss_bridge::transport::LinkError;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Instant};

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_millis(800);
const REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

/// Sink that records every applied fix.
#[derive(Clone, Default)]
struct RecordingSink {
    fixes: Arc<Mutex<Vec<MockFix>>>,
}

impl MockLocationSink for RecordingSink {
    fn apply(&mut self, fix: &MockFix) -> Result<(), SinkRejected> {
        self.fixes.lock().unwrap().push(fix.clone());
        Ok(())
    }
}

fn spawn_session() -> (Session, DeviceEndpoint, RecordingSink) {
    let (transport, device) = memory_link();
    let sink = RecordingSink::default();
    let config = SessionConfig {
        backoff_base: BACKOFF_BASE,
        backoff_cap: BACKOFF_CAP,
        request_timeout: REQUEST_TIMEOUT,
        provider_label: "gps".to_string(),
    };
    let session = Session::spawn(
        config,
        Box::new(transport),
        DeviceProfile::GpsC3.codec(),
        Box::new(sink.clone()),
        None,
    );
    (session, device, sink)
}

async fn recv_command(link: &mut DeviceLink) -> Value {
    let bytes = timeout(Duration::from_secs(5), link.recv())
        .await
        .expect("timed out waiting for a command")
        .expect("link closed");
    serde_json::from_slice(&bytes[..bytes.len() - 1]).expect("command is not valid JSON")
}

/// Expect no further host command on this link.
async fn assert_no_command(link: &mut DeviceLink) {
    assert!(
        timeout(Duration::from_secs(2), link.recv()).await.is_err(),
        "unexpected command from host"
    );
}

/// Receive the refresh burst issued on connect and answer each query with a
/// baseline value.
async fn answer_refresh_burst(link: &mut DeviceLink) {
    for _ in 0..4 {
        let command = recv_command(link).await;
        assert_eq!(command["c"], "get");
        let reply = match command["k"].as_str().expect("query has a key") {
            "ap" => r#"{"t":"set","k":"ap","v":false,"ssid":"GPS-C3"}"#,
            "bridge" => r#"{"t":"set","k":"bridge","v":false}"#,
            "gnss" => r#"{"t":"set","k":"gnss","v":1}"#,
            "baud" => r#"{"t":"set","k":"baud","v":115200}"#,
            other => panic!("unexpected query key {other}"),
        };
        send_line(link, reply);
    }
}

fn send_line(link: &DeviceLink, line: &str) {
    let mut bytes = line.as_bytes().to_vec();
    bytes.push(b'\n');
    assert!(link.send(&bytes), "host released the link");
}

async fn next_event(events: &mut UnboundedReceiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event bus closed")
}

async fn next_connection_event(events: &mut UnboundedReceiver<SessionEvent>) -> bool {
    loop {
        if let SessionEvent::ConnectionChanged(connected) = next_event(events).await {
            return connected;
        }
    }
}

async fn next_telemetry_event(
    events: &mut UnboundedReceiver<SessionEvent>,
) -> gnss_bridge::TelemetrySnapshot {
    loop {
        if let SessionEvent::TelemetryUpdated(telemetry) = next_event(events).await {
            return telemetry;
        }
    }
}

async fn next_settings_event(
    events: &mut UnboundedReceiver<SessionEvent>,
) -> (gnss_bridge::SettingsSnapshot, Vec<SettingKind>) {
    loop {
        if let SessionEvent::SettingsChanged(snapshot, changed) = next_event(events).await {
            return (snapshot, changed);
        }
    }
}

async fn connect(
    session: &Session,
    device: &mut DeviceEndpoint,
    events: &mut UnboundedReceiver<SessionEvent>,
) -> DeviceLink {
    session.activate();
    let mut link = device.accept().await.expect("session gone");
    assert!(next_connection_event(events).await);
    answer_refresh_burst(&mut link).await;
    // Drain the settings events the burst produced so tests start from a
    // quiet bus.
    for _ in 0..4 {
        next_settings_event(events).await;
    }
    link
}

#[tokio::test(start_paused = true)]
async fn telemetry_snapshot_is_replaced_wholesale() {
    let (session, mut device, sink) = spawn_session();
    let mut events = session.subscribe();
    let link = connect(&session, &mut device, &mut events).await;

    send_line(
        &link,
        r#"{"t":"nav","lt":37.4219,"lg":-122.084,"alt":18.5,"hdop":0.9,"fix":1,"signals":[40,38,37,36,28,18]}"#,
    );
    let first = next_telemetry_event(&mut events).await;
    assert_eq!(first.altitude_m, Some(18.5));
    assert_eq!(first.satellites.total, 6);

    // The second frame omits altitude and signals; nothing may leak through
    // from the first snapshot.
    send_line(&link, r#"{"t":"nav","lt":37.5,"lg":-122.1,"fix":1}"#);
    let second = next_telemetry_event(&mut events).await;
    assert_eq!(second.latitude, 37.5);
    assert_eq!(second.altitude_m, None);
    assert_eq!(second.satellites.total, 0);
    assert_eq!(session.last_telemetry(), Some(second));

    // One sink call per frame, in frame order.
    let fixes = sink.fixes.lock().unwrap().clone();
    assert_eq!(fixes.len(), 2);
    assert_eq!(fixes[0].latitude, 37.4219);
    assert_eq!(fixes[1].latitude, 37.5);
    // The fix keeps the last known altitude when the device omits one.
    assert_eq!(fixes[1].altitude_m, Some(18.5));
}

#[tokio::test(start_paused = true)]
async fn connection_events_strictly_alternate() {
    let (session, mut device, _sink) = spawn_session();
    let mut events = session.subscribe();

    let link = connect(&session, &mut device, &mut events).await;
    drop(link);
    assert!(!next_connection_event(&mut events).await);

    // Reconnect succeeds after backoff.
    let mut link = device.accept().await.expect("session gone");
    assert!(next_connection_event(&mut events).await);
    answer_refresh_burst(&mut link).await;

    session.deactivate();
    assert!(!next_connection_event(&mut events).await);
    assert!(!session.is_connected());
}

#[tokio::test(start_paused = true)]
async fn setting_change_rejected_while_disconnected() {
    let (session, mut device, _sink) = spawn_session();

    // Idle: no pending request, nothing sent.
    let result = session
        .request_setting_change(SettingKind::BridgeMode, SettingValue::Flag(true))
        .await;
    assert!(matches!(result, Err(SessionError::NotConnected)));

    // Still connecting: same answer.
    session.activate();
    let result = session
        .request_setting_change(SettingKind::ApControl, SettingValue::Flag(false))
        .await;
    assert!(matches!(result, Err(SessionError::NotConnected)));

    // The device only ever sees the refresh burst after the link comes up.
    let mut link = device.accept().await.expect("session gone");
    let command = recv_command(&mut link).await;
    assert_eq!(command["c"], "get");
}

#[tokio::test(start_paused = true)]
async fn value_shape_is_validated() {
    let (session, mut device, _sink) = spawn_session();
    let mut events = session.subscribe();
    let _link = connect(&session, &mut device, &mut events).await;

    let result = session
        .request_setting_change(SettingKind::BaudRate, SettingValue::Flag(true))
        .await;
    assert!(matches!(result, Err(SessionError::InvalidValue(_))));
}

#[tokio::test(start_paused = true)]
async fn ack_resolves_request_and_triggers_one_refresh() {
    let (session, mut device, _sink) = spawn_session();
    let mut events = session.subscribe();
    let mut link = connect(&session, &mut device, &mut events).await;

    session
        .request_setting_change(SettingKind::BridgeMode, SettingValue::Flag(true))
        .await
        .expect("accepted while connected");

    let command = recv_command(&mut link).await;
    assert_eq!(command["c"], "set");
    assert_eq!(command["k"], "bridge");
    assert_eq!(command["v"], true);
    let id = command["id"].as_u64().expect("set carries an id");

    send_line(&link, &format!(r#"{{"t":"ack","id":{id},"ok":true}}"#));

    // Exactly one follow-up refresh for that kind.
    let refresh = recv_command(&mut link).await;
    assert_eq!(refresh["c"], "get");
    assert_eq!(refresh["k"], "bridge");
    send_line(&link, r#"{"t":"set","k":"bridge","v":true}"#);

    let (snapshot, changed) = next_settings_event(&mut events).await;
    assert_eq!(snapshot.bridge_mode, Some(true));
    assert_eq!(changed, vec![SettingKind::BridgeMode]);

    assert_no_command(&mut link).await;
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out_without_refresh() {
    let (session, mut device, _sink) = spawn_session();
    let mut events = session.subscribe();
    let mut link = connect(&session, &mut device, &mut events).await;

    session
        .request_setting_change(SettingKind::GnssProfile, SettingValue::Number(2))
        .await
        .expect("accepted while connected");
    let command = recv_command(&mut link).await;
    let id = command["id"].as_u64().expect("set carries an id");

    // No ack: the request is dropped at the deadline and surfaced as a
    // status message.
    loop {
        if let SessionEvent::StatusMessage(status) = next_event(&mut events).await {
            assert!(status.message.contains("no response"), "{}", status.message);
            break;
        }
    }

    // This path never issues a refresh, and a late ack is ignored. The
    // cached value stays at what the device last reported.
    send_line(&link, &format!(r#"{{"t":"ack","id":{id},"ok":true}}"#));
    assert_no_command(&mut link).await;
    assert_eq!(session.last_settings().gnss_profile, Some(1));
}

#[tokio::test(start_paused = true)]
async fn malformed_bytes_do_not_break_following_frames() {
    let (session, mut device, _sink) = spawn_session();
    let mut events = session.subscribe();
    let link = connect(&session, &mut device, &mut events).await;

    // One chunk: valid frame, garbage, valid frame.
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"{\"t\":\"nav\",\"lt\":1.0,\"lg\":2.0,\"fix\":1}\n");
    bytes.extend_from_slice(b"\x00\x9f{{{not json\n");
    bytes.extend_from_slice(b"{\"t\":\"nav\",\"lt\":3.0,\"lg\":4.0,\"fix\":1}\n");
    assert!(link.send(&bytes));

    let first = next_telemetry_event(&mut events).await;
    assert_eq!(first.latitude, 1.0);
    let second = next_telemetry_event(&mut events).await;
    assert_eq!(second.latitude, 3.0);
    assert!(session.is_connected());
}

#[tokio::test(start_paused = true)]
async fn backoff_grows_to_cap_and_resets_after_success() {
    let (session, mut device, _sink) = spawn_session();
    session.activate();

    // Consecutive failures: delays between attempts double up to the cap.
    let mut previous = Instant::now();
    let mut delays = Vec::new();
    for _ in 0..5 {
        assert!(device.refuse(LinkError::NotFound).await);
        let now = Instant::now();
        delays.push(now - previous);
        previous = now;
    }
    // First refusal happens immediately after activation; the rest follow
    // the backoff schedule.
    for pair in delays[1..].windows(2) {
        assert!(pair[1] >= pair[0], "backoff decreased: {delays:?}");
    }
    assert!(
        *delays.last().unwrap() <= BACKOFF_CAP + Duration::from_millis(50),
        "backoff exceeded the cap: {delays:?}"
    );
    assert!(delays[1] >= BACKOFF_BASE);

    // One success resets the schedule to the base delay.
    let mut link = device.accept().await.expect("session gone");
    answer_refresh_burst(&mut link).await;
    drop(link);

    let before = Instant::now();
    assert!(device.refuse(LinkError::NotFound).await);
    let retry_delay = Instant::now() - before;
    assert!(
        retry_delay < BACKOFF_BASE * 2,
        "backoff did not reset: {retry_delay:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn settings_stay_unknown_until_reported() {
    let (session, mut device, _sink) = spawn_session();
    let mut events = session.subscribe();

    let before = session.last_settings();
    assert_eq!(before.ap_control, None);
    assert_eq!(before.baud_rate, None);

    session.activate();
    let mut link = device.accept().await.expect("session gone");
    assert!(next_connection_event(&mut events).await);

    // Answer only the AP query; the other fields must stay unknown.
    for _ in 0..4 {
        let command = recv_command(&mut link).await;
        if command["k"] == "ap" {
            send_line(&link, r#"{"t":"set","k":"ap","v":true,"ssid":"GPS-C3"}"#);
        }
    }
    let (snapshot, changed) = next_settings_event(&mut events).await;
    assert_eq!(snapshot.ap_control, Some(true));
    assert_eq!(snapshot.ap_ssid_hint.as_deref(), Some("GPS-C3"));
    assert_eq!(changed, vec![SettingKind::ApControl]);
    assert_eq!(session.last_settings().bridge_mode, None);
}

#[tokio::test(start_paused = true)]
async fn drop_and_reconnect_scenario() {
    let (session, mut device, _sink) = spawn_session();
    let mut events = session.subscribe();
    let link = connect(&session, &mut device, &mut events).await;

    send_line(
        &link,
        r#"{"t":"nav","lt":37.4219,"lg":-122.084,"fix":1,"signals":[40,38,37,36,28,18]}"#,
    );
    let telemetry = next_telemetry_event(&mut events).await;
    assert_eq!(telemetry.satellites.strong, 4);
    assert_eq!(telemetry.satellites.medium, 1);
    assert_eq!(telemetry.satellites.weak, 1);
    assert_eq!(telemetry.satellites.total, 6);

    // Link drops: exactly one disconnect event, snapshot retained.
    drop(link);
    assert!(!next_connection_event(&mut events).await);
    let retained = session.last_telemetry().expect("snapshot retained");
    assert_eq!(retained.latitude, 37.4219);
    assert_eq!(retained.longitude, -122.084);

    // Reconnect: exactly one connect event, settings refreshed again.
    let mut link = device.accept().await.expect("session gone");
    assert!(next_connection_event(&mut events).await);
    let command = recv_command(&mut link).await;
    assert_eq!(command["c"], "get");
    assert_eq!(session.last_telemetry(), Some(retained));
}

#[tokio::test(start_paused = true)]
async fn rejected_sink_surfaces_status_not_disconnect() {
    struct RejectingSink;
    impl MockLocationSink for RejectingSink {
        fn apply(&mut self, _fix: &MockFix) -> Result<(), SinkRejected> {
            Err(SinkRejected("mock locations not enabled".into()))
        }
    }

    let (transport, mut device) = memory_link();
    let session = Session::spawn(
        SessionConfig {
            backoff_base: BACKOFF_BASE,
            backoff_cap: BACKOFF_CAP,
            request_timeout: REQUEST_TIMEOUT,
            provider_label: "gps".to_string(),
        },
        Box::new(transport),
        DeviceProfile::GpsC3.codec(),
        Box::new(RejectingSink),
        None,
    );
    let mut events = session.subscribe();
    let link = connect(&session, &mut device, &mut events).await;

    send_line(&link, r#"{"t":"nav","lt":1.0,"lg":2.0,"fix":1}"#);
    loop {
        match next_event(&mut events).await {
            SessionEvent::StatusMessage(status) => {
                assert!(status.message.contains("mock location"));
                break;
            }
            SessionEvent::ConnectionChanged(false) => panic!("sink rejection dropped the link"),
            _ => {}
        }
    }
    // Telemetry still flows and the session stays connected.
    assert!(session.is_connected());
    assert!(session.last_telemetry().is_some());
}
