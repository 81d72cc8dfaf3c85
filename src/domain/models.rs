//! Core value types shared across the session, protocol, and observers.

use serde::{Deserialize, Serialize};

/// Signal-strength thresholds (C/N0, dB-Hz) used to partition satellites.
pub const SNR_STRONG_DB: i32 = 35;
pub const SNR_MEDIUM_DB: i32 = 25;

/// Satellite counts partitioned by signal-strength tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatelliteCounts {
    pub strong: u32,
    pub medium: u32,
    pub weak: u32,
    pub total: u32,
}

impl SatelliteCounts {
    /// Partition per-satellite signal levels into tiers. The total is the
    /// number of reported entries, matching how the device counts satellites.
    pub fn from_signal_levels(levels: &[i32]) -> Self {
        let mut counts = Self::default();
        for &level in levels {
            counts.total += 1;
            if level >= SNR_STRONG_DB {
                counts.strong += 1;
            } else if level >= SNR_MEDIUM_DB {
                counts.medium += 1;
            } else {
                counts.weak += 1;
            }
        }
        counts
    }
}

/// Last decoded position fix plus signal quality, replaced wholesale on every
/// telemetry frame. Never partially updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: Option<f64>,
    pub speed_mps: Option<f64>,
    pub bearing_deg: Option<f64>,
    pub hdop: Option<f64>,
    pub has_fix: bool,
    pub ttff_seconds: Option<u32>,
    pub satellites: SatelliteCounts,
    /// Label of the source provider this fix is attributed to.
    pub provider: String,
    /// Capture timestamp, Unix milliseconds.
    pub captured_at_ms: i64,
}

/// The device-side configuration settings the bridge can read and change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettingKind {
    /// Access-point (WiFi AP) on/off.
    ApControl,
    /// Serial relay ("bridge") mode on/off.
    BridgeMode,
    /// GNSS receiver profile id.
    GnssProfile,
    /// GPS serial baud rate.
    BaudRate,
}

impl SettingKind {
    pub const ALL: [SettingKind; 4] = [
        SettingKind::ApControl,
        SettingKind::BridgeMode,
        SettingKind::GnssProfile,
        SettingKind::BaudRate,
    ];

    /// Whether `value` is the right shape for this setting.
    pub fn accepts(&self, value: &SettingValue) -> bool {
        match self {
            SettingKind::ApControl | SettingKind::BridgeMode => {
                matches!(value, SettingValue::Flag(_))
            }
            SettingKind::GnssProfile | SettingKind::BaudRate => {
                matches!(value, SettingValue::Number(_))
            }
        }
    }
}

impl std::fmt::Display for SettingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SettingKind::ApControl => "access point",
            SettingKind::BridgeMode => "bridge mode",
            SettingKind::GnssProfile => "GNSS profile",
            SettingKind::BaudRate => "baud rate",
        };
        f.write_str(name)
    }
}

/// A setting value on the wire: switches are flags, profile and baud-rate ids
/// are opaque numbers the session relays without interpreting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Flag(bool),
    Number(u32),
}

/// Last-known device settings. Each field is independently known or unknown;
/// `None` means never resolved, not a default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    pub ap_control: Option<bool>,
    pub bridge_mode: Option<bool>,
    pub gnss_profile: Option<u32>,
    pub baud_rate: Option<u32>,
    /// Human-readable hint for the access point (SSID), when the device
    /// reports one alongside the AP state.
    pub ap_ssid_hint: Option<String>,
}

impl SettingsSnapshot {
    /// Store a reported value. Returns true when the stored state changed
    /// (unknown becoming known counts as a change).
    pub fn apply(
        &mut self,
        kind: SettingKind,
        value: SettingValue,
        ssid_hint: Option<String>,
    ) -> bool {
        let mut changed = false;
        match (kind, value) {
            (SettingKind::ApControl, SettingValue::Flag(enabled)) => {
                changed |= self.ap_control != Some(enabled);
                self.ap_control = Some(enabled);
                if ssid_hint.is_some() && self.ap_ssid_hint != ssid_hint {
                    self.ap_ssid_hint = ssid_hint;
                    changed = true;
                }
            }
            (SettingKind::BridgeMode, SettingValue::Flag(enabled)) => {
                changed |= self.bridge_mode != Some(enabled);
                self.bridge_mode = Some(enabled);
            }
            (SettingKind::GnssProfile, SettingValue::Number(id)) => {
                changed |= self.gnss_profile != Some(id);
                self.gnss_profile = Some(id);
            }
            (SettingKind::BaudRate, SettingValue::Number(baud)) => {
                changed |= self.baud_rate != Some(baud);
                self.baud_rate = Some(baud);
            }
            // Shape mismatch: leave the field unknown rather than guessing.
            _ => {}
        }
        changed
    }
}

/// A position fix as handed to the mock-location sink. Bearing is deliberately
/// absent: the device heading is not forwarded to the host location fix.
#[derive(Debug, Clone, PartialEq)]
pub struct MockFix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f32,
    pub altitude_m: Option<f64>,
    pub speed_mps: Option<f64>,
    pub timestamp_ms: i64,
}

/// Connection lifecycle states of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

/// Events published to session observers. Delivery per observer preserves the
/// machine's processing order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectionChanged(bool),
    TelemetryUpdated(TelemetrySnapshot),
    SettingsChanged(SettingsSnapshot, Vec<SettingKind>),
    StatusMessage(StatusMessage),
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satellite_tiers_partition_by_snr() {
        let counts = SatelliteCounts::from_signal_levels(&[40, 38, 37, 36, 28, 18]);
        assert_eq!(counts.strong, 4);
        assert_eq!(counts.medium, 1);
        assert_eq!(counts.weak, 1);
        assert_eq!(counts.total, 6);
    }

    #[test]
    fn settings_apply_reports_changes() {
        let mut snapshot = SettingsSnapshot::default();
        assert!(snapshot.apply(SettingKind::BridgeMode, SettingValue::Flag(true), None));
        assert!(!snapshot.apply(SettingKind::BridgeMode, SettingValue::Flag(true), None));
        assert!(snapshot.apply(SettingKind::BridgeMode, SettingValue::Flag(false), None));
        assert_eq!(snapshot.bridge_mode, Some(false));
        // A mismatched shape must not overwrite the field.
        assert!(!snapshot.apply(SettingKind::BaudRate, SettingValue::Flag(true), None));
        assert_eq!(snapshot.baud_rate, None);
    }

    #[test]
    fn ssid_hint_update_counts_as_change() {
        let mut snapshot = SettingsSnapshot::default();
        snapshot.apply(
            SettingKind::ApControl,
            SettingValue::Flag(true),
            Some("GPS-C3".into()),
        );
        assert_eq!(snapshot.ap_ssid_hint.as_deref(), Some("GPS-C3"));
        let changed = snapshot.apply(
            SettingKind::ApControl,
            SettingValue::Flag(true),
            Some("GPS-C3-AP".into()),
        );
        assert!(changed);
    }

    #[test]
    fn setting_kind_value_shapes() {
        assert!(SettingKind::ApControl.accepts(&SettingValue::Flag(false)));
        assert!(!SettingKind::ApControl.accepts(&SettingValue::Number(3)));
        assert!(SettingKind::BaudRate.accepts(&SettingValue::Number(115_200)));
    }
}
