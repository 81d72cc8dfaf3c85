//! Device Wire Protocol
//!
//! Pure encode/decode of the device wire protocol into typed messages. The
//! codec holds only its reassembly buffer; all session state lives above it.
//!
//! Frame boundaries must be recoverable even when bytes arrive split across
//! reads, and a malformed frame must never corrupt decoding of the frames
//! that follow — each codec resynchronizes on the next frame delimiter.
//!
//! The wire format is a per-device contract. Each supported device model gets
//! its own [`FrameCodec`] implementation, selected by [`DeviceProfile`] when
//! the session is built, so new device variants add a codec without touching
//! the session.

pub mod gpsc3;

use crate::domain::models::{SettingKind, SettingValue};
use thiserror::Error;

pub use gpsc3::GpsC3Codec;

/// Telemetry fields as decoded off the wire. The codec de-serializes values
/// without interpreting them; tier partitioning and derived fields happen in
/// the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryFrame {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: Option<f64>,
    pub speed_mps: Option<f64>,
    pub bearing_deg: Option<f64>,
    pub hdop: Option<f64>,
    pub has_fix: bool,
    pub ttff_seconds: Option<u32>,
    /// Per-satellite signal levels (C/N0, dB-Hz).
    pub signal_levels: Vec<i32>,
}

/// Device-to-host messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Telemetry(TelemetryFrame),
    SettingsValue {
        kind: SettingKind,
        value: SettingValue,
        ssid_hint: Option<String>,
    },
    CommandAck {
        request_id: u32,
        success: bool,
    },
    StatusNotice(String),
}

/// Host-to-device commands.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    QuerySetting {
        kind: SettingKind,
        request_id: u32,
    },
    ChangeSetting {
        kind: SettingKind,
        value: SettingValue,
        request_id: u32,
    },
}

impl Command {
    pub fn request_id(&self) -> u32 {
        match self {
            Command::QuerySetting { request_id, .. } => *request_id,
            Command::ChangeSetting { request_id, .. } => *request_id,
        }
    }
}

/// Outcome of a decode step.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// One complete frame was consumed from the buffer.
    Message(Message),
    /// The buffer does not yet hold a complete frame.
    Incomplete,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame exceeds {limit} bytes without a delimiter")]
    Oversize { limit: usize },
    #[error("cannot encode command: {0}")]
    Encode(String),
}

/// Streaming frame codec for one device model.
///
/// `feed` appends transport bytes to the internal buffer; `decode` pops at
/// most one complete frame. A `ProtocolError` from `decode` means one frame
/// was dropped — the buffer has already been advanced past it, so the caller
/// can keep calling `decode` for the frames behind it.
pub trait FrameCodec: Send {
    fn feed(&mut self, bytes: &[u8]);
    fn decode(&mut self) -> Result<Decoded, ProtocolError>;
    fn encode(&self, command: &Command) -> Result<Vec<u8>, ProtocolError>;
}

/// Supported device models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceProfile {
    /// ESP32-C3 based GNSS pod ("GPS-C3").
    GpsC3,
}

impl DeviceProfile {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "gps-c3" => Some(DeviceProfile::GpsC3),
            _ => None,
        }
    }

    pub fn codec(&self) -> Box<dyn FrameCodec> {
        match self {
            DeviceProfile::GpsC3 => Box::new(GpsC3Codec::new()),
        }
    }
}
