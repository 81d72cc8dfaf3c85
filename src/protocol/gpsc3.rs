//! GPS-C3 wire contract.
//!
//! The GPS-C3 pod (ESP32-C3 + GNSS receiver) emits newline-delimited UTF-8
//! JSON objects over its data characteristic and accepts the same framing on
//! its command characteristic. One object per frame, `0x0A` terminated.
//!
//! Device-to-host frames:
//!
//! ```text
//! {"t":"nav","lt":37.4219,"lg":-122.084,"alt":12.0,"spd":0.4,"hd":181.5,
//!  "hdop":0.9,"fix":1,"signals":[40,38,37,36,28,18],"ttff":23}
//! {"t":"set","k":"ap","v":true,"ssid":"GPS-C3"}
//! {"t":"ack","id":7,"ok":true}
//! {"t":"msg","text":"AP restarting"}
//! ```
//!
//! Host-to-device frames:
//!
//! ```text
//! {"c":"get","k":"baud","id":3}
//! {"c":"set","k":"bridge","v":true,"id":4}
//! ```
//!
//! Setting keys: `ap`, `bridge`, `gnss`, `baud`. Switch values are booleans
//! (the firmware also sends 0/1), profile and baud ids are plain integers.

use crate::domain::models::{SettingKind, SettingValue};
use crate::protocol::{Command, Decoded, FrameCodec, Message, ProtocolError, TelemetryFrame};
use serde::Deserialize;
use serde_json::{json, Value};

/// Frames longer than this without a delimiter are dropped wholesale; the
/// device MTU keeps real frames far below it.
const MAX_FRAME_BYTES: usize = 512;

const FRAME_DELIMITER: u8 = b'\n';

#[derive(Debug, Deserialize)]
#[serde(tag = "t")]
enum RawFrame {
    #[serde(rename = "nav")]
    Nav {
        lt: f64,
        lg: f64,
        alt: Option<f64>,
        spd: Option<f64>,
        hd: Option<f64>,
        hdop: Option<f64>,
        fix: Option<i64>,
        signals: Option<Vec<i32>>,
        ttff: Option<u32>,
    },
    #[serde(rename = "set")]
    Set {
        k: String,
        v: Value,
        ssid: Option<String>,
    },
    #[serde(rename = "ack")]
    Ack { id: u32, ok: bool },
    #[serde(rename = "msg")]
    Msg { text: String },
}

pub struct GpsC3Codec {
    buffer: Vec<u8>,
    /// Set after an oversize drop: skip everything up to the next delimiter
    /// before resuming normal decoding.
    discarding: bool,
}

impl GpsC3Codec {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            discarding: false,
        }
    }

    fn parse_line(line: &[u8]) -> Result<Message, ProtocolError> {
        let raw: RawFrame = serde_json::from_slice(line)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        match raw {
            RawFrame::Nav {
                lt,
                lg,
                alt,
                spd,
                hd,
                hdop,
                fix,
                signals,
                ttff,
            } => Ok(Message::Telemetry(TelemetryFrame {
                latitude: lt,
                longitude: lg,
                altitude_m: alt,
                speed_mps: spd,
                bearing_deg: hd,
                hdop,
                has_fix: fix == Some(1),
                ttff_seconds: ttff,
                signal_levels: signals.unwrap_or_default(),
            })),
            RawFrame::Set { k, v, ssid } => {
                let kind = setting_kind_from_key(&k)
                    .ok_or_else(|| ProtocolError::Malformed(format!("unknown setting key {k:?}")))?;
                let value = setting_value_from_json(kind, &v).ok_or_else(|| {
                    ProtocolError::Malformed(format!("bad value for setting {k:?}: {v}"))
                })?;
                Ok(Message::SettingsValue {
                    kind,
                    value,
                    ssid_hint: ssid,
                })
            }
            RawFrame::Ack { id, ok } => Ok(Message::CommandAck {
                request_id: id,
                success: ok,
            }),
            RawFrame::Msg { text } => Ok(Message::StatusNotice(text)),
        }
    }
}

impl Default for GpsC3Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec for GpsC3Codec {
    fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn decode(&mut self) -> Result<Decoded, ProtocolError> {
        loop {
            match self.buffer.iter().position(|&b| b == FRAME_DELIMITER) {
                Some(pos) => {
                    let line: Vec<u8> = self.buffer.drain(..=pos).take(pos).collect();
                    if self.discarding {
                        // Tail of an oversize frame; resume with the next one.
                        self.discarding = false;
                        continue;
                    }
                    let trimmed = trim_ascii(&line);
                    if trimmed.is_empty() {
                        continue;
                    }
                    return Self::parse_line(trimmed).map(Decoded::Message);
                }
                None => {
                    if self.buffer.len() > MAX_FRAME_BYTES {
                        self.buffer.clear();
                        self.discarding = true;
                        return Err(ProtocolError::Oversize {
                            limit: MAX_FRAME_BYTES,
                        });
                    }
                    return Ok(Decoded::Incomplete);
                }
            }
        }
    }

    fn encode(&self, command: &Command) -> Result<Vec<u8>, ProtocolError> {
        let value = match command {
            Command::QuerySetting { kind, request_id } => json!({
                "c": "get",
                "k": setting_key(*kind),
                "id": request_id,
            }),
            Command::ChangeSetting {
                kind,
                value,
                request_id,
            } => {
                if !kind.accepts(value) {
                    return Err(ProtocolError::Encode(format!(
                        "value {value:?} does not fit setting {kind}"
                    )));
                }
                json!({
                    "c": "set",
                    "k": setting_key(*kind),
                    "v": setting_value_to_json(value),
                    "id": request_id,
                })
            }
        };
        let mut bytes = serde_json::to_vec(&value)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        bytes.push(FRAME_DELIMITER);
        Ok(bytes)
    }
}

fn setting_key(kind: SettingKind) -> &'static str {
    match kind {
        SettingKind::ApControl => "ap",
        SettingKind::BridgeMode => "bridge",
        SettingKind::GnssProfile => "gnss",
        SettingKind::BaudRate => "baud",
    }
}

fn setting_kind_from_key(key: &str) -> Option<SettingKind> {
    match key {
        "ap" => Some(SettingKind::ApControl),
        "bridge" => Some(SettingKind::BridgeMode),
        "gnss" => Some(SettingKind::GnssProfile),
        "baud" => Some(SettingKind::BaudRate),
        _ => None,
    }
}

fn setting_value_from_json(kind: SettingKind, value: &Value) -> Option<SettingValue> {
    match kind {
        SettingKind::ApControl | SettingKind::BridgeMode => match value {
            Value::Bool(b) => Some(SettingValue::Flag(*b)),
            // Older firmware sends switches as 0/1.
            Value::Number(n) => n.as_i64().map(|n| SettingValue::Flag(n != 0)),
            _ => None,
        },
        SettingKind::GnssProfile | SettingKind::BaudRate => value
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(SettingValue::Number),
    }
}

fn setting_value_to_json(value: &SettingValue) -> Value {
    match value {
        SettingValue::Flag(b) => Value::Bool(*b),
        SettingValue::Number(n) => Value::from(*n),
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}
