//! Bridge between a BLE GNSS pod and the host's mock-location mechanism.
//!
//! The session keeps a persistent connection to the device, decodes incoming
//! position/satellite telemetry, hands each fix to a [`MockLocationSink`],
//! caches the device-side settings, and republishes everything as
//! [`SessionEvent`]s.
//!
//! ```no_run
//! use gnss_bridge::domain::models::{SettingKind, SettingValue};
//! use gnss_bridge::infrastructure::ble::{BleConfig, BleTransport};
//! use gnss_bridge::infrastructure::mock_location::TracingSink;
//! use gnss_bridge::protocol::DeviceProfile;
//! use gnss_bridge::session::{Session, SessionConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let prefs = gnss_bridge::domain::prefs::Prefs::default();
//! let transport = BleTransport::new(BleConfig::from_prefs(&prefs)?);
//! let session = Session::spawn(
//!     SessionConfig::from_prefs(&prefs),
//!     Box::new(transport),
//!     DeviceProfile::GpsC3.codec(),
//!     Box::new(TracingSink::new()),
//!     None,
//! );
//! let mut events = session.subscribe();
//! session.activate();
//! tokio::spawn(async move { while events.recv().await.is_some() {} });
//! session
//!     .request_setting_change(SettingKind::BridgeMode, SettingValue::Flag(true))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`MockLocationSink`]: infrastructure::mock_location::MockLocationSink
//! [`SessionEvent`]: domain::models::SessionEvent

pub mod domain;
pub mod infrastructure;
pub mod protocol;
pub mod session;
pub mod transport;

pub use domain::models::{
    SessionEvent, SettingKind, SettingValue, SettingsSnapshot, TelemetrySnapshot,
};
pub use session::{Session, SessionConfig, SessionError};
