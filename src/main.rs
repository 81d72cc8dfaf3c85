use anyhow::Context;
use gnss_bridge::domain::models::SessionEvent;
use gnss_bridge::domain::prefs::PrefsStore;
use gnss_bridge::infrastructure::ble::{BleConfig, BleTransport};
use gnss_bridge::infrastructure::logging;
use gnss_bridge::infrastructure::mock_location::TracingSink;
use gnss_bridge::protocol::DeviceProfile;
use gnss_bridge::session::{Session, SessionConfig};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let store = PrefsStore::new()?;
    let prefs = store.get().clone();
    let _logging = logging::init_logger(&prefs.log_settings)?;
    info!("Starting GNSS bridge");

    let profile = DeviceProfile::from_name(&prefs.device_profile)
        .with_context(|| format!("unknown device profile {:?}", prefs.device_profile))?;
    let transport = BleTransport::new(BleConfig::from_prefs(&prefs)?);
    let session = Session::spawn(
        SessionConfig::from_prefs(&prefs),
        Box::new(transport),
        profile.codec(),
        Box::new(TracingSink::new()),
        Some(store),
    );

    let mut events = session.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::ConnectionChanged(connected) => {
                    info!(
                        "device {}",
                        if connected { "connected" } else { "disconnected" }
                    );
                }
                SessionEvent::TelemetryUpdated(telemetry) => {
                    info!(
                        "fix lat={:.6} lon={:.6} satellites={} hdop={:?}",
                        telemetry.latitude,
                        telemetry.longitude,
                        telemetry.satellites.total,
                        telemetry.hdop
                    );
                }
                SessionEvent::SettingsChanged(settings, changed) => {
                    if !changed.is_empty() {
                        info!(
                            "device settings: ap={:?} bridge={:?} profile={:?} baud={:?}",
                            settings.ap_control,
                            settings.bridge_mode,
                            settings.gnss_profile,
                            settings.baud_rate
                        );
                    }
                }
                SessionEvent::StatusMessage(status) => info!("{}", status.message),
            }
        }
    });

    session.activate();
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
