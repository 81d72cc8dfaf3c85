use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "gnss_bridge".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Persisted application preferences. The mock-enabled flag is what
/// boot/screen-state collaborators consult to decide whether to re-activate
/// the session after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prefs {
    /// Whether the bridge should be running. Persisted across restarts.
    pub mock_enabled: bool,

    /// Device profile the frame codec is selected by.
    #[serde(default = "default_profile")]
    pub device_profile: String,

    /// Provider label attached to telemetry snapshots.
    #[serde(default = "default_provider")]
    pub provider_label: String,

    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE link settings
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_telemetry_uuid")]
    pub ble_telemetry_char_uuid: String,
    #[serde(default = "default_command_uuid")]
    pub ble_command_char_uuid: String,
    #[serde(default = "default_device_name")]
    pub ble_device_name: String,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,

    // Session tuning
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for Prefs {
    fn default() -> Self {
        Self {
            mock_enabled: false,
            device_profile: default_profile(),
            provider_label: default_provider(),
            log_settings: LogSettings::default(),
            ble_service_uuid: default_service_uuid(),
            ble_telemetry_char_uuid: default_telemetry_uuid(),
            ble_command_char_uuid: default_command_uuid(),
            ble_device_name: default_device_name(),
            scan_timeout_ms: default_scan_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_profile() -> String {
    "gps-c3".to_string()
}
fn default_provider() -> String {
    "gps".to_string()
}
fn default_service_uuid() -> String {
    "14f0514a-e15f-4ad3-89a6-b4cb3ac86abe".to_string()
}
fn default_telemetry_uuid() -> String {
    "12c64fea-7ed9-40be-9c7e-9912a5050d23".to_string()
}
fn default_command_uuid() -> String {
    "3e4f5d6c-7b8a-9d0e-1f2a-3b4c5d6e7f8a".to_string()
}
fn default_device_name() -> String {
    "GPS-C3".to_string()
}
fn default_scan_timeout_ms() -> u64 {
    10_000
}
fn default_backoff_base_ms() -> u64 {
    3_000
}
fn default_backoff_cap_ms() -> u64 {
    60_000
}
fn default_request_timeout_ms() -> u64 {
    5_000
}

impl Prefs {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}

pub struct PrefsStore {
    prefs: Prefs,
    prefs_path: PathBuf,
}

impl PrefsStore {
    pub fn new() -> anyhow::Result<Self> {
        let prefs_path = Self::prefs_path()?;
        let prefs = Self::load_from_file(&prefs_path).unwrap_or_default();

        Ok(Self { prefs, prefs_path })
    }

    /// A store backed by an explicit path, used by tests.
    pub fn at_path(prefs_path: PathBuf) -> Self {
        let prefs = Self::load_from_file(&prefs_path).unwrap_or_default();
        Self { prefs, prefs_path }
    }

    fn prefs_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("gnss-bridge");
        fs::create_dir_all(&path)?;
        path.push("prefs.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<Prefs> {
        let contents = fs::read_to_string(path)?;
        let prefs = serde_json::from_str(&contents)?;
        Ok(prefs)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.prefs)?;
        fs::write(&self.prefs_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Prefs {
        &self.prefs
    }

    pub fn set_mock_enabled(&mut self, enabled: bool) -> anyhow::Result<()> {
        if self.prefs.mock_enabled != enabled {
            self.prefs.mock_enabled = enabled;
            self.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_flag_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");

        let mut store = PrefsStore::at_path(path.clone());
        assert!(!store.get().mock_enabled);
        store.set_mock_enabled(true).unwrap();

        let reloaded = PrefsStore::at_path(path);
        assert!(reloaded.get().mock_enabled);
        // Fields absent from the file fall back to their defaults.
        assert_eq!(reloaded.get().device_profile, "gps-c3");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = PrefsStore::at_path(dir.path().join("nope.json"));
        let prefs = store.get();
        assert!(!prefs.mock_enabled);
        assert_eq!(prefs.ble_device_name, "GPS-C3");
        assert_eq!(prefs.request_timeout_ms, 5_000);
    }
}
