use crate::domain::models::ScanMode;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
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
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
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
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "cybele".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Root of every device topic (`<topic_prefix>/<protocol>/<id>/...`)
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// Root of Home Assistant discovery topics
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            topic_prefix: default_topic_prefix(),
            discovery_prefix: default_discovery_prefix(),
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "cybele".to_string()
}
fn default_keep_alive_secs() -> u64 {
    30
}
fn default_topic_prefix() -> String {
    "cybele".to_string()
}
fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

/// Timing of the fleet's self-healing after an adapter death
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySettings {
    /// Time for the dead adapter to disappear from the bus
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_reappearance_timeout_ms")]
    pub reappearance_timeout_ms: u64,
    #[serde(default = "default_reappearance_poll_ms")]
    pub reappearance_poll_ms: u64,
}

impl RecoverySettings {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn reappearance_timeout(&self) -> Duration {
        Duration::from_millis(self.reappearance_timeout_ms)
    }

    pub fn reappearance_poll(&self) -> Duration {
        Duration::from_millis(self.reappearance_poll_ms)
    }
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            reappearance_timeout_ms: default_reappearance_timeout_ms(),
            reappearance_poll_ms: default_reappearance_poll_ms(),
        }
    }
}

fn default_grace_period_ms() -> u64 {
    2500
}
fn default_reappearance_timeout_ms() -> u64 {
    15000
}
fn default_reappearance_poll_ms() -> u64 {
    100
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrickWatchdogConfig {
    /// Milliseconds without any device event before the adapter is considered bricked
    pub timeout: u64,
    #[serde(default)]
    pub recovery_command: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TroubleshootingConfig {
    /// Milliseconds between forced discovery restarts
    #[serde(default)]
    pub scan_restart_interval: Option<u64>,
    #[serde(default)]
    pub brick_watchdog: Option<BrickWatchdogConfig>,
}

/// A service or device entry: a `type` discriminator plus type specific fields.
///
/// The whole JSON object is kept so each variant can pull its own options out of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl ComponentConfig {
    /// Merge the type field back in and deserialize into a variant's option struct
    pub fn options<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        let mut merged = self.fields.clone();
        merged.insert(
            "type".to_string(),
            serde_json::Value::String(self.kind.clone()),
        );
        serde_json::from_value(serde_json::Value::Object(merged))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DongleConfig {
    pub hci_device: String,
    #[serde(default)]
    pub mode: ScanMode,
    #[serde(default)]
    pub troubleshooting: Option<TroubleshootingConfig>,
    #[serde(default)]
    pub services: Vec<ComponentConfig>,
    #[serde(default)]
    pub devices: Vec<ComponentConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub mqtt: MqttSettings,

    // Logging Settings
    #[serde(default)]
    pub logging: LogSettings,

    #[serde(default)]
    pub recovery: RecoverySettings,

    #[serde(default)]
    pub dongles: Vec<DongleConfig>,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load settings from `path`, or from the per-user default location
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let settings_path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_settings_path()?,
        };
        let settings = Self::load_from_file(&settings_path)
            .with_context(|| format!("Failed to load config from {}", settings_path.display()))?;

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn default_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("cybele");
        path.push("config.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Settings> {
        let settings: Settings = serde_json::from_str(contents)?;
        if settings.dongles.is_empty() {
            anyhow::bail!("No dongles configured");
        }
        Ok(settings)
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}
