use crate::domain::models::PeerId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

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
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

/// Proximity detection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSettings {
    /// Case-insensitive substring the advertised name must contain.
    #[serde(default = "default_target_pattern")]
    pub target_pattern: String,
    /// Samples at or above this strength (dBm) count as a hit.
    #[serde(default = "default_threshold_rssi")]
    pub threshold_rssi: i16,
    #[serde(default = "default_required_hits")]
    pub required_hits: u32,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            target_pattern: default_target_pattern(),
            threshold_rssi: default_threshold_rssi(),
            required_hits: default_required_hits(),
            session_timeout_ms: default_session_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Wait before each attempt.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// How long an attempt gets to reach the connected state.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeSettings {
    #[serde(default = "default_battery_level_uuid")]
    pub battery_level_uuid: String,
}

impl Default for AttributeSettings {
    fn default() -> Self {
        Self {
            battery_level_uuid: default_battery_level_uuid(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub presence: PresenceSettings,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    #[serde(default)]
    pub attributes: AttributeSettings,

    #[serde(default)]
    pub known_peers: Vec<PeerId>,
    #[serde(default)]
    pub last_connected_peer: Option<PeerId>,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
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
    "ridesync".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_target_pattern() -> String {
    "Hanto".to_string()
}
fn default_threshold_rssi() -> i16 {
    -55
}
fn default_required_hits() -> u32 {
    3
}
fn default_session_timeout_ms() -> u64 {
    10_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    5_000
}
fn default_settle_delay_ms() -> u64 {
    2_000
}
fn default_battery_level_uuid() -> String {
    "00002a19-0000-1000-8000-00805f9b34fb".to_string()
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load from the platform config directory.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit file. Missing or unreadable files yield defaults.
    pub fn with_path(settings_path: impl Into<PathBuf>) -> Self {
        let settings_path = settings_path.into();
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("RideSync");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Remember the peer a link was last established with.
    pub fn record_connected_peer(&mut self, peer: &PeerId) -> anyhow::Result<()> {
        if self.settings.last_connected_peer.as_ref() == Some(peer) {
            return Ok(());
        }
        self.settings.last_connected_peer = Some(peer.clone());
        if !self.settings.known_peers.contains(peer) {
            self.settings.known_peers.push(peer.clone());
        }
        self.save()
    }
}
