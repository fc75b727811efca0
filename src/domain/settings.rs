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
    "bluewatch".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Radio and framing parameters for the watch link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    /// Characteristic we write to (the peripheral's RX)
    #[serde(default = "default_write_uuid")]
    pub write_char_uuid: String,
    /// Characteristic the peripheral notifies on (its TX)
    #[serde(default = "default_notify_uuid")]
    pub notify_char_uuid: String,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
    /// How long a connect request may go unanswered before it is abandoned
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            write_char_uuid: default_write_uuid(),
            notify_char_uuid: default_notify_uuid(),
            auto_connect: default_true(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            scan_timeout_secs: default_scan_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            chunk_size: default_chunk_size(),
            chunk_delay_ms: default_chunk_delay_ms(),
        }
    }
}

impl LinkSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }
}

fn default_service_uuid() -> String {
    "6e400001-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_write_uuid() -> String {
    "6e400002-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_notify_uuid() -> String {
    "6e400003-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_reconnect_delay_ms() -> u64 {
    2000
}
fn default_scan_timeout_secs() -> u64 {
    30
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_chunk_size() -> usize {
    140
}
fn default_chunk_delay_ms() -> u64 {
    50
}

/// Periodic weather push and the values the configured provider reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherSettings {
    #[serde(default = "default_false")]
    pub enabled: bool,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub temperature_c: f64,
    #[serde(default = "default_condition")]
    pub condition: String,
    #[serde(default = "default_symbol")]
    pub symbol: String,
}

impl Default for WeatherSettings {
    fn default() -> Self {
        Self {
            enabled: default_false(),
            interval_minutes: default_interval_minutes(),
            latitude: 0.0,
            longitude: 0.0,
            city: None,
            region: None,
            temperature_c: 0.0,
            condition: default_condition(),
            symbol: default_symbol(),
        }
    }
}

/// Push frequencies offered to the user, in minutes.
pub const WEATHER_INTERVALS: [u64; 4] = [5, 10, 30, 60];

impl WeatherSettings {
    /// Push interval snapped to the nearest offered frequency.
    pub fn interval(&self) -> Duration {
        let minutes = WEATHER_INTERVALS
            .iter()
            .copied()
            .min_by_key(|m| m.abs_diff(self.interval_minutes))
            .unwrap_or(WEATHER_INTERVALS[0]);
        Duration::from_secs(minutes * 60)
    }
}

fn default_interval_minutes() -> u64 {
    30
}
fn default_condition() -> String {
    "Clear".to_string()
}
fn default_symbol() -> String {
    "sun.max".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub link: LinkSettings,

    #[serde(default)]
    pub weather: WeatherSettings,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load from the per-user config directory.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::default_settings_path()?;
        Ok(Self::load(settings_path))
    }

    /// Load from an explicit path; a missing or unreadable file yields defaults.
    pub fn load(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    pub fn default_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = Self::app_dir(dirs::config_dir())?;
        path.push("settings.json");
        Ok(path)
    }

    /// Per-user data directory for the saved identity and recorded telemetry.
    pub fn data_dir() -> anyhow::Result<PathBuf> {
        Self::app_dir(dirs::data_dir())
    }

    fn app_dir(base: Option<PathBuf>) -> anyhow::Result<PathBuf> {
        let mut path =
            base.ok_or_else(|| anyhow::anyhow!("Could not determine user directory"))?;
        path.push("BlueWatch");
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    /// Apply `change` and write the result back, creating the file if needed.
    pub fn update(&mut self, change: impl FnOnce(&mut Settings)) -> anyhow::Result<()> {
        change(&mut self.settings);
        self.save()
    }

    fn save(&self) -> anyhow::Result<()> {
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
}
