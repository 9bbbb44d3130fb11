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
    #[serde(default = "default_true")]
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
            show_thread_ids: default_true(),
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
    "wearable_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Tunables of the transaction engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Bound on every awaited GATT completion.
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,
    /// Bound on the CONNECTING state.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    // MTU / chunking
    /// MTU assumed until the peripheral negotiates a larger one.
    #[serde(default = "default_mtu")]
    pub default_mtu: u16,

    // Reassembly
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_completed_message_history")]
    pub completed_message_history: usize,

    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            action_timeout_ms: default_action_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            auto_reconnect: default_true(),
            default_mtu: default_mtu(),
            max_message_size: default_max_message_size(),
            completed_message_history: default_completed_message_history(),
            log_settings: LogSettings::default(),
        }
    }
}

impl EngineSettings {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_action_timeout_ms() -> u64 {
    10_000
}
fn default_connect_timeout_ms() -> u64 {
    30_000
}
fn default_mtu() -> u16 {
    23
}
fn default_max_message_size() -> usize {
    1024 * 1024
}
fn default_completed_message_history() -> usize {
    16
}

pub struct SettingsService {
    settings: EngineSettings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit path, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                EngineSettings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("WearableLink");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<EngineSettings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut EngineSettings {
        &mut self.settings
    }

    pub fn set_auto_reconnect(&mut self, enable: bool) -> anyhow::Result<()> {
        self.settings.auto_reconnect = enable;
        self.save()
    }
}
