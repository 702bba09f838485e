//! Settings storage
//!
//! Manages persistence of user preferences and application settings.

use crate::inference::{EngineKind, DEFAULT_SOCKET_PATH};
use crate::storage::{get_data_dir, StorageError};
use crate::types::GenerationParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Set to `1` or `true` to force the mock engine
pub const TEST_MODE_ENV: &str = "LOCALCHAT_TEST_MODE";
/// Overrides the helper socket path
pub const SOCKET_ENV: &str = "LOCALCHAT_SOCKET";

const ENGINE_CHOICES: &[&str] = &["auto", "mock", "library", "cli", "server", "socket"];

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Defaults applied to new conversations
    #[serde(default)]
    pub generation: GenerationParams,
    /// System prompt prepended to every request
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Directory where model files (.gguf) are stored
    pub models_directory: PathBuf,
    /// Engine choice: "auto" or one of the engine kinds
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Path override for llama-cli
    #[serde(default)]
    pub cli_path: Option<String>,
    /// Path override for llama-server
    #[serde(default)]
    pub server_path: Option<String>,
    /// Unix socket of the helper process
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Number of GPU layers to offload, overriding the detected profile
    #[serde(default)]
    pub gpu_layers: Option<u32>,
    /// Context window size, overriding the detected profile
    #[serde(default)]
    pub ctx_size: Option<u32>,
    #[serde(default = "default_readiness_timeout")]
    pub server_readiness_timeout_secs: u64,
    #[serde(default = "default_load_timeout")]
    pub load_timeout_secs: u64,
    #[serde(default = "default_save_debounce")]
    pub save_debounce_ms: u64,
    #[serde(default = "default_notification_cooldown")]
    pub notification_cooldown_secs: u64,
    /// Warm the CLI once when a model is loaded
    #[serde(default = "default_true")]
    pub preload_model: bool,
    /// Force the mock engine
    #[serde(default)]
    pub test_mode: bool,
    /// Last used model file name
    #[serde(default)]
    pub last_model: Option<String>,
}

fn default_system_prompt() -> String {
    "You are a helpful assistant running locally on the user's machine.".to_string()
}

fn default_engine() -> String {
    "auto".to_string()
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn default_readiness_timeout() -> u64 {
    12
}

fn default_load_timeout() -> u64 {
    60
}

fn default_save_debounce() -> u64 {
    500
}

fn default_notification_cooldown() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            generation: GenerationParams::default(),
            system_prompt: default_system_prompt(),
            models_directory: get_data_dir()
                .ok()
                .map(|d| d.join("models"))
                .unwrap_or_else(|| PathBuf::from("./models")),
            engine: default_engine(),
            cli_path: None,
            server_path: None,
            socket_path: default_socket_path(),
            gpu_layers: None,
            ctx_size: None,
            server_readiness_timeout_secs: default_readiness_timeout(),
            load_timeout_secs: default_load_timeout(),
            save_debounce_ms: default_save_debounce(),
            notification_cooldown_secs: default_notification_cooldown(),
            preload_model: true,
            test_mode: false,
            last_model: None,
        }
    }
}

impl AppSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges.
    pub fn validate(&mut self) {
        self.generation.validate();

        if !ENGINE_CHOICES.contains(&self.engine.to_ascii_lowercase().as_str()) {
            tracing::warn!("Unknown engine '{}', using auto", self.engine);
            self.engine = default_engine();
        }
        self.engine = self.engine.to_ascii_lowercase();

        for path in [&mut self.cli_path, &mut self.server_path] {
            if path.as_deref().is_some_and(|p| p.trim().is_empty()) {
                *path = None;
            }
        }

        if self.ctx_size == Some(0) {
            self.ctx_size = None;
        }

        self.server_readiness_timeout_secs = self.server_readiness_timeout_secs.clamp(1, 600);
        self.load_timeout_secs = self.load_timeout_secs.clamp(1, 3600);
        self.save_debounce_ms = self.save_debounce_ms.min(60_000);
    }

    /// Engine explicitly requested by the user, if any
    pub fn preferred_engine(&self) -> Option<EngineKind> {
        if self.engine == "auto" {
            return None;
        }
        self.engine.parse().ok()
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup(TEST_MODE_ENV) {
            self.test_mode = matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(value) = lookup(SOCKET_ENV).filter(|v| !v.trim().is_empty()) {
            self.socket_path = PathBuf::from(value.trim());
        }
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.server_readiness_timeout_secs)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }

    pub fn notification_cooldown(&self) -> Duration {
        Duration::from_secs(self.notification_cooldown_secs)
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk, then apply environment overrides
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> AppSettings {
    let mut settings = match get_settings_path().and_then(|p| load_settings_from(&p)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            AppSettings::default()
        }
    };
    settings.apply_env(|key| std::env::var(key).ok());
    settings
}

/// Load and validate settings from `path`
pub fn load_settings_from(path: &Path) -> Result<AppSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(AppSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: AppSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from disk");
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &AppSettings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

pub fn save_settings_to(settings: &AppSettings, path: &Path) -> Result<(), StorageError> {
    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to disk");
    Ok(())
}
