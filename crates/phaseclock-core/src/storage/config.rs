//! TOML-based application configuration.
//!
//! Stores engine tuning and host preferences:
//! - Tick interval and persistence debounce
//! - Reload policy per session type
//! - Tone backend, volume and cue overrides
//! - SQLite store location
//!
//! Configuration is stored at `~/.config/phaseclock/config.toml`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use super::data_dir;
use super::persistence::DEFAULT_DEBOUNCE_MS;
use crate::error::ConfigError;
use crate::timer::{ReloadPolicy, SessionType};
use crate::tone::{ToneBackend, ToneSpec, ToneTable};

/// Engine timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Overrides of the per-type reload policy, keyed by session type.
    #[serde(default)]
    pub reload: HashMap<String, ReloadPolicy>,
}

/// Tone configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TonesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_50")]
    pub volume: u32,
    #[serde(default)]
    pub backend: ToneBackend,
    /// Cue overrides keyed by cue id (`low`, `high`, or a phase cue).
    #[serde(default)]
    pub cues: HashMap<String, ToneSpec>,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite file; defaults to `<data_dir>/phaseclock.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Application configuration.
///
/// Serialized to/from TOML at `~/.config/phaseclock/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub tones: TonesConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_tick_interval_ms() -> u64 {
    100
}
fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}
fn default_true() -> bool {
    true
}
fn default_50() -> u32 {
    50
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            debounce_ms: default_debounce_ms(),
            reload: HashMap::new(),
        }
    }
}

impl Default for TonesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            volume: 50,
            backend: ToneBackend::default(),
            cues: HashMap::new(),
        }
    }
}

impl Config {
    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    /// Set a leaf by dot path, parsing `value` as the existing leaf's type.
    ///
    /// Map-valued sections (`engine.reload`, `tones.cues`) accept new keys.
    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let unknown = || ConfigError::UnknownKey(key.to_string());
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        if key.is_empty() {
            return Err(unknown());
        }
        let in_map = key.starts_with("engine.reload.") || key.starts_with("tones.cues.");

        let mut parts = key.split('.').peekable();
        let mut current = root;
        while let Some(part) = parts.next() {
            let is_leaf = parts.peek().is_none();
            if is_leaf {
                let obj = current.as_object_mut().ok_or_else(unknown)?;
                let new_value = match obj.get(part) {
                    Some(serde_json::Value::Bool(_)) => serde_json::Value::Bool(
                        value.parse::<bool>().map_err(|e| invalid(e.to_string()))?,
                    ),
                    Some(serde_json::Value::Number(_)) => {
                        if let Ok(n) = value.parse::<u64>() {
                            serde_json::Value::Number(n.into())
                        } else {
                            value
                                .parse::<f64>()
                                .ok()
                                .and_then(serde_json::Number::from_f64)
                                .map(serde_json::Value::Number)
                                .ok_or_else(|| {
                                    invalid(format!("cannot parse '{value}' as number"))
                                })?
                        }
                    }
                    Some(serde_json::Value::Object(_)) | Some(serde_json::Value::Array(_)) => {
                        serde_json::from_str(value).map_err(|e| invalid(e.to_string()))?
                    }
                    Some(_) => serde_json::Value::String(value.into()),
                    None if in_map => serde_json::from_str(value)
                        .unwrap_or_else(|_| serde_json::Value::String(value.into())),
                    None => return Err(unknown()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current.get_mut(part).ok_or_else(unknown)?;
        }

        Err(unknown())
    }

    fn path() -> Result<PathBuf, ConfigError> {
        let dir = data_dir().map_err(|e| ConfigError::LoadFailed {
            path: PathBuf::from("~/.config/phaseclock"),
            message: e.to_string(),
        })?;
        Ok(dir.join("config.toml"))
    }

    /// Load from disk or return default.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed,
    /// or if the default config cannot be written to disk.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::path()?;
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                toml::from_str(&content).map_err(|e| ConfigError::LoadFailed {
                    path,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                let cfg = Self::default();
                cfg.save()?;
                Ok(cfg)
            }
        }
    }

    /// Persist to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized or written to disk.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::path()?;
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::SaveFailed {
            path: path.clone(),
            message: e.to_string(),
        })?;
        std::fs::write(&path, content).map_err(|e| ConfigError::SaveFailed {
            path,
            message: e.to_string(),
        })
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a value by key in memory. Returns error if key is unknown or the
    /// value does not fit the field.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut json =
            serde_json::to_value(&*self).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        *self = serde_json::from_value(json).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    /// Set a config value by key and save.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown, the value cannot be parsed,
    /// or the config cannot be saved.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.apply(key, value)?;
        self.save()
    }

    /// Reload policy for `session_type`, honoring overrides.
    pub fn reload_policy(&self, session_type: SessionType) -> ReloadPolicy {
        self.engine
            .reload
            .get(session_type.as_str())
            .copied()
            .unwrap_or_else(|| session_type.default_reload_policy())
    }

    pub fn tone_table(&self) -> ToneTable {
        ToneTable::new(self.tones.cues.clone())
    }

    pub fn tone_backend(&self) -> ToneBackend {
        if self.tones.enabled {
            self.tones.backend
        } else {
            ToneBackend::None
        }
    }

    /// SQLite file the CLI should use.
    pub fn store_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.storage.path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::path()?.with_file_name("phaseclock.db")),
        }
    }

    /// Load from disk, returning default on error.
    /// This is a convenience method that never fails.
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }
}
