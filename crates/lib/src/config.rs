//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.willow/config.json`) and environment.
//! Every section is optional; a missing file yields the defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default idle threshold before a session is discarded or reset (5 minutes).
pub const DEFAULT_IDLE_THRESHOLD_MS: i64 = 300_000;

/// Default interval between typing reveal steps.
pub const DEFAULT_TYPING_TICK_MS: u64 = 35;

const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";

/// Phrases that end a conversation when a user message contains one of them (case-insensitive).
pub const DEFAULT_CLOSING_PHRASES: &[&str] = &[
    "bye",
    "ok bye",
    "thank you",
    "thankyou",
    "thanks",
    "see you",
    "goodbye",
    "talk later",
    "end chat",
    "end conversation",
    "that's all",
    "done",
    "finish",
    "no more",
    "that's it",
];

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Assistant backend settings.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Session lifecycle timings and closing vocabulary.
    #[serde(default)]
    pub session: SessionConfig,

    /// Where session state, transcript, and leads are persisted.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Backend endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Base URL for `/talk`, `/lead`, and `/reset`. Overridden by WILLOW_BACKEND_URL env.
    #[serde(default = "default_backend_url")]
    pub base_url: String,
}

fn default_backend_url() -> String {
    DEFAULT_BACKEND_URL.to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_url(),
        }
    }
}

/// Session timing and end-of-conversation vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Idle time after which a session is reset, and beyond which a stored snapshot is stale.
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: i64,

    /// Milliseconds between typing reveal steps.
    #[serde(default = "default_typing_tick_ms")]
    pub typing_tick_ms: u64,

    /// Closing phrases matched case-insensitively as substrings of each user message.
    #[serde(default = "default_closing_phrases")]
    pub closing_phrases: Vec<String>,
}

fn default_idle_threshold_ms() -> i64 {
    DEFAULT_IDLE_THRESHOLD_MS
}

fn default_typing_tick_ms() -> u64 {
    DEFAULT_TYPING_TICK_MS
}

fn default_closing_phrases() -> Vec<String> {
    DEFAULT_CLOSING_PHRASES.iter().map(|s| s.to_string()).collect()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_threshold_ms: default_idle_threshold_ms(),
            typing_tick_ms: default_typing_tick_ms(),
            closing_phrases: default_closing_phrases(),
        }
    }
}

/// Storage location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Override the storage directory. Relative paths are resolved against the config file's parent.
    /// Omit to use the default (`store` next to the config file).
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// Resolve the backend base URL: env WILLOW_BACKEND_URL overrides config. Trailing slashes are dropped.
pub fn resolve_backend_url(config: &Config) -> String {
    std::env::var("WILLOW_BACKEND_URL")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .unwrap_or_else(|| config.backend.base_url.trim().to_string())
        .trim_end_matches('/')
        .to_string()
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("WILLOW_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".willow").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, or the default path (or WILLOW_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used (for resolving the storage directory).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

fn config_parent(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Resolve the storage directory: `storage.directory` if set (relative paths resolved against the
/// config file's parent), otherwise the `store` subdirectory next to the config file.
pub fn resolve_storage_dir(config: &Config, config_path: &Path) -> PathBuf {
    let parent = config_parent(config_path);
    match &config.storage.directory {
        Some(d) if !d.as_os_str().is_empty() => {
            if d.is_absolute() {
                d.clone()
            } else {
                parent.join(d)
            }
        }
        _ => parent.join("store"),
    }
}

/// Create the config directory, a default `{}` config if missing, and the storage directory.
/// Returns the storage directory.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let dir = config_parent(config_path);
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating config directory {}", dir.display()))?;

    if !config_path.exists() {
        std::fs::write(config_path, b"{}")
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    }

    let (config, _) = load_config(Some(config_path.to_path_buf()))?;
    let storage = resolve_storage_dir(&config, config_path);
    if !storage.exists() {
        std::fs::create_dir_all(&storage)
            .with_context(|| format!("creating storage directory {}", storage.display()))?;
        log::info!("created storage directory at {}", storage.display());
    } else {
        log::debug!("storage directory already exists at {}, skipping", storage.display());
    }
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_timings() {
        let s = SessionConfig::default();
        assert_eq!(s.idle_threshold_ms, 300_000);
        assert_eq!(s.typing_tick_ms, 35);
        assert!(s.closing_phrases.iter().any(|p| p == "goodbye"));
        assert_eq!(BackendConfig::default().base_url, "http://localhost:8000");
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let c: Config =
            serde_json::from_str(r#"{"session":{"idleThresholdMs":1000}}"#).unwrap();
        assert_eq!(c.session.idle_threshold_ms, 1000);
        assert_eq!(c.session.typing_tick_ms, 35);
        assert_eq!(c.backend.base_url, "http://localhost:8000");
    }

    #[test]
    fn resolve_storage_dir_default() {
        let config = Config::default();
        let path = Path::new("/home/user/.willow/config.json");
        assert_eq!(
            resolve_storage_dir(&config, path),
            PathBuf::from("/home/user/.willow/store")
        );
    }

    #[test]
    fn resolve_storage_dir_override_relative() {
        let mut config = Config::default();
        config.storage.directory = Some(PathBuf::from("data/state"));
        let path = Path::new("/home/user/.willow/config.json");
        assert_eq!(
            resolve_storage_dir(&config, path),
            PathBuf::from("/home/user/.willow/data/state")
        );
    }

    #[test]
    fn resolve_storage_dir_override_absolute() {
        let mut config = Config::default();
        config.storage.directory = Some(PathBuf::from("/var/lib/willow"));
        let path = Path::new("/home/user/.willow/config.json");
        assert_eq!(
            resolve_storage_dir(&config, path),
            PathBuf::from("/var/lib/willow")
        );
    }

    #[test]
    fn init_creates_config_and_store() {
        let dir = std::env::temp_dir().join(format!("willow-init-{}", uuid::Uuid::new_v4()));
        let config_path = dir.join("config.json");
        let storage = init_config_dir(&config_path).unwrap();
        assert!(config_path.exists());
        assert_eq!(storage, dir.join("store"));
        assert!(storage.is_dir());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
