//! Configuration Vault – reads/writes `~/.parley/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Persisted user configuration stored in `~/.parley/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the primary chat provider.
    #[serde(default = "default_provider_url")]
    pub provider_url: String,

    /// Active model name (e.g. "llama3", "gpt-4o").
    #[serde(default = "default_model")]
    pub active_model: String,

    /// API key for the primary provider (stored as plain text – file
    /// permissions are restricted to the owner).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,

    /// Base URL of the fallback provider; empty disables fallback.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fallback_url: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fallback_model: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fallback_api_key: String,

    /// Embeddings model on the primary provider; empty disables semantic
    /// retrieval (recency-only).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub embeddings_model: String,

    /// Path to the memory database; empty means `~/.parley/memory.db`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub db_path: String,

    /// Per-call provider request deadline, in seconds.
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    /// Minimum cosine-distance budget for face recognition.
    #[serde(default = "default_recognition_threshold")]
    pub recognition_threshold: f32,

    /// Minimum face area in square pixels.
    #[serde(default = "default_min_face_area")]
    pub min_face_area: f32,

    /// Maximum head yaw in degrees before a frame is rejected.
    #[serde(default = "default_max_yaw_deg")]
    pub max_yaw_deg: f32,

    /// Minimum similarity (0–100) for approximate name resolution.
    #[serde(default = "default_name_threshold")]
    pub name_threshold: u32,

    /// Recency arm of hybrid retrieval.
    #[serde(default = "default_recency_k")]
    pub recency_k: usize,

    /// Similarity arm of hybrid retrieval.
    #[serde(default = "default_similar_m")]
    pub similar_m: usize,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn redact(key: &str) -> &'static str {
            if key.is_empty() { "<not set>" } else { "<redacted>" }
        }
        f.debug_struct("Config")
            .field("provider_url", &self.provider_url)
            .field("active_model", &self.active_model)
            .field("api_key", &redact(&self.api_key))
            .field("fallback_url", &self.fallback_url)
            .field("fallback_model", &self.fallback_model)
            .field("fallback_api_key", &redact(&self.fallback_api_key))
            .field("embeddings_model", &self.embeddings_model)
            .field("db_path", &self.db_path)
            .field("provider_timeout_secs", &self.provider_timeout_secs)
            .field("recognition_threshold", &self.recognition_threshold)
            .field("min_face_area", &self.min_face_area)
            .field("max_yaw_deg", &self.max_yaw_deg)
            .field("name_threshold", &self.name_threshold)
            .field("recency_k", &self.recency_k)
            .field("similar_m", &self.similar_m)
            .finish()
    }
}

fn default_provider_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_model() -> String {
    "llama3".to_string()
}
fn default_recognition_threshold() -> f32 {
    0.55
}
fn default_min_face_area() -> f32 {
    4500.0
}
fn default_max_yaw_deg() -> f32 {
    45.0
}
fn default_name_threshold() -> u32 {
    55
}
fn default_provider_timeout_secs() -> u64 {
    60
}
fn default_recency_k() -> usize {
    20
}
fn default_similar_m() -> usize {
    20
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider_url: default_provider_url(),
            active_model: default_model(),
            api_key: String::new(),
            fallback_url: String::new(),
            fallback_model: String::new(),
            fallback_api_key: String::new(),
            embeddings_model: String::new(),
            db_path: String::new(),
            provider_timeout_secs: default_provider_timeout_secs(),
            recognition_threshold: default_recognition_threshold(),
            min_face_area: default_min_face_area(),
            max_yaw_deg: default_max_yaw_deg(),
            name_threshold: default_name_threshold(),
            recency_k: default_recency_k(),
            similar_m: default_similar_m(),
        }
    }
}

impl Config {
    /// The resolved memory database path.
    pub fn resolved_db_path(&self) -> PathBuf {
        if self.db_path.is_empty() {
            parley_dir().join("memory.db")
        } else {
            PathBuf::from(&self.db_path)
        }
    }
}

fn parley_dir() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".parley")
}

/// Return the path to `~/.parley/config.toml`.
pub fn config_path() -> PathBuf {
    parley_dir().join("config.toml")
}

/// Build the config path relative to the given home directory.
/// Extracted for testability without mutating environment variables.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".parley").join("config.toml")
}

/// Load the config from disk. Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// Load the config from a specific path.
pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `PARLEY_*` environment variable overrides to `cfg`.
///
/// Supported variables:
///
/// | Variable | Config field |
/// |---|---|
/// | `PARLEY_PROVIDER_URL` | `provider_url` |
/// | `PARLEY_MODEL` | `active_model` |
/// | `PARLEY_API_KEY` | `api_key` |
/// | `PARLEY_DB_PATH` | `db_path` |
/// | `PARLEY_NAME_THRESHOLD` | `name_threshold` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("PARLEY_PROVIDER_URL") {
        cfg.provider_url = v;
    }
    if let Ok(v) = std::env::var("PARLEY_MODEL") {
        cfg.active_model = v;
    }
    if let Ok(v) = std::env::var("PARLEY_API_KEY") {
        cfg.api_key = v;
    }
    if let Ok(v) = std::env::var("PARLEY_DB_PATH") {
        cfg.db_path = v;
    }
    if let Ok(v) = std::env::var("PARLEY_NAME_THRESHOLD")
        && let Ok(threshold) = v.parse::<u32>()
    {
        cfg.name_threshold = threshold;
    }
}

/// Save the config to disk, creating `~/.parley/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Restrict the config directory to the owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Write the file with owner-only read/write (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
