//! Application configuration.
//!
//! Resolution order, later wins:
//!   1. built-in defaults
//!   2. `<data_dir>/assistant.toml` (optional)
//!   3. `.env` file (loaded into the process environment via `dotenvy`)
//!   4. `ASSISTANT_*` environment variables

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;
use crate::vector::CollectionCategory;

/// Canonical environment keys. Use these instead of raw string literals.
pub mod env_keys {
    pub const DATA_DIR: &str = "ASSISTANT_DATA_DIR";
    pub const INFERENCE_URL: &str = "ASSISTANT_INFERENCE_URL";
    pub const PROBE_TIMEOUT_MS: &str = "ASSISTANT_PROBE_TIMEOUT_MS";
    pub const LOG_JSON: &str = "ASSISTANT_LOG_JSON";
    pub const COLLECTIONS: &str = "ASSISTANT_COLLECTIONS";
}

const CONFIG_FILE_NAME: &str = "assistant.toml";
const DEFAULT_INFERENCE_URL: &str = "http://localhost:11434";
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3000;

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    /// Base URL of the local inference backend (the startup prerequisite).
    pub inference_url: String,
    pub probe_timeout: Duration,
    /// Emit JSON log lines instead of the compact human format.
    pub log_json: bool,
    /// Vector collections to bring up, in declared order.
    pub collections: Vec<CollectionCategory>,
    /// Upper bound on waiting for a pooled SQLite connection.
    pub db_connection_timeout: Duration,
}

/// On-disk shape of `assistant.toml`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    inference_url: Option<String>,
    probe_timeout_ms: Option<u64>,
    log_json: Option<bool>,
    collections: Option<Vec<CollectionCategory>>,
    db_connection_timeout_ms: Option<u64>,
}

impl AppConfig {
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            inference_url: DEFAULT_INFERENCE_URL.into(),
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            log_json: false,
            collections: CollectionCategory::ALL.to_vec(),
            db_connection_timeout: Duration::from_secs(5),
        }
    }

    /// Load configuration from the process environment and the optional
    /// config file in the data directory.
    pub fn load() -> Result<Self, AppError> {
        // Missing .env is normal outside development.
        let _ = dotenvy::dotenv();

        let data_dir = match std::env::var(env_keys::DATA_DIR) {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => default_data_dir()?,
        };

        let mut config = Self::with_data_dir(data_dir);
        let file_path = config.data_dir.join(CONFIG_FILE_NAME);
        if file_path.exists() {
            config.apply_file(&file_path)?;
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), AppError> {
        let raw = std::fs::read_to_string(path)?;
        let file: FileConfig = toml::from_str(&raw)?;
        tracing::debug!(path = %path.display(), "Loaded config file");

        if let Some(url) = file.inference_url {
            self.inference_url = url;
        }
        if let Some(ms) = file.probe_timeout_ms {
            self.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(json) = file.log_json {
            self.log_json = json;
        }
        if let Some(collections) = file.collections {
            self.collections = dedup_in_order(collections);
        }
        if let Some(ms) = file.db_connection_timeout_ms {
            self.db_connection_timeout = Duration::from_millis(ms);
        }
        Ok(())
    }

    /// Apply `ASSISTANT_*` overrides. `lookup` is injectable so tests don't
    /// have to mutate the real process environment.
    fn apply_env<F>(&mut self, lookup: F) -> Result<(), AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(env_keys::INFERENCE_URL) {
            self.inference_url = url;
        }
        if let Some(ms) = lookup(env_keys::PROBE_TIMEOUT_MS) {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                AppError::Config(format!("{} must be an integer, got '{ms}'", env_keys::PROBE_TIMEOUT_MS))
            })?;
            self.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(flag) = lookup(env_keys::LOG_JSON) {
            self.log_json = matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(list) = lookup(env_keys::COLLECTIONS) {
            let parsed = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<CollectionCategory>()
                        .map_err(|e| AppError::Config(format!("{}: {e}", env_keys::COLLECTIONS)))
                })
                .collect::<Result<Vec<_>, _>>()?;
            self.collections = dedup_in_order(parsed);
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("assistant.db")
    }
}

fn default_data_dir() -> Result<PathBuf, AppError> {
    dirs::data_dir()
        .map(|d| d.join("assistant"))
        .ok_or_else(|| AppError::Config(format!("No platform data directory; set {}", env_keys::DATA_DIR)))
}

/// Keep the first occurrence of each category so the declared order holds.
fn dedup_in_order(list: Vec<CollectionCategory>) -> Vec<CollectionCategory> {
    let mut out = Vec::with_capacity(list.len());
    for c in list {
        if !out.contains(&c) {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::with_data_dir(PathBuf::from("/tmp/assistant"));
        assert_eq!(config.inference_url, DEFAULT_INFERENCE_URL);
        assert_eq!(config.collections, CollectionCategory::ALL.to_vec());
        assert_eq!(config.db_path(), PathBuf::from("/tmp/assistant/assistant.db"));
        assert!(!config.log_json);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"
inference_url = "http://10.0.0.5:11434"
probe_timeout_ms = 750
collections = ["tools", "documents", "tools"]
"#,
        )
        .unwrap();

        let mut config = AppConfig::with_data_dir(dir.path().to_path_buf());
        config.apply_file(&path).unwrap();

        assert_eq!(config.inference_url, "http://10.0.0.5:11434");
        assert_eq!(config.probe_timeout, Duration::from_millis(750));
        assert_eq!(
            config.collections,
            vec![CollectionCategory::Tools, CollectionCategory::Documents]
        );
    }

    #[test]
    fn test_file_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "inference_urll = \"typo\"\n").unwrap();

        let mut config = AppConfig::with_data_dir(dir.path().to_path_buf());
        let err = config.apply_file(&path).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::with_data_dir(PathBuf::from("/tmp/a"));
        config
            .apply_env(lookup_from(&[
                (env_keys::INFERENCE_URL, "http://gpu-box:11434"),
                (env_keys::LOG_JSON, "TRUE"),
                (env_keys::COLLECTIONS, "memories, conversations"),
            ]))
            .unwrap();

        assert_eq!(config.inference_url, "http://gpu-box:11434");
        assert!(config.log_json);
        assert_eq!(
            config.collections,
            vec![CollectionCategory::Memories, CollectionCategory::Conversations]
        );
    }

    #[test]
    fn test_env_rejects_bad_values() {
        let mut config = AppConfig::with_data_dir(PathBuf::from("/tmp/a"));
        let err = config
            .apply_env(lookup_from(&[(env_keys::PROBE_TIMEOUT_MS, "soon")]))
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));

        let err = config
            .apply_env(lookup_from(&[(env_keys::COLLECTIONS, "documents,images")]))
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
