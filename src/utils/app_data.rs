use crate::index::types::IndexConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const APP_NAME: &str = "molsieve";
const CONFIG_FILE: &str = "config.json";
const STORES_DIR: &str = "stores";

/// Application configuration stored in the app data directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Index layout, scan and storage settings
    #[serde(default)]
    pub index: IndexConfig,

    /// Context id used when the CLI is not given one
    #[serde(default = "default_context_id")]
    pub context_id: u32,

    /// Threads for parsing load input; 0 uses the number of CPU cores
    #[serde(default = "default_parse_threads")]
    pub parse_threads: usize,
}

fn default_context_id() -> u32 {
    1
}

fn default_parse_threads() -> usize {
    0 // 0 means use CPU count
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            index: IndexConfig::default(),
            context_id: default_context_id(),
            parse_threads: default_parse_threads(),
        }
    }
}

impl AppConfig {
    /// Load config from the app data directory, or return default if not found
    pub fn load() -> Result<Self> {
        let config_path = get_config_path()?;

        if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .context("Failed to read config file")?;
            let config: AppConfig = serde_json::from_str(&content)
                .context("Failed to parse config file")?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to the app data directory
    pub fn save(&self) -> Result<()> {
        let config_path = get_config_path()?;
        let content = serde_json::to_string_pretty(self)
            .context("Failed to serialize config")?;
        fs::write(&config_path, content)
            .context("Failed to write config file")?;
        Ok(())
    }

    /// Get the effective parse thread count (resolves 0 to CPU count)
    pub fn effective_parse_threads(&self) -> usize {
        if self.parse_threads == 0 {
            num_cpus()
        } else {
            self.parse_threads
        }
    }
}

/// Get the number of CPUs available
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Get the path to the config file
pub fn get_config_path() -> Result<PathBuf> {
    let app_dir = get_app_data_dir()?;
    Ok(app_dir.join(CONFIG_FILE))
}

/// Get the application data directory
pub fn get_app_data_dir() -> Result<PathBuf> {
    let base = if cfg!(target_os = "macos") {
        dirs::home_dir()
            .map(|h| h.join("Library").join("Application Support"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
    } else {
        // Linux/Unix: use XDG_DATA_HOME or ~/.local/share
        dirs::data_dir()
    };

    let base = base.context("Could not determine app data directory")?;
    let app_dir = base.join(APP_NAME);

    fs::create_dir_all(&app_dir)?;
    Ok(app_dir)
}

/// Default directory of a named blob store
pub fn get_store_dir(name: &str) -> Result<PathBuf> {
    let stores = get_app_data_dir()?.join(STORES_DIR);
    fs::create_dir_all(&stores)?;
    Ok(stores.join(sanitize_name(name)))
}

/// Keep store names usable as a single path component
fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .take(64)
        .collect();
    if sanitized.is_empty() {
        "default".to_string()
    } else {
        sanitized
    }
}

/// List the named stores in the app data directory
pub fn list_stores() -> Result<Vec<String>> {
    let stores = get_app_data_dir()?.join(STORES_DIR);
    if !stores.exists() {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    for entry in fs::read_dir(&stores)? {
        let entry = entry?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("chem-db_1"), "chem-db_1");
        assert_eq!(sanitize_name("../../etc"), "etc");
        assert_eq!(sanitize_name("///"), "default");
    }

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.context_id, 1);
        assert_eq!(config.parse_threads, 0);
    }

    #[test]
    fn test_app_config_effective_parse_threads() {
        let mut config = AppConfig::default();

        // 0 should resolve to CPU count
        assert!(config.effective_parse_threads() >= 1);

        // Explicit value should be used as-is
        config.parse_threads = 4;
        assert_eq!(config.effective_parse_threads(), 4);
    }

    #[test]
    fn test_app_config_partial_json() {
        // Should use defaults for missing fields
        let json = r#"{"index": {"fp_bytes": 32, "chunk_words": 8}}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.index.fp_bytes, 32);
        assert_eq!(config.index.chunk_words, 8);
        assert_eq!(config.index.block_rows, IndexConfig::default().block_rows);
        assert_eq!(config.context_id, 1);
    }

    #[test]
    fn test_app_config_empty_json() {
        // Empty object should use all defaults
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.index.fp_bytes, IndexConfig::default().fp_bytes);
        assert_eq!(config.parse_threads, 0);
    }
}
