use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const APP_NAME: &str = "cahier";
const CONFIG_FILE: &str = "config.json";
const STORE_DIR: &str = "logs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Directory holding one `<key>.json` per log. Defaults under the data directory.
    pub store_dir: Option<PathBuf>,
    /// Snapshots kept per editing session.
    pub history_capacity: usize,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            store_dir: None,
            history_capacity: cahier::history::DEFAULT_CAPACITY,
        }
    }
}

impl CliConfig {
    /// Load configuration from the user's config directory.
    /// Returns default config if the file doesn't exist or fails to parse.
    pub fn load() -> Self {
        match Self::try_load() {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load config, using defaults");
                Self::default()
            }
        }
    }

    pub fn try_load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("reading config {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("parsing config {:?}", path))
    }

    /// Resolved store directory: the configured one, else `<data dir>/cahier/logs`.
    pub fn store_dir(&self) -> PathBuf {
        self.store_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_NAME)
                .join(STORE_DIR)
        })
    }
}

fn config_path() -> Result<PathBuf> {
    let mut path =
        config_dir().ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;
    path.push(APP_NAME);
    path.push(CONFIG_FILE);
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = CliConfig::load_from(&dir.path().join("config.json")).expect("load");
        assert_eq!(config, CliConfig::default());
        assert_eq!(config.history_capacity, 50);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "store_dir": "/tmp/logs" }"#).expect("write");
        let config = CliConfig::load_from(&path).expect("load");
        assert_eq!(config.store_dir(), PathBuf::from("/tmp/logs"));
        assert_eq!(config.history_capacity, 50);
    }

    #[test]
    fn garbage_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, "history_capacity = 3").expect("write");
        assert!(CliConfig::load_from(&path).is_err());
    }
}
