use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Defaults read from `cli.toml`; command-line flags take precedence.
#[derive(Debug, Default)]
pub struct CliConfig {
    path: Option<PathBuf>,
    data: RawConfig,
}

impl CliConfig {
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit.or_else(default_config_path);
        let data = match path.as_ref() {
            Some(config_path) if config_path.exists() => read_file(config_path)?,
            _ => RawConfig::default(),
        };
        Ok(Self { path, data })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn page_size(&self) -> Option<u32> {
        self.data.store.page_size
    }

    pub fn max_log_file_size(&self) -> Option<u64> {
        self.data.store.max_log_file_size
    }

    pub fn compression_level(&self) -> Option<i32> {
        self.data.backup.compression_level
    }
}

fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RawConfig {
    #[serde(default)]
    store: StoreSection,
    #[serde(default)]
    backup: BackupSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct StoreSection {
    page_size: Option<u32>,
    max_log_file_size: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct BackupSection {
    compression_level: Option<i32>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read CLI config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse CLI config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("voron").join("cli.toml"))
}
