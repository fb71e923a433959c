//! Configuration for a simflow run root.
//!
//! Lookup order: `--config <path>`, then `$SIMFLOW_CONFIG`, then
//! `<root>/simflow.toml` if it exists, then built-in defaults. Relative paths
//! in the file resolve against `root`.

use crate::coordinator::IngestSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_ENV: &str = "SIMFLOW_CONFIG";
pub const ROOT_ENV: &str = "SIMFLOW_ROOT";
pub const CONFIG_FILE_NAME: &str = "simflow.toml";

const MAX_STALE_RUN_AFTER_HOURS: u64 = 24 * 365 * 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Paths and thresholds for one run root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Directory holding the stage directories and logs
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// DuckDB warehouse file
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Source → canonical column mapping (JSON object)
    #[serde(default)]
    pub column_map_path: Option<PathBuf>,

    /// Required canonical columns (JSON object)
    #[serde(default)]
    pub required_columns_path: Option<PathBuf>,

    /// Drop fact indexes when more processed files than this are pending
    #[serde(default = "default_index_drop_threshold")]
    pub index_drop_threshold: usize,

    /// Report running run log records older than this many hours
    #[serde(default = "default_stale_run_after_hours")]
    pub stale_run_after_hours: u64,
}

fn default_root() -> PathBuf {
    std::env::var_os(ROOT_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_index_drop_threshold() -> usize {
    50
}

fn default_stale_run_after_hours() -> u64 {
    24
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            database_path: None,
            column_map_path: None,
            required_columns_path: None,
            index_drop_threshold: default_index_drop_threshold(),
            stale_run_after_hours: default_stale_run_after_hours(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: IngestConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config for this process.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        let candidate = default_root().join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Self::load(&candidate);
        }
        Ok(Self::default())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.stale_run_after_hours == 0 {
            return Err(ConfigError::Invalid {
                field: "stale_run_after_hours",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.stale_run_after_hours > MAX_STALE_RUN_AFTER_HOURS {
            return Err(ConfigError::Invalid {
                field: "stale_run_after_hours",
                reason: format!("must be at most {}", MAX_STALE_RUN_AFTER_HOURS),
            });
        }
        Ok(())
    }

    fn under_root(&self, path: &Option<PathBuf>, default_name: &str) -> PathBuf {
        match path {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => self.root.join(p),
            None => self.root.join(default_name),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.under_root(&self.database_path, "warehouse.duckdb")
    }

    pub fn column_map_path(&self) -> PathBuf {
        self.under_root(&self.column_map_path, "column_map.json")
    }

    pub fn required_columns_path(&self) -> PathBuf {
        self.under_root(&self.required_columns_path, "required_cols.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn settings(&self) -> IngestSettings {
        IngestSettings {
            index_drop_threshold: self.index_drop_threshold,
            stale_run_after: chrono::Duration::hours(self.stale_run_after_hours as i64),
        }
    }
}
