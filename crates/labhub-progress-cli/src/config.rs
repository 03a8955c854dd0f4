//! Settings resolution for the `lh` binary.
//!
//! Database path priority:
//! 1. `--db` flag or `LABHUB_DB` (clap folds the two together)
//! 2. `db` key of the TOML file given by `--config` / `LABHUB_CONFIG`
//! 3. `./labhub.sqlite3`
//!
//! The log filter comes from `RUST_LOG`, then the file's `log_filter`,
//! then `warn`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use labhub_progress_core::ProgressError;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_DB_PATH: &str = "./labhub.sqlite3";
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Contents of the optional TOML settings file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub db: Option<PathBuf>,
    pub log_filter: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path).map_err(|err| {
            ProgressError::Configuration(format!(
                "failed to read config file {}: {err}",
                path.display()
            ))
        })?;
        Self::parse(&body).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(body: &str) -> Result<Self> {
        toml::from_str(body)
            .map_err(|err| ProgressError::Configuration(err.to_string()).into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub db: PathBuf,
    pub log_filter: String,
}

impl Settings {
    pub fn resolve(db_flag: Option<&Path>, config_path: Option<&Path>) -> Result<Self> {
        let file = match config_path {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Ok(Self::merge(db_flag, file))
    }

    fn merge(db_flag: Option<&Path>, file: FileConfig) -> Self {
        let db = db_flag
            .map(Path::to_path_buf)
            .or(file.db)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));
        let log_filter = file
            .log_filter
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
        Self { db, log_filter }
    }

    /// Installs a stderr subscriber; later calls in the same process are no-ops.
    pub fn init_tracing(&self) {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.log_filter))
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    }
}
