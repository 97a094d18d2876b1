//! Runtime settings read from `bursary.json` in the data directory.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::kv::{write_text_file, StorageError};
use crate::ledger::DEFAULT_LOW_BALANCE_PERCENT;
use crate::record::validate_jurisdiction;
use crate::store::StoreOptions;

pub const CONFIG_FILE: &str = "bursary.json";
pub const DATA_DIR_ENV: &str = "BURSARY_DATA_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("config i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("failed to encode config: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BursaryConfig {
    pub jurisdiction: String,
    pub budget_total: u64,
    pub low_balance_percent: u8,
    pub reconcile_interval_secs: u64,
    pub encrypt_at_rest: bool,
    /// Relative paths resolve against the data directory.
    pub mirror_dir: Option<PathBuf>,
    pub log_filter: String,
}

impl Default for BursaryConfig {
    fn default() -> Self {
        BursaryConfig {
            jurisdiction: "BUR".to_string(),
            budget_total: 50_000_000,
            low_balance_percent: DEFAULT_LOW_BALANCE_PERCENT,
            reconcile_interval_secs: 5,
            encrypt_at_rest: false,
            mirror_dir: None,
            log_filter: "info".to_string(),
        }
    }
}

impl BursaryConfig {
    /// A missing file means defaults. So does an unparseable one, with a warning.
    /// Parsed values that fail validation are an error.
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let path = data_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(BursaryConfig::default());
        }
        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config = match serde_json::from_str::<BursaryConfig>(raw.as_str()) {
            Ok(value) => value,
            Err(err) => {
                warn!(path = %path.display(), %err, "config unreadable; using defaults");
                BursaryConfig::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, data_dir: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        let content = serde_json::to_string_pretty(self)?;
        write_text_file(data_dir.join(CONFIG_FILE).as_path(), content.as_str())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_jurisdiction(self.jurisdiction.as_str()).map_err(|err| ConfigError::Invalid {
            field: "jurisdiction",
            reason: err.to_string(),
        })?;
        if self.low_balance_percent > 100 {
            return Err(ConfigError::Invalid {
                field: "low_balance_percent",
                reason: format!("{} is above 100", self.low_balance_percent),
            });
        }
        if self.reconcile_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "reconcile_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            jurisdiction: self.jurisdiction.clone(),
            budget_total: self.budget_total,
            low_balance_percent: self.low_balance_percent,
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn mirror_path(&self, data_dir: &Path) -> Option<PathBuf> {
        let dir = self.mirror_dir.as_ref()?;
        if dir.as_os_str().is_empty() {
            return None;
        }
        Some(if dir.is_absolute() {
            dir.clone()
        } else {
            data_dir.join(dir)
        })
    }
}

/// `BURSARY_DATA_DIR`, when set and non-empty, wins over `default`.
pub fn resolve_data_dir(default: &Path) -> PathBuf {
    data_dir_from(std::env::var_os(DATA_DIR_ENV), default)
}

fn data_dir_from(value: Option<OsString>, default: &Path) -> PathBuf {
    match value {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => default.to_path_buf(),
    }
}
