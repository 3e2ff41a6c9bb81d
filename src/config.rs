//! Configuration loading.
//!
//! Settings live in `settings.json` inside the data directory
//! (`VEHICLE_STORE_DIR`, default `~/.vehicle-store`). `VEHICLE_STORE_CONFIG`
//! points at a different settings file; `VEHICLE_STORE_DB` and
//! `VEHICLE_STORE_LOCK_TIMEOUT_MS` override individual values.

use crate::codec::DEFAULT_STRIP_FIELDS;
use crate::error::{Error, Result};
use crate::store::StoreOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_FILE_NAME: &str = "db.jsonl";
pub const SETTINGS_FILE_NAME: &str = "settings.json";

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;
/// Records younger than this are served without asking upstream sources.
const DEFAULT_MAX_AGE_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(alias = "dbPath")]
    pub db_path: Option<PathBuf>,
    /// `0` waits for the lock indefinitely.
    #[serde(alias = "lockTimeoutMs")]
    pub lock_timeout_ms: Option<u64>,
    #[serde(alias = "maxAgeSecs")]
    pub max_age_secs: Option<u64>,
    #[serde(alias = "stripFields")]
    pub strip_fields: Option<Vec<String>>,
}

impl Config {
    /// Load settings using the process environment.
    pub fn load() -> Result<Self> {
        Self::load_with(env_lookup)
    }

    /// Load settings from `settings_path` (or the default location) using the
    /// process environment for overrides.
    pub fn load_at(settings_path: Option<&Path>) -> Result<Self> {
        Self::load_at_with(settings_path, env_lookup)
    }

    /// Load settings with an injectable environment lookup.
    pub fn load_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::load_at_with(None, get_env)
    }

    /// Shared loader: an explicit settings path wins over `VEHICLE_STORE_CONFIG`;
    /// env overrides apply either way.
    pub fn load_at_with<F>(settings_path: Option<&Path>, get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = data_dir_from_env(&get_env);
        let settings_path = settings_path.map_or_else(
            || {
                get_env("VEHICLE_STORE_CONFIG")
                    .map_or_else(|| data_dir.join(SETTINGS_FILE_NAME), PathBuf::from)
            },
            Path::to_path_buf,
        );

        let mut config = Self::load_from_path(&settings_path)?;
        if let Some(db) = get_env("VEHICLE_STORE_DB").filter(|v| !v.trim().is_empty()) {
            config.db_path = Some(PathBuf::from(db));
        }
        if let Some(raw) = get_env("VEHICLE_STORE_LOCK_TIMEOUT_MS") {
            let ms = raw.trim().parse::<u64>().map_err(|e| {
                Error::config(format!("VEHICLE_STORE_LOCK_TIMEOUT_MS={raw:?} is not a number: {e}"))
            })?;
            config.lock_timeout_ms = Some(ms);
        }
        if config.db_path.is_none() {
            config.db_path = Some(data_dir.join(DB_FILE_NAME));
        }
        Ok(config)
    }

    /// Load settings from a specific path. A missing or blank file yields defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            Error::config(format!(
                "Failed to parse settings file {}: {e}",
                path.display()
            ))
        })?;
        Ok(config)
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        data_dir_from_env(env_lookup)
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join(DB_FILE_NAME))
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        match self.lock_timeout_ms.unwrap_or(DEFAULT_LOCK_TIMEOUT_MS) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs.unwrap_or(DEFAULT_MAX_AGE_SECS))
    }

    pub fn strip_fields(&self) -> Vec<String> {
        self.strip_fields.clone().unwrap_or_else(|| {
            DEFAULT_STRIP_FIELDS
                .iter()
                .map(ToString::to_string)
                .collect()
        })
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            lock_timeout: self.lock_timeout(),
            strip_fields: self.strip_fields(),
        }
    }
}

fn env_lookup(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

fn data_dir_from_env<F>(get_env: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    get_env("VEHICLE_STORE_DIR").map_or_else(
        || {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".vehicle-store")
        },
        PathBuf::from,
    )
}
