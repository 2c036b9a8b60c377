use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::AppError;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8765";
pub const LOCK_WAIT_MS: u64 = 5_000;
pub const LOCK_LEASE_MS: u64 = 10_000;
pub const CACHE_TTL_SECONDS: u64 = 300; // 5 minutes
pub const EMPTY_CACHE_TTL_SECONDS: u64 = 60;
pub const MAX_QUEUE_TRACKS: usize = 500;
pub const MAX_QUEUES_PER_USER: usize = 1;
pub const TOMBSTONE_RETENTION_DAYS: i64 = 7;
pub const LARGE_QUEUE_THRESHOLD: usize = 100;
pub const MAINTENANCE_INTERVAL_SECONDS: u64 = 3600;
pub const CONNECTION_SEND_BUFFER: usize = 64;

const CONFIG_ENV: &str = "SONAMI_SYNC_CONFIG";
const BIND_ENV: &str = "SONAMI_SYNC_BIND";
const DATABASE_ENV: &str = "SONAMI_SYNC_DATABASE";

pub fn get_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sonami")
}

pub fn get_config_file_path() -> PathBuf {
    get_config_dir().join("sync.json")
}

pub fn get_default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sonami")
        .join("library.db")
}

/// Where per-user locks and cached snapshots live.
///
/// `Memory` is enough for a single process. `Sqlite` keeps both in the shared
/// database so several instances pointed at the same file stay coordinated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coordination {
    Memory,
    Sqlite,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub coordination: Coordination,
    pub lock_wait_ms: u64,
    pub lock_lease_ms: u64,
    pub cache_ttl_secs: u64,
    pub empty_cache_ttl_secs: u64,
    pub max_queue_tracks: usize,
    pub max_queues_per_user: usize,
    pub tombstone_retention_days: i64,
    pub large_queue_threshold: usize,
    pub maintenance_interval_secs: u64,
    pub connection_send_buffer: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            database_path: get_default_database_path(),
            coordination: Coordination::Memory,
            lock_wait_ms: LOCK_WAIT_MS,
            lock_lease_ms: LOCK_LEASE_MS,
            cache_ttl_secs: CACHE_TTL_SECONDS,
            empty_cache_ttl_secs: EMPTY_CACHE_TTL_SECONDS,
            max_queue_tracks: MAX_QUEUE_TRACKS,
            max_queues_per_user: MAX_QUEUES_PER_USER,
            tombstone_retention_days: TOMBSTONE_RETENTION_DAYS,
            large_queue_threshold: LARGE_QUEUE_THRESHOLD,
            maintenance_interval_secs: MAINTENANCE_INTERVAL_SECONDS,
            connection_send_buffer: CONNECTION_SEND_BUFFER,
        }
    }
}

impl AppConfig {
    /// Load the config file (if any) and apply environment overrides.
    pub fn load() -> Result<Self, AppError> {
        let path = std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| get_config_file_path());

        let mut config = if path.exists() {
            log::info!("Loading config from {:?}", path);
            Self::from_json(&std::fs::read_to_string(&path)?)?
        } else {
            log::info!("No config file at {:?}, using defaults", path);
            Self::default()
        };

        if let Ok(bind) = std::env::var(BIND_ENV) {
            config.bind_addr = bind;
        }
        if let Ok(db) = std::env::var(DATABASE_ENV) {
            config.database_path = PathBuf::from(db);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        serde_json::from_str(raw).map_err(|e| AppError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_queue_tracks == 0 {
            return Err(AppError::Config("max_queue_tracks must be positive".into()));
        }
        if self.max_queues_per_user == 0 {
            return Err(AppError::Config(
                "max_queues_per_user must be at least 1".into(),
            ));
        }
        if self.lock_lease_ms == 0 || self.lock_wait_ms == 0 {
            return Err(AppError::Config("lock timings must be positive".into()));
        }
        if self.connection_send_buffer == 0 {
            return Err(AppError::Config(
                "connection_send_buffer must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn empty_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.empty_cache_ttl_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            AppConfig::from_json(r#"{"coordination": "sqlite", "max_queue_tracks": 20}"#).unwrap();
        assert_eq!(config.coordination, Coordination::Sqlite);
        assert_eq!(config.max_queue_tracks, 20);
        assert_eq!(config.lock_wait_ms, LOCK_WAIT_MS);
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
    }

    #[test]
    fn test_rejects_zero_cap() {
        let config = AppConfig {
            max_queue_tracks: 0,
            ..AppConfig::default()
        };
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_unknown_coordination_is_config_error() {
        let result = AppConfig::from_json(r#"{"coordination": "redis"}"#);
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
