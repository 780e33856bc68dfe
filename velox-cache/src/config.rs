use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::cache::{RedisConfig, RocksDbConfig};
use crate::core::{CacheError, NAMESPACE_SEPARATOR, Result};
use crate::maintenance::{DEFAULT_INTERVAL, DEFAULT_RECLAIM_RATIO};

/// Which adapter a process runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Redis,
    #[serde(alias = "embedded", alias = "badger")]
    Rocksdb,
}

impl FromStr for CacheBackend {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(CacheBackend::Redis),
            "rocksdb" | "embedded" | "badger" => Ok(CacheBackend::Rocksdb),
            other => Err(CacheError::Configuration(format!(
                "unknown cache backend {:?} (expected redis or rocksdb)",
                other
            ))),
        }
    }
}

impl fmt::Display for CacheBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheBackend::Redis => write!(f, "redis"),
            CacheBackend::Rocksdb => write!(f, "rocksdb"),
        }
    }
}

/// Top-level cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub redis: RedisConfig,
    pub rocksdb: RocksDbConfig,
    pub maintenance: MaintenanceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub reclaim_ratio: f64,
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_INTERVAL.as_secs(),
            reclaim_ratio: DEFAULT_RECLAIM_RATIO,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Rocksdb,
            redis: RedisConfig::default(),
            rocksdb: RocksDbConfig::default(),
            maintenance: MaintenanceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            CacheError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `CACHE`, `REDIS_HOST`, `REDIS_PASS`, `REDIS_PREFIX` and
    /// `CACHE_PATH` from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable lookup; unset or empty values are ignored
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(backend) = var("CACHE") {
            self.backend = backend.parse()?;
        }
        if let Some(host) = var("REDIS_HOST") {
            self.redis.host = host;
        }
        if let Some(password) = var("REDIS_PASS") {
            self.redis.password = password;
        }
        if let Some(prefix) = var("REDIS_PREFIX") {
            // The embedded store shares the namespace unless configured on its own
            if self.rocksdb.prefix.is_empty() {
                self.rocksdb.prefix = prefix.clone();
            }
            self.redis.prefix = prefix;
        }
        if let Some(path) = var("CACHE_PATH") {
            self.rocksdb.path = PathBuf::from(path);
        }

        Ok(())
    }

    /// Reject settings that cannot produce a working adapter
    ///
    /// Only the section of the selected backend is checked, plus `maintenance`.
    pub fn validate(&self) -> Result<()> {
        match self.backend {
            CacheBackend::Redis => self.validate_redis()?,
            CacheBackend::Rocksdb => self.validate_rocksdb()?,
        }

        let ratio = self.maintenance.reclaim_ratio;
        if !(ratio > 0.0 && ratio < 1.0) {
            return Err(CacheError::Configuration(format!(
                "maintenance.reclaim_ratio must be within (0, 1), got {}",
                ratio
            )));
        }

        if self.maintenance.interval_secs == 0 {
            return Err(CacheError::Configuration(
                "maintenance.interval_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_redis(&self) -> Result<()> {
        check_prefix("redis", &self.redis.prefix)?;

        if self.redis.host.trim().is_empty() {
            return Err(CacheError::Configuration(
                "redis.host must not be empty".to_string(),
            ));
        }

        if self.redis.max_active > 0 && self.redis.max_idle > self.redis.max_active {
            return Err(CacheError::Configuration(format!(
                "redis.max_idle ({}) exceeds redis.max_active ({})",
                self.redis.max_idle, self.redis.max_active
            )));
        }

        Ok(())
    }

    fn validate_rocksdb(&self) -> Result<()> {
        check_prefix("rocksdb", &self.rocksdb.prefix)?;

        if self.rocksdb.path.as_os_str().is_empty() {
            return Err(CacheError::Configuration(
                "rocksdb.path must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn check_prefix(section: &str, prefix: &str) -> Result<()> {
    if prefix.contains(NAMESPACE_SEPARATOR) {
        return Err(CacheError::Configuration(format!(
            "{}.prefix {:?} must not contain {:?}",
            section, prefix, NAMESPACE_SEPARATOR
        )));
    }
    Ok(())
}
