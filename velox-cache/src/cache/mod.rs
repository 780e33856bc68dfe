//! Cache Module
//!
//! Two adapters behind the [`Cache`] contract:
//! - Redis: networked, pooled connections
//! - RocksDB: embedded, with a compaction hook

pub mod pool;
pub mod redis_cache;
pub mod rocksdb_cache;

pub use pool::{ManageConnection, Pool, PoolConfig, PoolState, PooledConnection};
pub use redis_cache::{RedisCache, RedisConfig, RedisConnectionManager};
pub use rocksdb_cache::{RocksDbCache, RocksDbConfig};

use crate::config::{CacheBackend, CacheConfig, MaintenanceConfig};
use crate::core::{Cache, Compactor, Result};
use crate::maintenance;
use std::ops::Deref;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// The adapter a process selected at startup
///
/// Built once and passed to whatever needs the cache.
#[derive(Clone)]
pub struct CacheHandle {
    backend: CacheBackend,
    cache: Arc<dyn Cache>,
    compactor: Option<Arc<dyn Compactor>>,
}

impl CacheHandle {
    /// Validate `config` and construct the configured adapter
    pub fn open(config: &CacheConfig) -> Result<Self> {
        config.validate()?;

        let handle = match config.backend {
            CacheBackend::Redis => Self {
                backend: CacheBackend::Redis,
                cache: Arc::new(RedisCache::new(config.redis.clone())?),
                compactor: None,
            },
            CacheBackend::Rocksdb => {
                let store = Arc::new(RocksDbCache::open(config.rocksdb.clone())?);
                Self {
                    backend: CacheBackend::Rocksdb,
                    cache: store.clone(),
                    compactor: Some(store as Arc<dyn Compactor>),
                }
            }
        };

        info!("Cache backend ready: {}", handle.backend);
        Ok(handle)
    }

    pub fn backend(&self) -> CacheBackend {
        self.backend
    }

    pub fn cache(&self) -> Arc<dyn Cache> {
        Arc::clone(&self.cache)
    }

    /// Compaction hook, present only for the embedded store
    pub fn compactor(&self) -> Option<Arc<dyn Compactor>> {
        self.compactor.clone()
    }

    /// Start scheduled compaction when enabled and supported by the backend
    pub fn start_maintenance(&self, config: &MaintenanceConfig) -> Option<JoinHandle<()>> {
        if !config.enabled {
            return None;
        }
        let hook = self.compactor()?;
        Some(maintenance::spawn_compaction(
            hook,
            config.interval(),
            config.reclaim_ratio,
        ))
    }

    pub async fn close(&self) -> Result<()> {
        self.cache.close().await
    }
}

impl Deref for CacheHandle {
    type Target = dyn Cache;

    fn deref(&self) -> &Self::Target {
        self.cache.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CacheError, Value};
    use tempfile::tempdir;

    fn embedded_config(dir: &std::path::Path) -> CacheConfig {
        let mut config = CacheConfig::default();
        config.backend = CacheBackend::Rocksdb;
        config.rocksdb.path = dir.to_path_buf();
        config.rocksdb.prefix = "app".to_string();
        config
    }

    #[tokio::test]
    async fn test_open_embedded() {
        let dir = tempdir().unwrap();
        let handle = CacheHandle::open(&embedded_config(dir.path())).unwrap();

        assert_eq!(handle.backend(), CacheBackend::Rocksdb);
        assert!(handle.compactor().is_some());
        assert_eq!(handle.prefix(), "app");

        handle.set("foo", Value::from("bar")).await.unwrap();
        assert_eq!(handle.get("foo").await.unwrap(), Value::from("bar"));
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_redis_is_lazy() {
        let mut config = CacheConfig::default();
        config.backend = CacheBackend::Redis;
        config.redis.host = "127.0.0.1:1".to_string();

        let handle = CacheHandle::open(&config).unwrap();
        assert_eq!(handle.backend(), CacheBackend::Redis);
        assert!(handle.compactor().is_none());
        assert!(handle.start_maintenance(&config.maintenance).is_none());
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let dir = tempdir().unwrap();
        let mut config = embedded_config(dir.path());
        config.rocksdb.prefix = "a:b".to_string();

        assert!(matches!(
            CacheHandle::open(&config),
            Err(CacheError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_maintenance_disabled() {
        let dir = tempdir().unwrap();
        let mut config = embedded_config(dir.path());
        config.maintenance.enabled = false;

        let handle = CacheHandle::open(&config).unwrap();
        assert!(handle.start_maintenance(&config.maintenance).is_none());
    }

    #[tokio::test]
    async fn test_maintenance_started_for_embedded() {
        let dir = tempdir().unwrap();
        let config = embedded_config(dir.path());

        let handle = CacheHandle::open(&config).unwrap();
        let task = handle.start_maintenance(&config.maintenance).unwrap();
        assert!(!task.is_finished());
        task.abort();
    }
}
