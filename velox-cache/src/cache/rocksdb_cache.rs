//! Embedded RocksDB cache
//!
//! Keys are ordered on disk, so bulk removal seeks to the namespaced prefix
//! and walks forward while keys keep it. Deletes are applied as one
//! `WriteBatch`, which makes `empty`/`empty_by_match` all-or-nothing here.

use crate::core::codec;
use crate::core::contract::{Cache, Compactor, Namespace};
use crate::core::error::{CacheError, Result};
use crate::core::types::{CompactionReport, Value};
use async_trait::async_trait;
use parking_lot::RwLock;
use rocksdb::{DB, Direction, IteratorMode, Options, WriteBatch};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const TOTAL_SST_FILES_SIZE: &str = "rocksdb.total-sst-files-size";
const ESTIMATE_LIVE_DATA_SIZE: &str = "rocksdb.estimate-live-data-size";

/// Embedded store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDbConfig {
    pub path: PathBuf,
    /// Namespace prefix (must not contain ':')
    pub prefix: String,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./tmp/rocksdb"),
            prefix: String::new(),
        }
    }
}

/// Cache backed by a local RocksDB directory
pub struct RocksDbCache {
    db: RwLock<Option<Arc<DB>>>,
    namespace: Namespace,
    path: PathBuf,
}

impl RocksDbCache {
    /// Open (or create) the store directory
    ///
    /// Fails fast with a configuration error when another handle, in this
    /// process or another one, already holds the directory.
    pub fn open(config: RocksDbConfig) -> Result<Self> {
        let namespace = Namespace::new(config.prefix.clone())?;

        fs::create_dir_all(&config.path).map_err(|e| {
            CacheError::Configuration(format!(
                "cannot create store directory {:?}: {}",
                config.path, e
            ))
        })?;

        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DB::open(&opts, &config.path).map_err(|e| {
            CacheError::Configuration(format!(
                "cannot open store at {:?}: {}",
                config.path, e
            ))
        })?;

        info!(
            "Opened RocksDB cache at {:?} (prefix={:?})",
            config.path, config.prefix
        );

        Ok(Self {
            db: RwLock::new(Some(Arc::new(db))),
            namespace,
            path: config.path,
        })
    }

    /// Another namespace over the same open store
    ///
    /// The directory lock allows a single open per process, so additional
    /// prefixes share this handle. Closing one view leaves the others usable.
    pub fn namespaced(&self, prefix: impl Into<String>) -> Result<Self> {
        Ok(Self {
            db: RwLock::new(Some(self.handle()?)),
            namespace: Namespace::new(prefix)?,
            path: self.path.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Clone the store handle; the lock is held only for the clone
    fn handle(&self) -> Result<Arc<DB>> {
        self.db
            .read()
            .clone()
            .ok_or_else(|| CacheError::Connection(format!("store {:?} is closed", self.path)))
    }

    /// Run a store call on the blocking pool
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&DB) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.handle()?;
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| CacheError::Storage(format!("store task failed: {}", e)))?
    }
}

#[async_trait]
impl Cache for RocksDbCache {
    fn prefix(&self) -> &str {
        self.namespace.prefix()
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let physical = self.namespace.key(key);
        let payload = codec::encode_value(&physical, value)?;
        debug!("SET key={}, size={}", physical, payload.len());

        self.blocking(move |db| Ok(db.put(physical.as_bytes(), payload)?))
            .await
    }

    async fn get(&self, key: &str) -> Result<Value> {
        let physical = self.namespace.key(key);
        debug!("GET key={}", physical);

        let lookup = physical.clone();
        let payload = self
            .blocking(move |db| Ok(db.get(lookup.as_bytes())?))
            .await?;

        match payload {
            Some(payload) => codec::decode_value(&physical, &payload),
            None => Err(CacheError::NotFound(key.to_string())),
        }
    }

    async fn has(&self, key: &str) -> Result<bool> {
        let physical = self.namespace.key(key);
        self.blocking(move |db| Ok(db.get_pinned(physical.as_bytes())?.is_some()))
            .await
    }

    async fn forget(&self, key: &str) -> Result<()> {
        let physical = self.namespace.key(key);
        debug!("DEL key={}", physical);

        self.blocking(move |db| Ok(db.delete(physical.as_bytes())?))
            .await
    }

    async fn empty_by_match(&self, pattern: &str) -> Result<()> {
        let start = self.namespace.match_prefix(pattern);
        debug!("EMPTY match={}*", start);

        let removed = self
            .blocking(move |db| {
                let start = start.as_bytes();
                let snapshot = db.snapshot();
                let mut batch = WriteBatch::default();

                for item in snapshot.iterator(IteratorMode::From(start, Direction::Forward)) {
                    let (key, _) = item?;
                    if !key.starts_with(start) {
                        break;
                    }
                    batch.delete(&key);
                }

                let removed = batch.len();
                if removed > 0 {
                    db.write(batch)?;
                }
                Ok(removed)
            })
            .await?;

        debug!("EMPTY removed={}", removed);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let db = self.db.write().take();
        if let Some(db) = db {
            info!("Closing RocksDB cache at {:?}", self.path);
            // In-flight operations keep their clone; the store closes with the last one
            tokio::task::spawn_blocking(move || db.flush())
                .await
                .map_err(|e| CacheError::Storage(format!("store task failed: {}", e)))??;
        }
        Ok(())
    }
}

#[async_trait]
impl Compactor for RocksDbCache {
    async fn compact(&self, reclaim_ratio: f64) -> Result<CompactionReport> {
        if !(reclaim_ratio > 0.0 && reclaim_ratio < 1.0) {
            return Err(CacheError::Configuration(format!(
                "reclaim ratio must be within (0, 1), got {}",
                reclaim_ratio
            )));
        }

        let report = self
            .blocking(move |db| {
                // Memtable contents and tombstones only count once flushed to SST files
                db.flush()?;

                let total = db.property_int_value(TOTAL_SST_FILES_SIZE)?.unwrap_or(0);
                let live = db
                    .property_int_value(ESTIMATE_LIVE_DATA_SIZE)?
                    .unwrap_or(total)
                    .min(total);
                let reclaimable_ratio = if total == 0 {
                    0.0
                } else {
                    1.0 - live as f64 / total as f64
                };

                let mut report = CompactionReport {
                    reclaimable_ratio,
                    compacted: false,
                    size_before: total,
                    size_after: total,
                };
                if total == 0 || reclaimable_ratio < reclaim_ratio {
                    return Ok(report);
                }

                db.compact_range(None::<&[u8]>, None::<&[u8]>);
                report.compacted = true;
                report.size_after = db.property_int_value(TOTAL_SST_FILES_SIZE)?.unwrap_or(0);
                Ok(report)
            })
            .await?;

        if report.compacted {
            info!(
                "Compacted {:?}: {} -> {} bytes (reclaimable {:.2})",
                self.path, report.size_before, report.size_after, report.reclaimable_ratio
            );
        } else {
            debug!(
                "Skipped compaction of {:?}: reclaimable {:.2} below {:.2}",
                self.path, report.reclaimable_ratio, reclaim_ratio
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_in(dir: &Path, prefix: &str) -> RocksDbCache {
        RocksDbCache::open(RocksDbConfig {
            path: dir.to_path_buf(),
            prefix: prefix.to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_rocksdb_cache_basic() {
        let dir = tempdir().unwrap();
        let cache = open_in(dir.path(), "");

        cache.set("key1", Value::from("value1")).await.unwrap();
        cache.set("key2", Value::Int(2)).await.unwrap();

        assert_eq!(cache.get("key1").await.unwrap(), Value::from("value1"));
        assert_eq!(cache.get("key2").await.unwrap(), Value::Int(2));
    }

    #[tokio::test]
    async fn test_overwrite() {
        let dir = tempdir().unwrap();
        let cache = open_in(dir.path(), "app");

        cache.set("foo", Value::from("one")).await.unwrap();
        cache.set("foo", Value::from("two")).await.unwrap();
        assert_eq!(cache.get("foo").await.unwrap(), Value::from("two"));
    }

    #[tokio::test]
    async fn test_corrupt_payload_surfaces() {
        let dir = tempdir().unwrap();
        let cache = open_in(dir.path(), "app");

        let db = cache.handle().unwrap();
        db.put(b"app:broken", b"not a payload").unwrap();

        let err = cache.get("broken").await.unwrap_err();
        assert!(matches!(err, CacheError::CorruptPayload(_)));
        // Existence does not depend on decoding
        assert!(cache.has("broken").await.unwrap());
    }

    #[tokio::test]
    async fn test_second_open_fails_fast() {
        let dir = tempdir().unwrap();
        let _cache = open_in(dir.path(), "");

        let second = RocksDbCache::open(RocksDbConfig {
            path: dir.path().to_path_buf(),
            prefix: String::new(),
        });
        assert!(matches!(second, Err(CacheError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_compact_empty_store() {
        let dir = tempdir().unwrap();
        let cache = open_in(dir.path(), "");

        let report = cache.compact(0.7).await.unwrap();
        assert!(!report.compacted);
        assert_eq!(report.size_before, 0);
    }

    #[tokio::test]
    async fn test_compact_rejects_invalid_ratio() {
        let dir = tempdir().unwrap();
        let cache = open_in(dir.path(), "");

        assert!(matches!(
            cache.compact(0.0).await,
            Err(CacheError::Configuration(_))
        ));
        assert!(matches!(
            cache.compact(1.5).await,
            Err(CacheError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_compact_after_deletes_keeps_live_data() {
        let dir = tempdir().unwrap();
        let cache = open_in(dir.path(), "");

        for i in 0..500 {
            cache
                .set(&format!("key{}", i), Value::from("x".repeat(256)))
                .await
                .unwrap();
        }
        cache.compact(0.5).await.unwrap();
        cache.empty_by_match("key1").await.unwrap();

        let report = cache.compact(0.01).await.unwrap();
        assert!(report.size_before > 0);

        assert!(!cache.has("key1").await.unwrap());
        assert!(!cache.has("key150").await.unwrap());
        assert!(cache.has("key2").await.unwrap());
        assert_eq!(
            cache.get("key499").await.unwrap(),
            Value::from("x".repeat(256))
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let dir = tempdir().unwrap();
        let cache = open_in(dir.path(), "");

        cache.set("foo", Value::from("bar")).await.unwrap();
        cache.close().await.unwrap();
        cache.close().await.unwrap();

        assert!(matches!(
            cache.get("foo").await,
            Err(CacheError::Connection(_))
        ));
        assert!(cache.compact(0.5).await.is_err());
    }

    #[tokio::test]
    async fn test_reopen_after_close_keeps_data() {
        let dir = tempdir().unwrap();
        {
            let cache = open_in(dir.path(), "app");
            cache.set("foo", Value::from("bar")).await.unwrap();
            cache.close().await.unwrap();
        }

        let cache = open_in(dir.path(), "app");
        assert_eq!(cache.get("foo").await.unwrap(), Value::from("bar"));
    }
}
