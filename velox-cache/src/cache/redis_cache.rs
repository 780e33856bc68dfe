//! Redis-backed cache
//!
//! Every operation checks a connection out of the bounded pool and returns
//! it afterwards. Bulk removal walks `SCAN ... MATCH` pages and deletes each
//! page with one `DEL`; it never issues `FLUSHDB`, so other namespaces
//! sharing the server are untouched.

use super::pool::{ManageConnection, Pool, PoolConfig, PoolState, PooledConnection};
use crate::core::codec;
use crate::core::contract::{Cache, Namespace};
use crate::core::error::{CacheError, Result};
use crate::core::types::Value;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{IntoConnectionInfo, RedisResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// Redis adapter configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// `host:port`, or a full `redis://` URL
    pub host: String,
    pub password: String,
    /// Namespace prefix (must not contain ':')
    pub prefix: String,
    pub database: i64,
    pub max_idle: usize,
    /// 0 = unbounded
    pub max_active: usize,
    /// 0 = idle connections never expire
    pub idle_timeout_secs: u64,
    pub wait_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub test_on_borrow: bool,
    /// COUNT hint for each SCAN page
    pub scan_batch_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1:6379".to_string(),
            password: String::new(),
            prefix: String::new(),
            database: 0,
            max_idle: 10,
            max_active: 10_000,
            idle_timeout_secs: 240,
            wait_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            test_on_borrow: true,
            scan_batch_size: 500,
        }
    }
}

impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConfig")
            .field("host", &self.host)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("prefix", &self.prefix)
            .field("database", &self.database)
            .field("max_idle", &self.max_idle)
            .field("max_active", &self.max_active)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .field("wait_timeout_ms", &self.wait_timeout_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("test_on_borrow", &self.test_on_borrow)
            .field("scan_batch_size", &self.scan_batch_size)
            .finish()
    }
}

impl RedisConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle: self.max_idle,
            max_active: self.max_active,
            idle_timeout: (self.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.idle_timeout_secs)),
            wait_timeout: Duration::from_millis(self.wait_timeout_ms),
            test_on_borrow: self.test_on_borrow,
            check_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    fn connection_info(&self) -> Result<redis::ConnectionInfo> {
        let url = if self.host.starts_with("redis://") || self.host.starts_with("rediss://") {
            self.host.clone()
        } else {
            format!("redis://{}/{}", self.host, self.database)
        };

        let mut info = url.as_str().into_connection_info().map_err(|e| {
            CacheError::Configuration(format!("invalid redis host {:?}: {}", self.host, e))
        })?;
        if !self.password.is_empty() {
            info.redis.password = Some(self.password.clone());
        }

        Ok(info)
    }
}

/// Dials multiplexed Redis connections for the pool
pub struct RedisConnectionManager {
    client: redis::Client,
    connect_timeout: Duration,
}

impl RedisConnectionManager {
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.connection_info()?)
            .map_err(|e| CacheError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        })
    }
}

#[async_trait]
impl ManageConnection for RedisConnectionManager {
    type Connection = MultiplexedConnection;

    async fn connect(&self) -> Result<MultiplexedConnection> {
        let addr = &self.client.get_connection_info().addr;
        match tokio::time::timeout(
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(CacheError::Connection(format!(
                "failed to connect to {}: {}",
                addr, e
            ))),
            Err(_) => Err(CacheError::Connection(format!(
                "connecting to {} timed out after {:?}",
                addr, self.connect_timeout
            ))),
        }
    }

    async fn check(&self, conn: &mut MultiplexedConnection) -> Result<()> {
        let _: String = redis::cmd("PING").query_async(conn).await?;
        Ok(())
    }
}

/// Escape glob metacharacters so SCAN MATCH treats `raw` literally
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Millisecond expiry for `SET ... PX`; Redis rejects a zero expiry
fn expire_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Map a command result, retiring the connection on transport failures
fn finish<T>(conn: &mut PooledConnection<RedisConnectionManager>, result: RedisResult<T>) -> Result<T> {
    result.map_err(|e| {
        if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
            conn.mark_broken();
        }
        CacheError::from(e)
    })
}

/// Cache backed by a Redis server
pub struct RedisCache {
    pool: Pool<RedisConnectionManager>,
    namespace: Namespace,
    scan_batch_size: usize,
}

impl RedisCache {
    /// Build the adapter; no connection is opened until the first operation
    pub fn new(config: RedisConfig) -> Result<Self> {
        let namespace = Namespace::new(config.prefix.clone())?;
        let manager = RedisConnectionManager::new(&config)?;

        info!(
            "Initializing Redis cache at {} (prefix={:?}, max_idle={}, max_active={})",
            config.host, config.prefix, config.max_idle, config.max_active
        );

        Ok(Self {
            pool: Pool::new(manager, config.pool_config()),
            namespace,
            scan_batch_size: config.scan_batch_size.max(1),
        })
    }

    /// Store `value` under `key`, letting Redis expire it after `ttl`
    pub async fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        let physical = self.namespace.key(key);
        let payload = codec::encode_value(&physical, value)?;
        let millis = expire_millis(ttl);
        debug!("SET PX key={}, size={}, ttl={}ms", physical, payload.len(), millis);

        let mut conn = self.pool.get().await?;
        let result: RedisResult<()> = redis::cmd("SET")
            .arg(&physical)
            .arg(payload)
            .arg("PX")
            .arg(millis)
            .query_async(&mut *conn)
            .await;
        finish(&mut conn, result)
    }

    /// Round-trip a PING through the pool
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let result: RedisResult<String> = redis::cmd("PING").query_async(&mut *conn).await;
        finish(&mut conn, result).map(|_| ())
    }

    pub fn pool_state(&self) -> PoolState {
        self.pool.state()
    }
}

#[async_trait]
impl Cache for RedisCache {
    fn prefix(&self) -> &str {
        self.namespace.prefix()
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let physical = self.namespace.key(key);
        let payload = codec::encode_value(&physical, value)?;
        debug!("SET key={}, size={}", physical, payload.len());

        let mut conn = self.pool.get().await?;
        let result: RedisResult<()> = redis::cmd("SET")
            .arg(&physical)
            .arg(payload)
            .query_async(&mut *conn)
            .await;
        finish(&mut conn, result)
    }

    async fn get(&self, key: &str) -> Result<Value> {
        let physical = self.namespace.key(key);
        debug!("GET key={}", physical);

        let mut conn = self.pool.get().await?;
        let result: RedisResult<Option<Vec<u8>>> =
            redis::cmd("GET").arg(&physical).query_async(&mut *conn).await;
        let payload = finish(&mut conn, result)?;
        drop(conn);

        match payload {
            Some(payload) => codec::decode_value(&physical, &payload),
            None => Err(CacheError::NotFound(key.to_string())),
        }
    }

    async fn has(&self, key: &str) -> Result<bool> {
        let physical = self.namespace.key(key);

        let mut conn = self.pool.get().await?;
        let result: RedisResult<bool> =
            redis::cmd("EXISTS").arg(&physical).query_async(&mut *conn).await;
        finish(&mut conn, result)
    }

    async fn forget(&self, key: &str) -> Result<()> {
        let physical = self.namespace.key(key);
        debug!("DEL key={}", physical);

        let mut conn = self.pool.get().await?;
        let result: RedisResult<()> = redis::cmd("DEL").arg(&physical).query_async(&mut *conn).await;
        finish(&mut conn, result)
    }

    async fn empty_by_match(&self, pattern: &str) -> Result<()> {
        let glob = format!("{}*", escape_glob(&self.namespace.match_prefix(pattern)));
        debug!("EMPTY match={}", glob);

        let mut conn = self.pool.get().await?;
        let mut cursor: u64 = 0;
        let mut removed: usize = 0;

        // Deletes already applied stay applied when a later page fails
        loop {
            let page: RedisResult<(u64, Vec<Vec<u8>>)> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&glob)
                .arg("COUNT")
                .arg(self.scan_batch_size)
                .query_async(&mut *conn)
                .await;
            let (next, keys) = finish(&mut conn, page)?;

            if !keys.is_empty() {
                let mut del = redis::cmd("DEL");
                for key in &keys {
                    del.arg(key);
                }
                let result: RedisResult<usize> = del.query_async(&mut *conn).await;
                removed += finish(&mut conn, result)?;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!("EMPTY match={} removed={}", glob, removed);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.pool.is_closed() {
            info!("Closing Redis cache pool (prefix={:?})", self.namespace.prefix());
            self.pool.close();
        }
        Ok(())
    }
}
