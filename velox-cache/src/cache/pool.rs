//! Bounded connection pool
//!
//! Checkout waits at most `wait_timeout` for a free slot; `max_active`
//! bounds the connections handed out at once and `max_idle` bounds the
//! connections kept around between checkouts.

use crate::core::error::{CacheError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Creates and validates pooled connections
#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> Result<Self::Connection>;

    /// Validate an idle connection before handing it out again
    async fn check(&self, conn: &mut Self::Connection) -> Result<()>;
}

/// Pool limits
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections retained between checkouts
    pub max_idle: usize,
    /// Connections checked out at once (0 = unbounded)
    pub max_active: usize,
    /// Idle connections older than this are closed instead of reused
    pub idle_timeout: Option<Duration>,
    /// Maximum wait for a free slot when the pool is exhausted
    pub wait_timeout: Duration,
    /// Run [`ManageConnection::check`] on idle connections before reuse
    pub test_on_borrow: bool,
    /// Maximum time a borrow-time check may take before the connection is discarded
    pub check_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 10,
            max_active: 10_000,
            idle_timeout: Some(Duration::from_secs(240)),
            wait_timeout: Duration::from_secs(5),
            test_on_borrow: true,
            check_timeout: Duration::from_secs(5),
        }
    }
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    pub idle: usize,
    pub active: usize,
}

struct IdleConnection<C> {
    conn: C,
    idle_since: Instant,
}

struct SharedPool<M: ManageConnection> {
    manager: M,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleConnection<M::Connection>>>,
    permits: Arc<Semaphore>,
    max_permits: usize,
    closed: AtomicBool,
}

impl<M: ManageConnection> SharedPool<M> {
    /// Most recently returned idle connection, dropping expired ones
    fn take_idle(&self) -> Option<M::Connection> {
        let mut idle = self.idle.lock();

        if let Some(timeout) = self.config.idle_timeout {
            // Oldest connections sit at the front
            while idle
                .front()
                .is_some_and(|c| c.idle_since.elapsed() > timeout)
            {
                idle.pop_front();
                debug!("Closed connection idle for more than {:?}", timeout);
            }
        }

        idle.pop_back().map(|c| c.conn)
    }

    fn put_idle(&self, conn: M::Connection) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let mut idle = self.idle.lock();
        if idle.len() < self.config.max_idle {
            idle.push_back(IdleConnection {
                conn,
                idle_since: Instant::now(),
            });
        }
    }
}

/// Bounded pool of connections produced by a [`ManageConnection`]
pub struct Pool<M: ManageConnection> {
    shared: Arc<SharedPool<M>>,
}

impl<M: ManageConnection> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<M: ManageConnection> Pool<M> {
    pub fn new(manager: M, config: PoolConfig) -> Self {
        let max_permits = if config.max_active == 0 {
            Semaphore::MAX_PERMITS
        } else {
            config.max_active
        };

        Self {
            shared: Arc::new(SharedPool {
                manager,
                config,
                idle: Mutex::new(VecDeque::new()),
                permits: Arc::new(Semaphore::new(max_permits)),
                max_permits,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Check out a connection, reusing an idle one when possible
    pub async fn get(&self) -> Result<PooledConnection<M>> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(CacheError::Connection("connection pool is closed".to_string()));
        }

        let wait = shared.config.wait_timeout;
        let permit = match tokio::time::timeout(wait, shared.permits.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(CacheError::Connection(
                    "connection pool is closed".to_string(),
                ));
            }
            Err(_) => {
                return Err(CacheError::Connection(format!(
                    "pool exhausted: no connection available after {:?}",
                    wait
                )));
            }
        };

        while let Some(mut conn) = shared.take_idle() {
            if shared.config.test_on_borrow {
                let timeout = shared.config.check_timeout;
                match tokio::time::timeout(timeout, shared.manager.check(&mut conn)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("Discarding pooled connection that failed validation: {}", e);
                        continue;
                    }
                    Err(_) => {
                        warn!("Discarding pooled connection unresponsive for {:?}", timeout);
                        continue;
                    }
                }
            }
            return Ok(PooledConnection::new(conn, shared.clone(), permit));
        }

        // Permit is released on error, so a failed dial never leaks a slot
        let conn = shared.manager.connect().await?;
        debug!("Opened new pooled connection");
        Ok(PooledConnection::new(conn, shared.clone(), permit))
    }

    pub fn state(&self) -> PoolState {
        PoolState {
            idle: self.shared.idle.lock().len(),
            active: self.shared.max_permits - self.shared.permits.available_permits(),
        }
    }

    /// Close the pool; waiting and future checkouts fail, idle connections are dropped
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.permits.close();
        self.shared.idle.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

/// Connection checked out of a [`Pool`]; returned on drop
pub struct PooledConnection<M: ManageConnection> {
    conn: Option<M::Connection>,
    shared: Arc<SharedPool<M>>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl<M: ManageConnection> PooledConnection<M> {
    fn new(conn: M::Connection, shared: Arc<SharedPool<M>>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: Some(conn),
            shared,
            broken: false,
            _permit: permit,
        }
    }

    /// Drop the connection instead of returning it to the pool
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection is present until drop")
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection is present until drop")
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.broken {
                debug!("Dropping broken pooled connection");
            } else {
                self.shared.put_idle(conn);
            }
        }
    }
}
