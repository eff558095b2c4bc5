//! Bounded connection pool
//!
//! A semaphore caps the number of checked-out connections. Idle connections
//! are reused most-recent-first; those idle longer than `idle_timeout` are
//! closed instead. `reap_idle` health-checks idle connections and drops the
//! dead ones.

use super::ConnectorError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> Result<Self::Connection, ConnectorError>;

    /// Cheap liveness probe for an idle connection.
    async fn is_healthy(&self, conn: &mut Self::Connection) -> bool;
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

struct Idle<C> {
    conn: C,
    since: Instant,
}

struct PoolInner<M: ManageConnection> {
    name: String,
    manager: M,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<Idle<M::Connection>>>,
}

impl<M: ManageConnection> PoolInner<M> {
    fn idle(&self) -> MutexGuard<'_, VecDeque<Idle<M::Connection>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn put_back(&self, conn: M::Connection) {
        let mut idle = self.idle();
        if idle.len() < self.config.max_size {
            idle.push_back(Idle {
                conn,
                since: Instant::now(),
            });
        }
    }
}

pub struct ConnectionPool<M: ManageConnection> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ManageConnection> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: ManageConnection> ConnectionPool<M> {
    pub fn new(name: impl Into<String>, manager: M, config: PoolConfig) -> Self {
        let max_size = config.max_size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                manager,
                config: PoolConfig { max_size, ..config },
                permits: Arc::new(Semaphore::new(max_size)),
                idle: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Check out a connection, reusing an idle one when possible. Fails with
    /// `PoolExhausted` when no slot frees up within the acquire timeout.
    pub async fn get(&self) -> Result<PooledConnection<M>, ConnectorError> {
        let waited = self.inner.config.acquire_timeout;
        let permit = match tokio::time::timeout(waited, self.inner.permits.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ConnectorError::Closed),
            Err(_) => {
                crate::metrics::POOL_EXHAUSTED
                    .with_label_values(&[&self.inner.name])
                    .inc();
                return Err(ConnectorError::PoolExhausted {
                    destination: self.inner.name.clone(),
                    waited,
                });
            }
        };

        let reusable = loop {
            let next = self.inner.idle().pop_back();
            match next {
                Some(idle) if idle.since.elapsed() < self.inner.config.idle_timeout => {
                    break Some(idle.conn)
                }
                Some(_) => {
                    tracing::debug!(pool = %self.inner.name, "Closing stale idle connection");
                }
                None => break None,
            }
        };

        let conn = match reusable {
            Some(conn) => conn,
            None => {
                let conn = self.inner.manager.connect().await?;
                tracing::debug!(pool = %self.inner.name, "Opened new connection");
                conn
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Health-check idle connections, closing the dead ones. Returns how
    /// many were evicted.
    pub async fn reap_idle(&self) -> usize {
        let candidates: Vec<Idle<M::Connection>> = self.inner.idle().drain(..).collect();
        let mut evicted = 0;
        for mut idle in candidates {
            let fresh = idle.since.elapsed() < self.inner.config.idle_timeout;
            if fresh && self.inner.manager.is_healthy(&mut idle.conn).await {
                self.inner.put_back(idle.conn);
            } else {
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::info!(pool = %self.inner.name, evicted, "Evicted idle connections");
        }
        evicted
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle().len()
    }

    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Drop idle connections and refuse further checkouts.
    pub fn close(&self) {
        self.inner.permits.close();
        self.inner.idle().clear();
    }
}

/// A checked-out connection. Returns to the pool on drop unless discarded.
pub struct PooledConnection<M: ManageConnection> {
    conn: Option<M::Connection>,
    pool: Arc<PoolInner<M>>,
    _permit: OwnedSemaphorePermit,
}

impl<M: ManageConnection> PooledConnection<M> {
    /// Close the connection instead of returning it, e.g. after an I/O error.
    pub fn discard(mut self) {
        self.conn = None;
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `discard` clears the slot, and it consumes the guard.
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after discard"),
        }
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after discard"),
        }
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.pool.permits.is_closed() {
                self.pool.put_back(conn);
            }
        }
    }
}
