//! Bounded pool of DuckDB connections
//!
//! DuckDB connections are `Send` but not `Sync`, so each request checks one
//! out exclusively. A semaphore bounds concurrent holders; waiting longer than
//! `acquire_timeout` is a connection failure.

use duckdb::{AccessMode, Config, Connection};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::ExecutionError;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("timed out after {0:?} waiting for a database connection")]
    AcquireTimeout(Duration),

    #[error("connection pool is closed")]
    Closed,
}

impl From<PoolError> for ExecutionError {
    fn from(err: PoolError) -> Self {
        ExecutionError::connection(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub size: usize,
    pub idle: usize,
    pub available: usize,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

// Fields drop in order; the root connection owns the database handle and
// has to outlive every clone.
struct PoolInner {
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
    size: usize,
    _root: Mutex<Connection>,
}

impl ConnectionPool {
    /// Open a database file and fill the pool
    pub fn open<P: AsRef<Path>>(
        path: P,
        size: usize,
        read_only: bool,
        memory_limit_mb: Option<u64>,
        acquire_timeout: Duration,
    ) -> Result<Self, PoolError> {
        let mut config = Config::default();
        if read_only {
            config = config.access_mode(AccessMode::ReadOnly)?;
        }
        let root = Connection::open_with_flags(path.as_ref(), config)?;

        if let Some(mb) = memory_limit_mb {
            let pragma = format!("PRAGMA memory_limit='{}MB'", mb);
            root.execute_batch(&pragma)?;
        }

        tracing::info!(
            path = %path.as_ref().display(),
            size,
            read_only,
            "Opened DuckDB connection pool"
        );

        Self::from_connection(root, size, acquire_timeout)
    }

    /// Build a pool of clones sharing the database behind `root`
    pub fn from_connection(
        root: Connection,
        size: usize,
        acquire_timeout: Duration,
    ) -> Result<Self, PoolError> {
        let size = size.max(1);
        let idle = (0..size)
            .map(|_| root.try_clone())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(idle),
                permits: Arc::new(Semaphore::new(size)),
                acquire_timeout,
                size,
                _root: Mutex::new(root),
            }),
        })
    }

    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let permits = self.inner.permits.clone();
        let timeout = self.inner.acquire_timeout;
        let permit = match tokio::time::timeout(timeout, permits.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => return Err(PoolError::AcquireTimeout(self.inner.acquire_timeout)),
        };

        let conn = self.inner.lock_idle().pop().ok_or(PoolError::Closed)?;

        Ok(PooledConnection {
            conn,
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Refuse new checkouts and drop idle connections
    pub fn close(&self) {
        self.inner.permits.close();
        let drained = std::mem::take(&mut *self.inner.lock_idle());
        tracing::info!(closed = drained.len(), "Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            size: self.inner.size,
            idle: self.inner.lock_idle().len(),
            available: self.inner.permits.available_permits(),
        }
    }
}

impl PoolInner {
    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<Connection>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A checked-out connection; goes back to the pool on drop
pub struct PooledConnection {
    conn: Connection,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // A fresh handle goes back so a pending interrupt on this one cannot
        // leak into the next checkout. Runs before the permit is released.
        if self.pool.permits.is_closed() {
            return;
        }
        match self.conn.try_clone() {
            Ok(fresh) => self.pool.lock_idle().push(fresh),
            Err(e) => tracing::warn!(error = %e, "Dropping connection that could not be recycled"),
        }
    }
}
