// Connection pooling for the database gateway

use parking_lot::RwLock;
use serde::Serialize;
use sqlgate_core::{DatabaseConfig, Error, PoolConfig};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions};
use sqlx::Postgres;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("timed out waiting for a database connection")]
    Timeout,
    #[error("connection pool is shut down")]
    Closed,
    #[error("failed to create connection pool: {0}")]
    Connect(String),
    #[error("failed to acquire connection: {0}")]
    Acquire(String),
}

impl From<PoolError> for Error {
    fn from(e: PoolError) -> Self {
        Error::PoolUnavailable(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub created: bool,
    pub size: u32,
    pub idle: usize,
    pub max_size: u32,
}

/// Lazily created, process-wide database pool.
///
/// The pool slot is read on every acquire; creation is serialized by an
/// async lock so concurrent first callers build it once.
pub struct PoolManager {
    database: DatabaseConfig,
    settings: PoolConfig,
    pool: RwLock<Option<PgPool>>,
    init_lock: Mutex<()>,
    closed: AtomicBool,
}

impl PoolManager {
    pub fn new(database: DatabaseConfig, settings: PoolConfig) -> Self {
        Self {
            database,
            settings,
            pool: RwLock::new(None),
            init_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        self.settings.command_timeout()
    }

    fn connect_options(&self) -> Result<PgConnectOptions, PoolError> {
        let base = match &self.database.url {
            Some(url) => url
                .parse::<PgConnectOptions>()
                .map_err(|e| PoolError::Connect(e.to_string()))?,
            None => PgConnectOptions::new()
                .host(&self.database.host)
                .port(self.database.port)
                .database(&self.database.name)
                .username(&self.database.user)
                .password(&self.database.password),
        };
        let statement_timeout_ms = self.settings.command_timeout().as_millis().to_string();
        Ok(base
            .application_name("sqlgate")
            .options([("statement_timeout", statement_timeout_ms)]))
    }

    /// Create the pool if it does not exist yet. Idempotent.
    pub async fn init(&self) -> Result<PgPool, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        if let Some(pool) = self.pool.read().as_ref() {
            return Ok(pool.clone());
        }

        let _guard = self.init_lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        if let Some(pool) = self.pool.read().as_ref() {
            return Ok(pool.clone());
        }

        let pool = PgPoolOptions::new()
            .min_connections(self.settings.min_connections)
            .max_connections(self.settings.max_connections)
            .acquire_timeout(self.settings.acquire_timeout())
            .idle_timeout(Some(self.settings.idle_timeout()))
            .connect_with(self.connect_options()?)
            .await
            .map_err(|e| {
                error!("Failed to create connection pool for {}: {}", self.database.describe(), e);
                PoolError::Connect(e.to_string())
            })?;

        info!(
            "Connection pool created for {} (min={}, max={})",
            self.database.describe(),
            self.settings.min_connections,
            self.settings.max_connections
        );
        *self.pool.write() = Some(pool.clone());
        Ok(pool)
    }

    /// Acquire a pooled connection, creating the pool on first use.
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let pool = self.init().await?;
        let started = Instant::now();
        let conn = pool.acquire().await.map_err(|e| match e {
            sqlx::Error::PoolTimedOut => {
                warn!("Timed out after {:?} waiting for a connection", started.elapsed());
                PoolError::Timeout
            }
            sqlx::Error::PoolClosed => PoolError::Closed,
            other => {
                error!("Failed to acquire connection: {}", other);
                PoolError::Acquire(other.to_string())
            }
        })?;

        Ok(PooledConnection {
            conn: Some(conn),
            wait_time: started.elapsed(),
            acquired_at: Instant::now(),
            broken: false,
        })
    }

    pub fn stats(&self) -> PoolStats {
        match self.pool.read().as_ref() {
            Some(pool) => PoolStats {
                created: true,
                size: pool.size(),
                idle: pool.num_idle(),
                max_size: self.settings.max_connections,
            },
            None => PoolStats {
                created: false,
                size: 0,
                idle: 0,
                max_size: self.settings.max_connections,
            },
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the pool. Later acquisitions fail with [`PoolError::Closed`].
    pub async fn shutdown(&self) {
        let _guard = self.init_lock.lock().await;
        self.closed.store(true, Ordering::Release);
        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            pool.close().await;
            info!("Connection pool closed");
        }
    }
}

/// A connection checked out of the pool.
///
/// Returned to the pool on drop, unless marked broken, in which case it is
/// detached and closed instead.
pub struct PooledConnection {
    conn: Option<PoolConnection<Postgres>>,
    wait_time: Duration,
    acquired_at: Instant,
    broken: bool,
}

impl PooledConnection {
    pub fn connection(&mut self) -> anyhow::Result<&mut PgConnection> {
        match self.conn.as_mut() {
            Some(conn) if !self.broken => Ok(&mut **conn),
            _ => anyhow::bail!("connection is no longer usable"),
        }
    }

    /// Time spent waiting for the pool.
    pub fn wait_time(&self) -> Duration {
        self.wait_time
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.broken {
            if let Some(conn) = self.conn.take() {
                warn!("Discarding broken connection after {:?}", self.acquired_at.elapsed());
                drop(conn.detach());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PoolManager {
        PoolManager::new(DatabaseConfig::default(), PoolConfig::default())
    }

    #[test]
    fn test_stats_before_creation() {
        let stats = manager().stats();
        assert_eq!(
            stats,
            PoolStats {
                created: false,
                size: 0,
                idle: 0,
                max_size: 10
            }
        );
    }

    #[tokio::test]
    async fn test_acquire_after_shutdown_fails() {
        let pool = manager();
        pool.shutdown().await;
        assert!(pool.is_closed());
        let err = pool.acquire().await.err().map(Error::from);
        assert_eq!(
            err,
            Some(Error::PoolUnavailable("connection pool is shut down".to_string()))
        );
    }

    #[tokio::test]
    async fn test_unreachable_database_is_pool_unavailable() {
        let pool = PoolManager::new(
            DatabaseConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
                ..Default::default()
            },
            PoolConfig {
                acquire_timeout_secs: 1,
                ..Default::default()
            },
        );
        let err = pool.init().await.err().map(Error::from);
        assert!(matches!(err, Some(Error::PoolUnavailable(_))));
        assert!(!pool.stats().created);
    }

    #[test]
    fn test_connect_options_carry_application_name() {
        let options = manager().connect_options().unwrap();
        assert_eq!(options.get_application_name(), Some("sqlgate"));
    }
}
