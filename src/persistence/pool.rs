//! Bounded SQLite connection pool
//!
//! A fixed number of connections is opened up front. Checkout waits a
//! bounded time for a pooled connection and then falls back to a fresh
//! connection that is closed when dropped. Pooled connections are checked
//! for liveness before they are handed out and go back to the pool on drop.

use super::StorageError;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection settings, applied to pooled and ad hoc connections alike
fn configure(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(())
}

#[derive(Debug)]
struct ConnectionSetup;

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for ConnectionSetup {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        configure(conn)
    }
}

/// A connection borrowed from [`ConnectionPool::acquire`]
pub enum PooledConnection {
    /// Returned to the pool when dropped
    Pooled(r2d2::PooledConnection<SqliteConnectionManager>),
    /// Opened because the pool was exhausted; closed when dropped
    AdHoc(Connection),
}

impl PooledConnection {
    pub fn is_pooled(&self) -> bool {
        matches!(self, PooledConnection::Pooled(_))
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            PooledConnection::Pooled(conn) => &**conn,
            PooledConnection::AdHoc(conn) => conn,
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        match self {
            PooledConnection::Pooled(conn) => &mut **conn,
            PooledConnection::AdHoc(conn) => conn,
        }
    }
}

/// Fixed-size pool of connections to one database file
#[derive(Clone)]
pub struct ConnectionPool {
    path: PathBuf,
    pool: Pool<SqliteConnectionManager>,
}

impl ConnectionPool {
    /// Open `size` connections to the database at `path`
    ///
    /// Fails with [`StorageError::Unavailable`] if the connections cannot be
    /// established within `acquire_timeout`.
    pub fn open<P: AsRef<Path>>(
        path: P,
        size: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let manager = SqliteConnectionManager::file(&path);

        let pool = Pool::builder()
            .max_size(size)
            .min_idle(Some(size))
            .test_on_check_out(true)
            .connection_timeout(acquire_timeout)
            .connection_customizer(Box::new(ConnectionSetup))
            .build(manager)
            .map_err(|e| {
                StorageError::Unavailable(format!(
                    "cannot open database {}: {}",
                    path.display(),
                    e
                ))
            })?;

        log::info!(
            "Opened connection pool for {} with {} connections",
            path.display(),
            pool.state().connections
        );

        Ok(ConnectionPool { path, pool })
    }

    /// Check out a connection
    ///
    /// Waits up to the pool's acquire timeout, then opens an extra
    /// connection instead of blocking further.
    pub fn acquire(&self) -> Result<PooledConnection, StorageError> {
        match self.pool.get() {
            Ok(conn) => Ok(PooledConnection::Pooled(conn)),
            Err(e) => {
                log::warn!(
                    "Connection pool exhausted ({}), opening an extra connection to {}",
                    e,
                    self.path.display()
                );
                let conn = Connection::open(&self.path)?;
                configure(&conn)?;
                Ok(PooledConnection::AdHoc(conn))
            }
        }
    }

    /// Number of connections currently held by the pool, and how many are idle
    pub fn state(&self) -> (u32, u32) {
        let state = self.pool.state();
        (state.connections, state.idle_connections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_pool(size: u32) -> (tempfile::TempDir, ConnectionPool) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let pool = ConnectionPool::open(
            dir.path().join("pool.db"),
            size,
            Duration::from_millis(200),
        )
        .expect("Failed to open pool");
        (dir, pool)
    }

    #[test]
    fn test_connections_established_up_front() {
        let (_dir, pool) = create_test_pool(3);
        assert_eq!(pool.state(), (3, 3));
    }

    #[test]
    fn test_connection_returned_on_drop() {
        let (_dir, pool) = create_test_pool(2);

        {
            let conn = pool.acquire().unwrap();
            assert!(conn.is_pooled());
            assert_eq!(pool.state().1, 1);
        }

        assert_eq!(pool.state(), (2, 2));
    }

    #[test]
    fn test_exhausted_pool_opens_extra_connection() {
        let (_dir, pool) = create_test_pool(1);

        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        assert!(first.is_pooled());
        assert!(!second.is_pooled());

        let value: i64 = second.query_row("SELECT 1", [], |row| row.get(0)).unwrap();
        assert_eq!(value, 1);

        drop(second);
        drop(first);
        // The extra connection is closed, not added to the pool
        assert_eq!(pool.state(), (1, 1));
    }

    #[test]
    fn test_connections_are_configured() {
        let (_dir, pool) = create_test_pool(1);
        let conn = pool.acquire().unwrap();
        let enabled: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[test]
    fn test_unreachable_database() {
        let dir = tempfile::tempdir().unwrap();
        let result = ConnectionPool::open(
            dir.path().join("missing").join("pool.db"),
            1,
            Duration::from_millis(100),
        );
        assert!(matches!(result, Err(StorageError::Unavailable(_))));
    }
}
