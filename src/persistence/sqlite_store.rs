//! SQLite implementation of the StorageBackend trait
//!
//! Two tables: one row per user holding the latest sighting, and one row
//! per (user, address) pair holding the history. Saves run in a single
//! immediate transaction over a pooled connection.

use super::pool::ConnectionPool;
use super::{StorageBackend, StorageError};
use crate::config::RelationalStorageConfig;
use crate::models::{AddressRecord, UserProfile};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, TransactionBehavior};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// SQLite-based profile storage
pub struct SqliteBackend {
    config: RelationalStorageConfig,
    max_history_size: usize,
    users_table: String,
    history_table: String,
    /// `None` until initialized and after shutdown
    pool: RwLock<Option<ConnectionPool>>,
}

struct UserRow {
    display_name: String,
    current_address: Option<String>,
    current_location: Option<String>,
    current_isp: Option<String>,
    last_seen: Option<i64>,
}

struct HistoryRow {
    address: String,
    location: Option<String>,
    isp: Option<String>,
    first_seen: i64,
    last_seen: i64,
}

impl HistoryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(HistoryRow {
            address: row.get(0)?,
            location: row.get(1)?,
            isp: row.get(2)?,
            first_seen: row.get(3)?,
            last_seen: row.get(4)?,
        })
    }

    fn into_record(self) -> Result<AddressRecord, StorageError> {
        Ok(AddressRecord {
            address: self.address,
            first_seen: from_millis(self.first_seen)?,
            last_seen: from_millis(self.last_seen)?,
            location: self.location,
            isp: self.isp,
        })
    }
}

fn to_millis(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StorageError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StorageError::InvalidData(format!("Invalid timestamp: {}", millis)))
}

impl SqliteBackend {
    /// Create a backend for the configured database
    ///
    /// Nothing is opened until [`StorageBackend::initialize`].
    pub fn new(config: RelationalStorageConfig, max_history_size: usize) -> Self {
        let users_table = format!("{}users", config.table_prefix);
        let history_table = format!("{}history", config.table_prefix);
        SqliteBackend {
            config,
            max_history_size,
            users_table,
            history_table,
            pool: RwLock::new(None),
        }
    }

    fn read_pool(&self) -> Result<RwLockReadGuard<'_, Option<ConnectionPool>>, StorageError> {
        self.pool
            .read()
            .map_err(|_| StorageError::Unavailable("connection pool lock poisoned".to_string()))
    }

    fn write_pool(&self) -> Result<RwLockWriteGuard<'_, Option<ConnectionPool>>, StorageError> {
        self.pool
            .write()
            .map_err(|_| StorageError::Unavailable("connection pool lock poisoned".to_string()))
    }

    /// A handle to the live pool; the lock is not held while it is used
    fn pool(&self) -> Result<ConnectionPool, StorageError> {
        self.read_pool()?
            .as_ref()
            .cloned()
            .ok_or(StorageError::NotInitialized)
    }

    fn schema_sql(&self) -> String {
        include_str!("schema.sql").replace("{prefix}", &self.config.table_prefix)
    }

    fn prepare_database(&self, pool: &ConnectionPool) -> Result<(), StorageError> {
        let conn = pool.acquire()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(&self.schema_sql())?;
        Ok(())
    }

    fn save_with(&self, conn: &mut Connection, profile: &UserProfile) -> Result<(), StorageError> {
        // Dropping the transaction without commit rolls it back
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = to_millis(Utc::now());

        tx.execute(
            &format!(
                "INSERT INTO {users}
                 (id, display_name, current_address, current_location, current_isp, last_seen,
                  created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    display_name = excluded.display_name,
                    current_address = excluded.current_address,
                    current_location = excluded.current_location,
                    current_isp = excluded.current_isp,
                    last_seen = excluded.last_seen,
                    updated_at = excluded.updated_at",
                users = self.users_table
            ),
            params![
                profile.id,
                profile.display_name,
                profile.current_address,
                profile.current_location,
                profile.current_isp,
                profile.last_seen.map(to_millis),
                now
            ],
        )?;

        // Stored order is the profile's order, with equal timestamps kept stable
        let mut ordered = profile.history.clone();
        ordered.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));

        // Rows for addresses the profile no longer holds are replaced away
        let stale: Vec<String> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT address FROM {history} WHERE user_id = ?1",
                history = self.history_table
            ))?;
            let stored = stmt
                .query_map(params![profile.id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            stored
                .into_iter()
                .filter(|address| profile.find_record(address).is_none())
                .collect()
        };
        for address in &stale {
            tx.execute(
                &format!(
                    "DELETE FROM {history} WHERE user_id = ?1 AND address = ?2",
                    history = self.history_table
                ),
                params![profile.id, address],
            )?;
        }

        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {history}
                 (user_id, address, location, isp, first_seen, last_seen, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(user_id, address) DO UPDATE SET
                    location = excluded.location,
                    isp = excluded.isp,
                    first_seen = excluded.first_seen,
                    last_seen = excluded.last_seen,
                    position = excluded.position",
                history = self.history_table
            ))?;

            for (position, record) in ordered.iter().enumerate() {
                stmt.execute(params![
                    profile.id,
                    record.address,
                    record.location,
                    record.isp,
                    to_millis(record.first_seen),
                    to_millis(record.last_seen),
                    position as i64
                ])?;
            }
        }

        // Keep the newest rows by last_seen, drop the rest
        let evicted = tx.execute(
            &format!(
                "DELETE FROM {history} WHERE id IN (
                    SELECT id FROM (
                        SELECT id, ROW_NUMBER() OVER (ORDER BY last_seen DESC, position ASC) AS row_rank
                        FROM {history} WHERE user_id = ?1
                    ) WHERE row_rank > ?2
                 )",
                history = self.history_table
            ),
            params![profile.id, self.max_history_size as i64],
        )?;
        if evicted > 0 || !stale.is_empty() {
            log::debug!(
                "Dropped {} replaced and {} evicted records for {}",
                stale.len(),
                evicted,
                profile.id
            );
        }

        tx.commit()?;
        Ok(())
    }

    fn load_with(&self, conn: &Connection, id: &str) -> Result<Option<UserProfile>, StorageError> {
        let result = conn.query_row(
            &format!(
                "SELECT display_name, current_address, current_location, current_isp, last_seen
                 FROM {users} WHERE id = ?1",
                users = self.users_table
            ),
            params![id],
            |row| {
                Ok(UserRow {
                    display_name: row.get(0)?,
                    current_address: row.get(1)?,
                    current_location: row.get(2)?,
                    current_isp: row.get(3)?,
                    last_seen: row.get(4)?,
                })
            },
        );

        let user = match result {
            Ok(user) => user,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut stmt = conn.prepare(&format!(
            "SELECT address, location, isp, first_seen, last_seen
             FROM {history} WHERE user_id = ?1
             ORDER BY last_seen DESC, position ASC",
            history = self.history_table
        ))?;

        let history = stmt
            .query_map(params![id], HistoryRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(HistoryRow::into_record)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(UserProfile {
            id: id.to_string(),
            display_name: user.display_name,
            current_address: user.current_address,
            current_location: user.current_location,
            current_isp: user.current_isp,
            last_seen: user.last_seen.map(from_millis).transpose()?,
            history,
        }))
    }

    /// Run read-only queries inside one transaction so they see a single snapshot
    fn read<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError>,
    {
        let pool = self.pool()?;
        let mut conn = pool.acquire()?;
        let tx = conn.transaction()?;
        let value = f(&*tx)?;
        tx.commit()?;
        Ok(value)
    }
}

impl StorageBackend for SqliteBackend {
    fn initialize(&self) -> Result<(), StorageError> {
        let mut guard = self.write_pool()?;
        if guard.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Unavailable(format!(
                    "cannot create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let pool = ConnectionPool::open(
            &self.config.path,
            self.config.pool_size.max(1),
            Duration::from_secs(self.config.acquire_timeout_secs.max(1)),
        )?;
        self.prepare_database(&pool).map_err(|e| {
            StorageError::Unavailable(format!("cannot prepare schema: {}", e))
        })?;

        log::info!(
            "Relational storage initialized at {} (tables {}, {})",
            self.config.path.display(),
            self.users_table,
            self.history_table
        );
        *guard = Some(pool);
        Ok(())
    }

    fn shutdown(&self) {
        let mut guard = match self.pool.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Idle connections close once the last pool handle is dropped
        if guard.take().is_some() {
            log::info!("Relational storage at {} closed", self.config.path.display());
        }
    }

    fn save(&self, profile: &UserProfile) -> Result<(), StorageError> {
        let pool = self.pool()?;
        let mut conn = pool.acquire()?;
        self.save_with(&mut conn, profile).map_err(|e| {
            log::error!("Failed to save profile {}, rolled back: {}", profile.id, e);
            e
        })
    }

    fn load(&self, id: &str) -> Result<Option<UserProfile>, StorageError> {
        self.read(|conn| self.load_with(conn, id))
    }

    fn find_by_name(&self, name: &str) -> Result<Option<UserProfile>, StorageError> {
        self.read(|conn| {
            // display_name is NOCASE; latest sighting wins, then the smallest id
            let result = conn.query_row(
                &format!(
                    "SELECT id FROM {users} WHERE display_name = ?1
                     ORDER BY last_seen DESC, id ASC LIMIT 1",
                    users = self.users_table
                ),
                params![name],
                |row| row.get::<_, String>(0),
            );

            match result {
                Ok(id) => self.load_with(conn, &id),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn last_record(&self, id: &str) -> Result<Option<AddressRecord>, StorageError> {
        self.read(|conn| {
            let result = conn.query_row(
                &format!(
                    "SELECT address, location, isp, first_seen, last_seen
                     FROM {history} WHERE user_id = ?1
                     ORDER BY last_seen DESC, position ASC LIMIT 1",
                    history = self.history_table
                ),
                params![id],
                HistoryRow::from_row,
            );

            match result {
                Ok(row) => row.into_record().map(Some),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }
}
