//! `SQLite` connection wrapper with a per-operation deadline.

use rusqlite::{Connection, ErrorCode, Result as SqliteResult};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tablesync_core::{Direction, SyncError, SyncStore, Watermark};

/// Columns every syncable table must carry.
pub const SYNC_COLUMNS: [&str; 4] = ["id", "server_created_at", "last_modified", "deleted_at"];

/// Columns the server assigns; client-supplied values for these are dropped.
pub const SERVER_COLUMNS: [&str; 3] = ["server_created_at", "last_modified", "deleted_at"];

/// `SQLite` virtual machine instructions between deadline checks.
const PROGRESS_OPS: i32 = 1_000;

/// Entity name reported for failures of a store-wide scope.
const ALL_TABLES: &str = "*";

/// Store access options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Upper bound on one sync operation, including lock waits.
    /// `Duration::ZERO` disables the bound.
    pub timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// `SQLite`-backed store holding the syncable tables.
pub struct SqliteStore {
    conn: Connection,
    options: StoreOptions,
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or configured.
    pub fn open(path: &Path, options: StoreOptions) -> SqliteResult<Self> {
        let store = Self::configure(Connection::open(path)?, options)?;
        store
            .conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory(options: StoreOptions) -> SqliteResult<Self> {
        Self::configure(Connection::open_in_memory()?, options)
    }

    fn configure(conn: Connection, options: StoreOptions) -> SqliteResult<Self> {
        conn.busy_timeout(options.timeout)?;
        Ok(Self { conn, options })
    }

    /// Borrow the underlying connection.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Create a table that satisfies the sync contract, with extra `TEXT`
    /// columns.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidEntity`] for bad identifiers, or a store
    /// error if the statement fails.
    pub fn create_sync_table(&self, table: &str, extra_columns: &[&str]) -> Result<(), SyncError> {
        validate_identifier(table)?;
        for column in extra_columns {
            validate_identifier(column)?;
            if SYNC_COLUMNS.contains(column) {
                return Err(SyncError::InvalidEntity {
                    name: table.to_string(),
                    reason: format!("column '{column}' is reserved"),
                });
            }
        }
        let columns: String = extra_columns
            .iter()
            .map(|column| format!("{} TEXT,\n", quote(column)))
            .collect();

        let quoted = quote(table);
        let sql = format!(
            r"
            CREATE TABLE IF NOT EXISTS {quoted} (
                id TEXT PRIMARY KEY NOT NULL,
                {columns}server_created_at INTEGER NOT NULL,
                last_modified INTEGER NOT NULL,
                deleted_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS {created_idx} ON {quoted}(server_created_at);
            CREATE INDEX IF NOT EXISTS {modified_idx} ON {quoted}(last_modified);
            CREATE INDEX IF NOT EXISTS {deleted_idx} ON {quoted}(deleted_at);
            ",
            created_idx = quote(&format!("idx_{table}_server_created_at")),
            modified_idx = quote(&format!("idx_{table}_last_modified")),
            deleted_idx = quote(&format!("idx_{table}_deleted_at")),
        );

        self.conn
            .execute_batch(&sql)
            .map_err(|e| SyncError::store(table, Direction::Up, e))?;

        tracing::info!(table, "Created sync table");
        Ok(())
    }

    /// Column names of a table, in declaration order. Empty if the table does
    /// not exist.
    ///
    /// # Errors
    ///
    /// Returns error if the pragma query fails.
    pub fn table_columns(&self, table: &str) -> SqliteResult<Vec<String>> {
        table_columns(&self.conn, table)
    }

    /// Run read-only work under the store deadline.
    pub(crate) fn read<T>(
        &self,
        work: impl FnOnce(&Connection) -> SqliteResult<T>,
    ) -> SqliteResult<T> {
        self.arm_deadline();
        let result = work(&self.conn);
        self.disarm_deadline();
        result
    }

    /// Run read-write work under the store deadline.
    pub(crate) fn write<T, E>(
        &mut self,
        work: impl FnOnce(&mut Connection) -> Result<T, E>,
    ) -> Result<T, E> {
        self.arm_deadline();
        let result = work(&mut self.conn);
        self.disarm_deadline();
        result
    }

    fn arm_deadline(&self) {
        if self.options.timeout.is_zero() {
            return;
        }
        let deadline = Instant::now() + self.options.timeout;
        self.conn
            .progress_handler(PROGRESS_OPS, Some(move || Instant::now() >= deadline));
    }

    fn disarm_deadline(&self) {
        self.conn.progress_handler(0, None::<fn() -> bool>);
    }

    fn rollback(&self) {
        if self.conn.is_autocommit() {
            return;
        }
        if let Err(err) = self.conn.execute_batch("ROLLBACK") {
            tracing::error!(error = %err, "Failed to roll back store transaction");
        }
    }

    /// Convert a `SQLite` failure into a sync error, classifying lock waits
    /// and deadline interrupts as timeouts.
    pub(crate) fn sync_error(
        &self,
        entity: &str,
        direction: Direction,
        err: rusqlite::Error,
    ) -> SyncError {
        if is_timeout(&err) {
            tracing::warn!(entity, %direction, timeout = ?self.options.timeout, "Store deadline exceeded");
            SyncError::Timeout {
                entity: entity.to_string(),
                direction,
                timeout: self.options.timeout,
            }
        } else {
            SyncError::store(entity, direction, err)
        }
    }
}

impl SyncStore for SqliteStore {
    /// Holds the write lock for the whole pull and keeps it until the clock
    /// has moved past the returned watermark.
    fn snapshot<T, F>(&self, work: F) -> Result<(Watermark, T), SyncError>
    where
        F: FnOnce(&Self) -> Result<T, SyncError>,
    {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| self.sync_error(ALL_TABLES, Direction::Down, e))?;

        let timestamp = Watermark::now();
        let result = work(self);

        while Watermark::now() <= timestamp {
            thread::sleep(Duration::from_micros(200));
        }

        let end = if result.is_ok() { "COMMIT" } else { "ROLLBACK" };
        if let Err(err) = self.conn.execute_batch(end) {
            self.rollback();
            return Err(self.sync_error(ALL_TABLES, Direction::Down, err));
        }

        Ok((timestamp, result?))
    }

    fn atomically<T, F>(&mut self, work: F) -> Result<T, SyncError>
    where
        F: FnOnce(&mut Self) -> Result<T, SyncError>,
    {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| self.sync_error(ALL_TABLES, Direction::Up, e))?;

        match work(self) {
            Ok(value) => match self.conn.execute_batch("COMMIT") {
                Ok(()) => Ok(value),
                Err(err) => {
                    self.rollback();
                    Err(self.sync_error(ALL_TABLES, Direction::Up, err))
                }
            },
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }
}

pub(crate) fn table_columns(conn: &Connection, table: &str) -> SqliteResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let columns = stmt
        .query_map([table], |row| row.get(0))?
        .collect::<SqliteResult<Vec<String>>>()?;
    Ok(columns)
}

fn is_timeout(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::OperationInterrupted
            )
    )
}

/// Reject anything but a plain SQL identifier.
///
/// # Errors
///
/// Returns [`SyncError::InvalidEntity`] naming the rejected identifier.
pub fn validate_identifier(name: &str) -> Result<(), SyncError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(SyncError::InvalidEntity {
            name: name.to_string(),
            reason: "not a plain SQL identifier".to_string(),
        })
    }
}

/// Quote a validated identifier.
pub(crate) fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_validated() {
        assert!(validate_identifier("patients").is_ok());
        assert!(validate_identifier("_visit_2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("2fast").is_err());
        assert!(validate_identifier("patients; DROP TABLE x").is_err());
        assert!(validate_identifier("a\"b").is_err());
    }

    #[test]
    fn create_sync_table_has_contract_columns() {
        let store = SqliteStore::in_memory(StoreOptions::default()).unwrap();
        store.create_sync_table("patients", &["given_name", "surname"]).unwrap();

        let columns = store.table_columns("patients").unwrap();
        assert_eq!(
            columns,
            [
                "id",
                "given_name",
                "surname",
                "server_created_at",
                "last_modified",
                "deleted_at"
            ]
        );
        assert!(store.table_columns("missing").unwrap().is_empty());
    }

    #[test]
    fn reserved_column_names_are_rejected() {
        let store = SqliteStore::in_memory(StoreOptions::default()).unwrap();
        let err = store.create_sync_table("visits", &["deleted_at"]).unwrap_err();
        assert!(matches!(err, SyncError::InvalidEntity { .. }));
    }

    #[test]
    fn interrupt_and_busy_count_as_timeouts() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let interrupted = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_INTERRUPT),
            None,
        );
        assert!(is_timeout(&busy));
        assert!(is_timeout(&interrupted));
        assert!(!is_timeout(&rusqlite::Error::QueryReturnedNoRows));
    }

    #[test]
    fn runaway_query_is_interrupted_at_the_deadline() {
        let store = SqliteStore::in_memory(StoreOptions {
            timeout: Duration::from_millis(1),
        })
        .unwrap();

        let started = Instant::now();
        let err = store
            .read(|conn| {
                conn.query_row(
                    "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 1000000000)
                     SELECT count(*) FROM n",
                    [],
                    |row| row.get::<_, i64>(0),
                )
            })
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(is_timeout(&err), "expected interrupt, got {err}");
        assert!(matches!(
            store.sync_error("patients", Direction::Down, err),
            SyncError::Timeout {
                direction: Direction::Down,
                ..
            }
        ));

        // The deadline is per operation; short work still runs afterwards.
        let one: i64 = store
            .read(|conn| conn.query_row("SELECT 1", [], |row| row.get(0)))
            .unwrap();
        assert_eq!(one, 1);
    }

    #[test]
    fn atomically_rolls_back_on_error() {
        let mut store = SqliteStore::in_memory(StoreOptions::default()).unwrap();
        store.create_sync_table("patients", &[]).unwrap();

        let err = store
            .atomically(|store| -> Result<(), SyncError> {
                store
                    .connection()
                    .execute(
                        "INSERT INTO patients (id, server_created_at, last_modified) VALUES ('p1', 1, 1)",
                        [],
                    )
                    .map_err(|e| SyncError::store("patients", Direction::Up, e))?;
                Err(SyncError::UnknownEntity("visits".to_string()))
            })
            .unwrap_err();

        assert!(matches!(err, SyncError::UnknownEntity(_)));
        assert!(store.connection().is_autocommit());
        let rows: i64 = store
            .connection()
            .query_row("SELECT count(*) FROM patients", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn snapshot_watermark_is_in_the_past_when_it_returns() {
        let store = SqliteStore::in_memory(StoreOptions::default()).unwrap();
        let (timestamp, ()) = store.snapshot(|_| Ok(())).unwrap();
        assert!(Watermark::now() > timestamp);
        assert!(store.connection().is_autocommit());
    }
}
