//! Table-backed syncable entities.

use crate::apply::{apply_batch, ApplyError, ConflictPolicy};
use crate::row::row_to_record;
use crate::store::{quote, table_columns, validate_identifier, SqliteStore, SYNC_COLUMNS};
use rusqlite::{Connection, Result as SqliteResult};
use tablesync_core::{
    ApplyReport, DeltaData, Direction, Record, SyncDown, SyncEntity, SyncError, SyncUp, Watermark,
};

/// A table that syncs down.
///
/// Any table with `id`, `server_created_at`, `last_modified` and
/// `deleted_at` columns qualifies. The timestamp columns hold epoch
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntity {
    table: String,
}

impl TableEntity {
    /// Create an entity for a table.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidEntity`] if the name is not a plain SQL
    /// identifier.
    pub fn new(table: impl Into<String>) -> Result<Self, SyncError> {
        let table = table.into();
        validate_identifier(&table)?;
        Ok(Self { table })
    }

    /// The table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Check that the table exists and carries the sync columns.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidEntity`] listing missing columns.
    pub fn verify(&self, store: &SqliteStore) -> Result<(), SyncError> {
        let columns = store
            .table_columns(&self.table)
            .map_err(|e| SyncError::store(&self.table, Direction::Down, e))?;

        if columns.is_empty() {
            return Err(SyncError::InvalidEntity {
                name: self.table.clone(),
                reason: "table does not exist".to_string(),
            });
        }

        let missing: Vec<&str> = SYNC_COLUMNS
            .iter()
            .copied()
            .filter(|required| !columns.iter().any(|c| c == required))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(SyncError::InvalidEntity {
                name: self.table.clone(),
                reason: format!("missing sync columns: {}", missing.join(", ")),
            })
        }
    }

    fn query_delta(&self, conn: &Connection, since: Watermark) -> SqliteResult<DeltaData> {
        if !conn.is_autocommit() {
            // Already inside a store-wide snapshot.
            return self.select_delta(conn, since);
        }

        // One read transaction so all three queries see the same snapshot.
        let tx = conn.unchecked_transaction()?;
        let delta = self.select_delta(&tx, since)?;
        tx.commit()?;
        Ok(delta)
    }

    fn select_delta(&self, conn: &Connection, since: Watermark) -> SqliteResult<DeltaData> {
        let table = quote(&self.table);
        let since = since.as_millis();

        let created = select_records(
            conn,
            &format!("SELECT * FROM {table} WHERE server_created_at > ?1 AND deleted_at IS NULL"),
            since,
        )?;

        let updated = select_records(
            conn,
            &format!(
                "SELECT * FROM {table} WHERE last_modified > ?1 AND server_created_at < ?1 AND deleted_at IS NULL"
            ),
            since,
        )?;

        let deleted = select_records(
            conn,
            &format!("SELECT id FROM {table} WHERE deleted_at > ?1"),
            since,
        )?;

        Ok(DeltaData::new(created, updated, deleted))
    }
}

fn select_records(conn: &Connection, sql: &str, since: i64) -> SqliteResult<Vec<Record>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let records = stmt
        .query_map([since], |row| row_to_record(row, &columns))?
        .collect::<SqliteResult<Vec<Record>>>()?;
    Ok(records)
}

impl SyncEntity for TableEntity {
    type Store = SqliteStore;

    fn entity_name(&self) -> &str {
        &self.table
    }
}

impl SyncDown for TableEntity {
    fn get_delta_records(
        &self,
        last_sync_time: Watermark,
        store: &SqliteStore,
    ) -> Result<DeltaData, SyncError> {
        tracing::debug!(table = %self.table, since = %last_sync_time, "Querying delta records");

        store
            .read(|conn| self.query_delta(conn, last_sync_time))
            .map_err(|e| store.sync_error(&self.table, Direction::Down, e))
    }
}

/// A table that syncs both ways, applying client batches with
/// a [`ConflictPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTable {
    entity: TableEntity,
    policy: ConflictPolicy,
}

impl SyncTable {
    /// Create a bidirectional entity for a table.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidEntity`] if the name is not a plain SQL
    /// identifier.
    pub fn new(table: impl Into<String>, policy: ConflictPolicy) -> Result<Self, SyncError> {
        Ok(Self {
            entity: TableEntity::new(table)?,
            policy,
        })
    }
}

impl SyncEntity for SyncTable {
    type Store = SqliteStore;

    fn entity_name(&self) -> &str {
        self.entity.table()
    }
}

impl SyncDown for SyncTable {
    fn get_delta_records(
        &self,
        last_sync_time: Watermark,
        store: &SqliteStore,
    ) -> Result<DeltaData, SyncError> {
        self.entity.get_delta_records(last_sync_time, store)
    }
}

impl SyncUp for SyncTable {
    fn apply_delta_changes(
        &self,
        delta: &DeltaData,
        last_pushed_at: Watermark,
        store: &mut SqliteStore,
    ) -> Result<ApplyReport, SyncError> {
        let table = self.entity.table();
        let policy = self.policy;

        tracing::debug!(
            table,
            %last_pushed_at,
            records = delta.len(),
            ?policy,
            "Applying client batch"
        );

        let result = store.write(|conn| -> Result<ApplyReport, ApplyError> {
            let columns = table_columns(conn, table)?;
            apply_batch(conn, table, &columns, delta, last_pushed_at, policy)
        });

        result.map_err(|e| e.into_sync_error(table, store))
    }
}
