//! Applying client batches to a sync table.
//!
//! # Rules
//!
//! | Change | Row on server | Result |
//! |--------|---------------|--------|
//! | created / updated | absent | insert |
//! | created / updated | live, unchanged since `last_pushed_at` | overwrite |
//! | created / updated | live, changed since `last_pushed_at` | policy decides |
//! | created / updated | soft-deleted | ignored |
//! | deleted | live | soft delete (policy decides on conflict) |
//! | deleted | absent or already deleted | ignored |
//!
//! `server_created_at`, `last_modified` and `deleted_at` are always assigned
//! by the server; client values for them are dropped.

use crate::row::json_to_value;
use crate::store::{quote, validate_identifier, SqliteStore, SERVER_COLUMNS};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tablesync_core::{ApplyReport, DeltaData, Direction, Record, SyncError, Watermark, ID_FIELD};

/// What to do with a client change to a row the server modified after the
/// client's `last_pushed_at`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Keep the server row and count the change as a conflict
    #[default]
    ServerWins,
    /// Apply the client change anyway
    ClientWins,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server-wins" | "server" => Ok(ConflictPolicy::ServerWins),
            "client-wins" | "client" => Ok(ConflictPolicy::ClientWins),
            other => Err(format!(
                "unknown conflict policy '{other}' (expected server-wins or client-wins)"
            )),
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::ServerWins => write!(f, "server-wins"),
            ConflictPolicy::ClientWins => write!(f, "client-wins"),
        }
    }
}

/// Failure while applying a batch.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ApplyError {
    /// A client record is malformed
    #[error("{0}")]
    Invalid(String),
    /// The store failed
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl ApplyError {
    pub(crate) fn into_sync_error(self, table: &str, store: &SqliteStore) -> SyncError {
        match self {
            ApplyError::Invalid(reason) => SyncError::InvalidRecord {
                entity: table.to_string(),
                reason,
            },
            ApplyError::Sqlite(err) => store.sync_error(table, Direction::Up, err),
        }
    }
}

/// Server-side state of a row relevant to conflict checks.
struct Existing {
    last_modified: i64,
    deleted: bool,
}

struct Applier<'a> {
    conn: &'a Connection,
    table: &'a str,
    columns: &'a [String],
    last_pushed_at: i64,
    policy: ConflictPolicy,
    now: i64,
}

/// Apply a whole client batch atomically.
///
/// Opens an immediate transaction, or a savepoint when the caller already
/// holds one. Nothing is written unless every record applies.
pub(crate) fn apply_batch(
    conn: &mut Connection,
    table: &str,
    columns: &[String],
    delta: &DeltaData,
    last_pushed_at: Watermark,
    policy: ConflictPolicy,
) -> Result<ApplyReport, ApplyError> {
    if columns.is_empty() {
        return Err(ApplyError::Invalid(format!("table '{table}' does not exist")));
    }

    if conn.is_autocommit() {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let report = apply_records(&tx, table, columns, delta, last_pushed_at, policy)?;
        tx.commit()?;
        Ok(report)
    } else {
        let sp = conn.savepoint()?;
        let report = apply_records(&sp, table, columns, delta, last_pushed_at, policy)?;
        sp.commit()?;
        Ok(report)
    }
}

fn apply_records(
    conn: &Connection,
    table: &str,
    columns: &[String],
    delta: &DeltaData,
    last_pushed_at: Watermark,
    policy: ConflictPolicy,
) -> Result<ApplyReport, ApplyError> {
    let applier = Applier {
        conn,
        table,
        columns,
        last_pushed_at: last_pushed_at.as_millis(),
        policy,
        now: Watermark::now().as_millis(),
    };

    let mut report = ApplyReport::default();
    for record in delta.created.iter().chain(&delta.updated) {
        applier.upsert(record, &mut report)?;
    }
    for record in &delta.deleted {
        applier.soft_delete(record, &mut report)?;
    }
    Ok(report)
}

impl Applier<'_> {
    fn upsert(&self, record: &Record, report: &mut ApplyReport) -> Result<(), ApplyError> {
        let id = require_id(record)?;
        let fields = self.client_fields(record)?;

        match self.lookup(&id)? {
            None => {
                self.insert(&id, fields)?;
                report.inserted += 1;
            }
            Some(existing) if existing.deleted => {
                tracing::debug!(table = self.table, id = ?id, "Ignoring change to deleted row");
                report.ignored += 1;
            }
            Some(existing) if self.in_conflict(&existing) => {
                tracing::warn!(
                    table = self.table,
                    id = ?id,
                    server_modified = existing.last_modified,
                    last_pushed_at = self.last_pushed_at,
                    "Skipping conflicting client change"
                );
                report.conflicts += 1;
            }
            Some(_) => {
                self.update(&id, fields)?;
                report.updated += 1;
            }
        }

        Ok(())
    }

    fn soft_delete(&self, record: &Record, report: &mut ApplyReport) -> Result<(), ApplyError> {
        let id = require_id(record)?;

        match self.lookup(&id)? {
            None => report.ignored += 1,
            Some(existing) if existing.deleted => report.ignored += 1,
            Some(existing) if self.in_conflict(&existing) => {
                tracing::warn!(
                    table = self.table,
                    id = ?id,
                    server_modified = existing.last_modified,
                    "Skipping conflicting client delete"
                );
                report.conflicts += 1;
            }
            Some(_) => {
                self.conn.execute(
                    &format!(
                        "UPDATE {} SET deleted_at = ?1, last_modified = ?1 WHERE id = ?2",
                        quote(self.table)
                    ),
                    (self.now, &id),
                )?;
                report.deleted += 1;
            }
        }

        Ok(())
    }

    fn in_conflict(&self, existing: &Existing) -> bool {
        self.policy == ConflictPolicy::ServerWins && existing.last_modified > self.last_pushed_at
    }

    /// Client columns to write, excluding `id` and server-assigned columns.
    fn client_fields<'r>(
        &self,
        record: &'r Record,
    ) -> Result<Vec<(&'r str, SqlValue)>, ApplyError> {
        let mut fields = Vec::with_capacity(record.len());
        for (name, value) in record {
            if name == ID_FIELD || SERVER_COLUMNS.contains(&name.as_str()) {
                continue;
            }
            if validate_identifier(name).is_err() || !self.columns.iter().any(|c| c == name) {
                return Err(ApplyError::Invalid(format!(
                    "unknown column '{name}' in table '{}'",
                    self.table
                )));
            }
            fields.push((name.as_str(), json_to_value(value)));
        }
        Ok(fields)
    }

    fn lookup(&self, id: &SqlValue) -> Result<Option<Existing>, ApplyError> {
        let existing = self
            .conn
            .query_row(
                &format!(
                    "SELECT last_modified, deleted_at IS NOT NULL FROM {} WHERE id = ?1",
                    quote(self.table)
                ),
                [id],
                |row| {
                    Ok(Existing {
                        last_modified: row.get(0)?,
                        deleted: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(existing)
    }

    fn insert(&self, id: &SqlValue, fields: Vec<(&str, SqlValue)>) -> Result<(), ApplyError> {
        let mut names = vec![ID_FIELD.to_string()];
        let mut values = Vec::with_capacity(fields.len() + 3);
        values.push(id.clone());

        for (name, value) in fields {
            names.push(quote(name));
            values.push(value);
        }
        names.push("server_created_at".to_string());
        values.push(SqlValue::Integer(self.now));
        names.push("last_modified".to_string());
        values.push(SqlValue::Integer(self.now));

        let placeholders = (1..=names.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            quote(self.table),
            names.join(", ")
        );

        self.conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    fn update(&self, id: &SqlValue, fields: Vec<(&str, SqlValue)>) -> Result<(), ApplyError> {
        let mut assignments = Vec::with_capacity(fields.len() + 1);
        let mut values = Vec::with_capacity(fields.len() + 2);

        for (idx, (name, value)) in fields.into_iter().enumerate() {
            assignments.push(format!("{} = ?{}", quote(name), idx + 1));
            values.push(value);
        }
        values.push(SqlValue::Integer(self.now));
        assignments.push(format!("last_modified = ?{}", values.len()));
        values.push(id.clone());

        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?{}",
            quote(self.table),
            assignments.join(", "),
            values.len()
        );

        self.conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }
}

fn require_id(record: &Record) -> Result<SqlValue, ApplyError> {
    match record.get(ID_FIELD) {
        Some(id @ (serde_json::Value::String(_) | serde_json::Value::Number(_))) => {
            Ok(json_to_value(id))
        }
        Some(other) => Err(ApplyError::Invalid(format!(
            "record id must be a string or number, got {other}"
        ))),
        None => Err(ApplyError::Invalid("record has no id".to_string())),
    }
}
