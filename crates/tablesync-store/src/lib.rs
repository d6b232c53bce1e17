//! # tablesync store
//!
//! `SQLite` implementation of the sync capabilities.
//!
//! - [`TableEntity`]: sync-down for any table carrying `id`,
//!   `server_created_at`, `last_modified` and `deleted_at`
//! - [`SyncTable`]: sync-down plus sync-up with a [`ConflictPolicy`]
//! - [`SqliteStore`]: connection wrapper that bounds every sync operation by
//!   a caller-supplied timeout

#![warn(missing_docs)]
#![warn(clippy::all)]

mod apply;
mod entity;
mod row;
mod store;

pub use apply::ConflictPolicy;
pub use entity::{SyncTable, TableEntity};
pub use store::{validate_identifier, SqliteStore, StoreOptions, SERVER_COLUMNS, SYNC_COLUMNS};
