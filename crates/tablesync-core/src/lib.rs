//! # tablesync core
//!
//! Store-agnostic building blocks for incremental table synchronization.
//!
//! This crate provides:
//! - [`DeltaData`], the created/updated/deleted batches exchanged with clients
//! - [`Watermark`], the "last synced at" boundary a client sends back
//! - [`SyncDown`] / [`SyncUp`] capability traits and the [`Synchronizable`] union
//! - [`SyncStore`] scopes that make a multi-table pull or push one unit
//! - [`SyncRegistry`] for dispatching pulls and pushes by entity name

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod delta;
pub mod entity;
pub mod error;
pub mod registry;
pub mod watermark;

pub use delta::{classify, record_id, ChangeKind, DeltaData, Record, ID_FIELD};
pub use entity::{ApplyReport, SyncDown, SyncEntity, SyncStore, SyncUp, Synchronizable};
pub use error::{BoxError, Direction, SyncError};
pub use registry::{Capabilities, SyncRegistry};
pub use watermark::{Watermark, WatermarkError};
