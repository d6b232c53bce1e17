//! Sync capabilities an entity type can provide.
//!
//! An entity opts into sync-down by implementing [`SyncDown`] and into
//! sync-up by implementing [`SyncUp`]. Implementing both makes it
//! [`Synchronizable`]; there is no extra behavior in the combination.

use crate::delta::DeltaData;
use crate::error::SyncError;
use crate::watermark::Watermark;
use serde::{Deserialize, Serialize};

/// Common identity of a syncable entity.
pub trait SyncEntity {
    /// Handle to the backing store the entity reads from and writes to.
    type Store;

    /// Name of the entity, which is also its table name.
    fn entity_name(&self) -> &str;
}

/// Server-to-client change propagation.
pub trait SyncDown: SyncEntity {
    /// Return the records created, updated and deleted since `last_sync_time`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] or [`SyncError::Timeout`] with
    /// [`Direction::Down`](crate::Direction::Down) when the store fails.
    fn get_delta_records(
        &self,
        last_sync_time: Watermark,
        store: &Self::Store,
    ) -> Result<DeltaData, SyncError>;
}

/// Client-to-server change propagation.
pub trait SyncUp: SyncEntity {
    /// Merge a client's changes into the store.
    ///
    /// `last_pushed_at` is the watermark of the client's previous successful
    /// push; rows the server modified after it are in conflict.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidRecord`] for malformed client records,
    /// and [`SyncError::Store`] or [`SyncError::Timeout`] with
    /// [`Direction::Up`](crate::Direction::Up) when the store fails.
    fn apply_delta_changes(
        &self,
        delta: &DeltaData,
        last_pushed_at: Watermark,
        store: &mut Self::Store,
    ) -> Result<ApplyReport, SyncError>;
}

/// An entity that syncs both ways.
pub trait Synchronizable: SyncDown + SyncUp {}

impl<T: SyncDown + SyncUp + ?Sized> Synchronizable for T {}

/// Store-wide scopes for operations that span several entities.
///
/// A pull or push touches every table in a request; these scopes make the
/// whole request behave as one unit against the store.
pub trait SyncStore {
    /// Run sync-down work that no concurrent write can straddle, returning
    /// the watermark the client should send on its next pull.
    ///
    /// Every write committed before the scope is visible to `work`, and every
    /// write committed after it carries a timestamp later than the returned
    /// watermark.
    ///
    /// # Errors
    ///
    /// Returns the error from `work`, or a [`Direction::Down`](crate::Direction::Down)
    /// store error if the scope cannot be opened.
    fn snapshot<T, F>(&self, work: F) -> Result<(Watermark, T), SyncError>
    where
        F: FnOnce(&Self) -> Result<T, SyncError>;

    /// Run sync-up work atomically: either everything `work` wrote is kept or
    /// nothing is.
    ///
    /// # Errors
    ///
    /// Returns the error from `work` after rolling back, or a
    /// [`Direction::Up`](crate::Direction::Up) store error if the scope cannot
    /// be opened or committed.
    fn atomically<T, F>(&mut self, work: F) -> Result<T, SyncError>
    where
        F: FnOnce(&mut Self) -> Result<T, SyncError>;
}

/// Outcome of applying one client batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// New rows inserted
    pub inserted: usize,
    /// Existing rows overwritten
    pub updated: usize,
    /// Rows soft-deleted
    pub deleted: usize,
    /// Changes skipped because the server row changed after `last_pushed_at`
    pub conflicts: usize,
    /// Changes that referred to rows the server does not have
    pub ignored: usize,
}

impl ApplyReport {
    /// Number of rows the batch changed.
    #[must_use]
    pub fn applied(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    /// Accumulate another report into this one.
    pub fn absorb(&mut self, other: ApplyReport) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.conflicts += other.conflicts;
        self.ignored += other.ignored;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_accumulate() {
        let mut total = ApplyReport {
            inserted: 2,
            conflicts: 1,
            ..ApplyReport::default()
        };
        total.absorb(ApplyReport {
            updated: 3,
            deleted: 1,
            ignored: 4,
            ..ApplyReport::default()
        });

        assert_eq!(total.applied(), 6);
        assert_eq!(total.conflicts, 1);
        assert_eq!(total.ignored, 4);
    }
}
