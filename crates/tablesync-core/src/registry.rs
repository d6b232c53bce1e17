//! Name-based dispatch over syncable entities.
//!
//! A sync endpoint receives table names from clients. The registry maps each
//! name to the capabilities its entity was registered with, so a push to a
//! table that only syncs down fails with [`SyncError::NotImplemented`] instead
//! of reaching the store.

use crate::delta::DeltaData;
use crate::entity::{ApplyReport, SyncDown, SyncUp, Synchronizable};
use crate::error::{Direction, SyncError};
use crate::watermark::Watermark;
use std::collections::BTreeMap;
use std::sync::Arc;

type DownHandle<S> = Arc<dyn SyncDown<Store = S> + Send + Sync>;
type UpHandle<S> = Arc<dyn SyncUp<Store = S> + Send + Sync>;

struct Registration<S> {
    down: DownHandle<S>,
    up: Option<UpHandle<S>>,
}

/// Capabilities an entity was registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Supports sync-down
    pub down: bool,
    /// Supports sync-up
    pub up: bool,
}

/// Registry of syncable entities sharing one store type.
pub struct SyncRegistry<S> {
    entries: BTreeMap<String, Registration<S>>,
}

impl<S> Default for SyncRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> SyncRegistry<S> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Register an entity that only syncs down.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidEntity`] if the name is already taken.
    pub fn register_down<E>(&mut self, entity: E) -> Result<(), SyncError>
    where
        E: SyncDown<Store = S> + Send + Sync + 'static,
    {
        let name = entity.entity_name().to_string();
        self.insert(
            name,
            Registration {
                down: Arc::new(entity),
                up: None,
            },
        )
    }

    /// Register an entity that syncs both ways.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidEntity`] if the name is already taken.
    pub fn register<E>(&mut self, entity: E) -> Result<(), SyncError>
    where
        E: Synchronizable<Store = S> + Send + Sync + 'static,
    {
        let name = entity.entity_name().to_string();
        let entity = Arc::new(entity);
        let down: DownHandle<S> = entity.clone();
        let up: UpHandle<S> = entity;
        self.insert(name, Registration { down, up: Some(up) })
    }

    fn insert(&mut self, name: String, registration: Registration<S>) -> Result<(), SyncError> {
        if self.entries.contains_key(&name) {
            return Err(SyncError::InvalidEntity {
                name,
                reason: "already registered".to_string(),
            });
        }

        tracing::debug!(
            entity = %name,
            sync_up = registration.up.is_some(),
            "Registered syncable entity"
        );
        self.entries.insert(name, registration);
        Ok(())
    }

    /// Registered entity names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of registered entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Capabilities of a registered entity.
    #[must_use]
    pub fn capabilities(&self, name: &str) -> Option<Capabilities> {
        self.entries.get(name).map(|r| Capabilities {
            down: true,
            up: r.up.is_some(),
        })
    }

    /// Compute the delta for one entity.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownEntity`] for unregistered names, otherwise
    /// whatever the entity's sync-down returns.
    pub fn pull(&self, name: &str, since: Watermark, store: &S) -> Result<DeltaData, SyncError> {
        let registration = self
            .entries
            .get(name)
            .ok_or_else(|| SyncError::UnknownEntity(name.to_string()))?;

        let delta = registration.down.get_delta_records(since, store)?;

        tracing::info!(
            entity = name,
            %since,
            created = delta.created.len(),
            updated = delta.updated.len(),
            deleted = delta.deleted.len(),
            "Computed sync-down delta"
        );

        Ok(delta)
    }

    /// Compute deltas for every registered entity.
    ///
    /// # Errors
    ///
    /// Stops at the first entity that fails.
    pub fn pull_all(
        &self,
        since: Watermark,
        store: &S,
    ) -> Result<BTreeMap<String, DeltaData>, SyncError> {
        self.entries
            .keys()
            .map(|name| Ok::<_, SyncError>((name.clone(), self.pull(name, since, store)?)))
            .collect()
    }

    /// Apply a client batch to one entity.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownEntity`] for unregistered names,
    /// [`SyncError::NotImplemented`] for down-only entities, otherwise
    /// whatever the entity's sync-up returns.
    pub fn push(
        &self,
        name: &str,
        delta: &DeltaData,
        last_pushed_at: Watermark,
        store: &mut S,
    ) -> Result<ApplyReport, SyncError> {
        let registration = self
            .entries
            .get(name)
            .ok_or_else(|| SyncError::UnknownEntity(name.to_string()))?;

        let up = registration
            .up
            .as_ref()
            .ok_or_else(|| SyncError::NotImplemented {
                entity: name.to_string(),
                capability: Direction::Up,
            })?;

        let report = up.apply_delta_changes(delta, last_pushed_at, store)?;

        tracing::info!(
            entity = name,
            %last_pushed_at,
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            conflicts = report.conflicts,
            "Applied sync-up batch"
        );

        Ok(report)
    }
}
