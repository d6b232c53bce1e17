//! Request handlers a sync endpoint calls.
//!
//! Transport is left to the caller: decode a request, call the handler with
//! the registry and a store handle, encode the response.

use crate::messages::{ChangeSet, PullRequest, PullResponse, PushRequest, PushResponse};
use std::collections::BTreeMap;
use tablesync_core::{SyncError, SyncRegistry, SyncStore};

/// Answer a pull.
///
/// All tables are read inside one store snapshot, and the response timestamp
/// comes from that snapshot. A write still in flight when the pull starts is
/// either seen by this pull or stamped after the returned timestamp.
///
/// # Errors
///
/// Returns the first failing table's error.
pub fn handle_pull<S: SyncStore>(
    registry: &SyncRegistry<S>,
    request: &PullRequest,
    store: &S,
) -> Result<PullResponse, SyncError> {
    let since = request.watermark();

    let (timestamp, changes) = store.snapshot(|store| match &request.tables {
        None => registry.pull_all(since, store),
        Some(tables) => tables
            .iter()
            .map(|name| Ok::<_, SyncError>((name.clone(), registry.pull(name, since, store)?)))
            .collect::<Result<ChangeSet, SyncError>>(),
    })?;

    tracing::debug!(
        %since,
        %timestamp,
        tables = changes.len(),
        "Pull handled"
    );

    Ok(PullResponse::new(changes, timestamp))
}

/// Apply a push, table by table in name order.
///
/// The whole request is one atomic unit: if any table fails, no table keeps
/// its changes and the client can retry with the same `last_pushed_at`.
///
/// # Errors
///
/// Returns the first failing table's error.
pub fn handle_push<S: SyncStore>(
    registry: &SyncRegistry<S>,
    request: &PushRequest,
    store: &mut S,
) -> Result<PushResponse, SyncError> {
    let applied = store.atomically(|store| {
        let mut applied = BTreeMap::new();
        for (name, delta) in &request.changes {
            if delta.is_empty() {
                continue;
            }
            let report = registry.push(name, delta, request.last_pushed_at, store)?;
            applied.insert(name.clone(), report);
        }
        Ok(applied)
    })?;

    let response = PushResponse::new(applied);
    let total = response.total();
    tracing::debug!(
        tables = response.applied.len(),
        applied = total.applied(),
        ignored = total.ignored,
        "Push handled"
    );
    if total.conflicts > 0 {
        tracing::warn!(
            conflicts = total.conflicts,
            last_pushed_at = %request.last_pushed_at,
            "Push skipped conflicting changes"
        );
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{RefCell, RefMut};
    use tablesync_core::{
        ApplyReport, DeltaData, Direction, Record, SyncDown, SyncEntity, SyncUp, Watermark,
    };

    #[derive(Default)]
    struct Log {
        pulls: Vec<(String, Watermark)>,
        pushes: Vec<(String, usize)>,
        snapshots: usize,
        rollbacks: usize,
    }

    /// Store that records what the handlers asked of it.
    #[derive(Default)]
    struct Recorder(RefCell<Log>);

    impl Recorder {
        fn log(&self) -> RefMut<'_, Log> {
            self.0.borrow_mut()
        }
    }

    impl SyncStore for Recorder {
        fn snapshot<T, F>(&self, work: F) -> Result<(Watermark, T), SyncError>
        where
            F: FnOnce(&Self) -> Result<T, SyncError>,
        {
            self.log().snapshots += 1;
            let timestamp = Watermark::now();
            Ok((timestamp, work(self)?))
        }

        fn atomically<T, F>(&mut self, work: F) -> Result<T, SyncError>
        where
            F: FnOnce(&mut Self) -> Result<T, SyncError>,
        {
            let pushes = self.log().pushes.len();
            let result = work(self);
            if result.is_err() {
                let mut log = self.log();
                log.pushes.truncate(pushes);
                log.rollbacks += 1;
            }
            result
        }
    }

    struct Table(&'static str);

    impl SyncEntity for Table {
        type Store = Recorder;

        fn entity_name(&self) -> &str {
            self.0
        }
    }

    impl SyncDown for Table {
        fn get_delta_records(
            &self,
            last_sync_time: Watermark,
            store: &Recorder,
        ) -> Result<DeltaData, SyncError> {
            store.log().pulls.push((self.0.to_string(), last_sync_time));
            Ok(DeltaData::default())
        }
    }

    impl SyncUp for Table {
        fn apply_delta_changes(
            &self,
            delta: &DeltaData,
            _last_pushed_at: Watermark,
            store: &mut Recorder,
        ) -> Result<ApplyReport, SyncError> {
            store.log().pushes.push((self.0.to_string(), delta.len()));
            Ok(ApplyReport {
                inserted: delta.created.len(),
                ..ApplyReport::default()
            })
        }
    }

    fn registry() -> SyncRegistry<Recorder> {
        let mut registry = SyncRegistry::new();
        registry.register(Table("patients")).unwrap();
        registry.register_down(Table("clinics")).unwrap();
        registry
    }

    #[test]
    fn pull_defaults_to_every_table_from_epoch() {
        let store = Recorder::default();
        let response = handle_pull(&registry(), &PullRequest::default(), &store).unwrap();

        assert_eq!(response.changes.len(), 2);
        assert!(response.timestamp > Watermark::EPOCH);
        let log = store.log();
        assert_eq!(log.snapshots, 1);
        assert!(log.pulls.iter().all(|(_, since)| *since == Watermark::EPOCH));
    }

    #[test]
    fn pull_of_named_tables_only() {
        let store = Recorder::default();
        let request = PullRequest {
            last_pulled_at: Some(Watermark::from_millis(5)),
            tables: Some(vec!["clinics".to_string()]),
        };

        let response = handle_pull(&registry(), &request, &store).unwrap();

        assert_eq!(response.changes.keys().collect::<Vec<_>>(), ["clinics"]);
        assert_eq!(
            store.log().pulls,
            vec![("clinics".to_string(), Watermark::from_millis(5))]
        );
    }

    #[test]
    fn push_skips_empty_batches_and_rejects_down_only_tables() {
        let mut store = Recorder::default();
        let mut changes = ChangeSet::new();
        changes.insert("clinics".to_string(), DeltaData::default());
        changes.insert(
            "patients".to_string(),
            DeltaData::new(vec![Record::new()], vec![], vec![]),
        );
        let request = PushRequest::new(changes.clone(), Watermark::EPOCH);

        let response = handle_push(&registry(), &request, &mut store).unwrap();
        assert_eq!(response.applied.len(), 1);
        assert_eq!(response.applied["patients"].inserted, 1);
        assert_eq!(response.total().applied(), 1);

        changes.insert(
            "clinics".to_string(),
            DeltaData::new(vec![], vec![], vec![DeltaData::deleted_marker("c1")]),
        );
        let request = PushRequest::new(changes, Watermark::EPOCH);
        let err = handle_push(&registry(), &request, &mut store).unwrap_err();
        assert!(matches!(
            err,
            SyncError::NotImplemented {
                capability: Direction::Up,
                ..
            }
        ));
        assert_eq!(store.log().rollbacks, 1);
    }

    #[test]
    fn failed_push_keeps_no_table() {
        let mut store = Recorder::default();
        let mut changes = ChangeSet::new();
        changes.insert(
            "patients".to_string(),
            DeltaData::new(vec![Record::new()], vec![], vec![]),
        );
        changes.insert(
            "zones".to_string(),
            DeltaData::new(vec![Record::new()], vec![], vec![]),
        );

        let err = handle_push(
            &registry(),
            &PushRequest::new(changes, Watermark::EPOCH),
            &mut store,
        )
        .unwrap_err();

        assert!(matches!(err, SyncError::UnknownEntity(name) if name == "zones"));
        let log = store.log();
        assert!(log.pushes.is_empty());
        assert_eq!(log.rollbacks, 1);
    }
}
