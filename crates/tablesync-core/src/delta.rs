//! The delta value exchanged between producer, consumer and transport.
//!
//! # Classification
//!
//! For a watermark `t`, a row is classified as:
//!
//! | Kind | Predicate |
//! |------|-----------|
//! | created | `server_created_at > t` and `deleted_at` is null |
//! | updated | `last_modified > t` and `server_created_at < t` and `deleted_at` is null |
//! | deleted | `deleted_at > t` (identifier only) |
//!
//! A row created exactly at `t` (`server_created_at == t`) matches neither
//! `created` nor `updated`.

use crate::watermark::Watermark;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// A single row: field name to value.
pub type Record = Map<String, Value>;

/// Name of the identifier field every syncable record carries.
pub const ID_FIELD: &str = "id";

/// The category a changed row falls into for one delta computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Inserted after the watermark
    Created,
    /// Modified after the watermark, created before it
    Updated,
    /// Soft-deleted after the watermark
    Deleted,
}

impl ChangeKind {
    /// All kinds, in wire order.
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Created, ChangeKind::Updated, ChangeKind::Deleted];

    /// The serialized key for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

/// Classify a row's sync timestamps against a watermark.
///
/// Mirrors the sync-down queries exactly, so stores that cannot run SQL
/// produce the same deltas.
#[must_use]
pub fn classify(
    server_created_at: Watermark,
    last_modified: Watermark,
    deleted_at: Option<Watermark>,
    since: Watermark,
) -> Option<ChangeKind> {
    match deleted_at {
        Some(deleted_at) if deleted_at > since => Some(ChangeKind::Deleted),
        Some(_) => None,
        None if server_created_at > since => Some(ChangeKind::Created),
        None if last_modified > since && server_created_at < since => Some(ChangeKind::Updated),
        None => None,
    }
}

/// Records created, updated and deleted since a watermark.
///
/// Serializes as a mapping with exactly three keys. Missing keys deserialize
/// as empty lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeltaData {
    /// Rows inserted after the watermark
    #[serde(default)]
    pub created: Vec<Record>,
    /// Rows modified after the watermark
    #[serde(default)]
    pub updated: Vec<Record>,
    /// Rows soft-deleted after the watermark, identifier only
    #[serde(default)]
    pub deleted: Vec<Record>,
}

impl DeltaData {
    /// Create a delta from the three batches.
    #[must_use]
    pub fn new(created: Vec<Record>, updated: Vec<Record>, deleted: Vec<Record>) -> Self {
        Self {
            created,
            updated,
            deleted,
        }
    }

    /// Build the minimal deleted-record form from an identifier.
    #[must_use]
    pub fn deleted_marker(id: impl Into<Value>) -> Record {
        let mut record = Record::new();
        record.insert(ID_FIELD.to_string(), id.into());
        record
    }

    /// The batch for a given kind.
    #[must_use]
    pub fn records(&self, kind: ChangeKind) -> &[Record] {
        match kind {
            ChangeKind::Created => &self.created,
            ChangeKind::Updated => &self.updated,
            ChangeKind::Deleted => &self.deleted,
        }
    }

    /// Mutable access to the batch for a given kind.
    pub fn records_mut(&mut self, kind: ChangeKind) -> &mut Vec<Record> {
        match kind {
            ChangeKind::Created => &mut self.created,
            ChangeKind::Updated => &mut self.updated,
            ChangeKind::Deleted => &mut self.deleted,
        }
    }

    /// Total number of records across all three batches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    /// True when no batch holds any record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identifiers in one batch, rendered as strings, in batch order.
    /// Records without an `id` are skipped.
    #[must_use]
    pub fn ids_of(&self, kind: ChangeKind) -> Vec<String> {
        self.records(kind).iter().filter_map(record_id).collect()
    }

    /// Identifiers that appear in more than one batch, with the batches
    /// they appear in.
    ///
    /// An empty result means the classification held for this delta.
    #[must_use]
    pub fn overlapping_ids(&self) -> BTreeMap<String, BTreeSet<ChangeKind>> {
        let mut seen: BTreeMap<String, BTreeSet<ChangeKind>> = BTreeMap::new();
        for kind in ChangeKind::ALL {
            for id in self.ids_of(kind) {
                seen.entry(id).or_default().insert(kind);
            }
        }
        seen.retain(|_, kinds| kinds.len() > 1);
        seen
    }

    /// Convert into the three-key mapping.
    #[must_use]
    pub fn into_map(self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("created".to_string(), to_array(self.created));
        map.insert("updated".to_string(), to_array(self.updated));
        map.insert("deleted".to_string(), to_array(self.deleted));
        map
    }

    /// Rebuild from the three-key mapping.
    ///
    /// # Errors
    ///
    /// Returns error if a key is unknown or a batch is not a list of objects.
    pub fn from_map(map: Map<String, Value>) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(map))
    }
}

/// The identifier of a record as a string, if it has a string or numeric `id`.
#[must_use]
pub fn record_id(record: &Record) -> Option<String> {
    match record.get(ID_FIELD)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn to_array(records: Vec<Record>) -> Value {
    Value::Array(records.into_iter().map(Value::Object).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    const T: Watermark = Watermark::from_millis(10_000);

    #[test]
    fn classify_created_after_watermark() {
        assert_eq!(
            classify(T.offset(1), T.offset(1), None, T),
            Some(ChangeKind::Created)
        );
    }

    #[test]
    fn classify_updated_only_when_created_before() {
        assert_eq!(
            classify(T.offset(-1), T.offset(1), None, T),
            Some(ChangeKind::Updated)
        );
        assert_eq!(classify(T.offset(-5), T.offset(-1), None, T), None);
    }

    #[test]
    fn classify_deleted_wins_over_created() {
        assert_eq!(
            classify(T.offset(1), T.offset(2), Some(T.offset(3)), T),
            Some(ChangeKind::Deleted)
        );
        assert_eq!(classify(T.offset(-5), T.offset(-4), Some(T.offset(-3)), T), None);
    }

    #[test]
    fn classify_created_exactly_at_watermark_is_missed() {
        // Regression target: strict inequalities on both sides leave a gap.
        assert_eq!(classify(T, T.offset(5), None, T), None);
    }

    #[test]
    fn missing_keys_default_to_empty() {
        let delta: DeltaData = serde_json::from_str("{}").unwrap();
        assert!(delta.created.is_empty());
        assert!(delta.updated.is_empty());
        assert!(delta.deleted.is_empty());
        assert!(delta.is_empty());
    }

    #[test]
    fn serializes_exactly_three_keys() {
        let value = serde_json::to_value(DeltaData::default()).unwrap();
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys.len(), 3);
        for key in ["created", "updated", "deleted"] {
            assert_eq!(value[key], json!([]));
        }
    }

    #[test]
    fn map_roundtrip_preserves_order() {
        let delta = DeltaData::new(
            vec![
                record(json!({"id": "b", "name": "second"})),
                record(json!({"id": "a", "name": "first"})),
            ],
            vec![record(json!({"id": "c", "age": 4}))],
            vec![DeltaData::deleted_marker("d"), DeltaData::deleted_marker(7)],
        );

        let back = DeltaData::from_map(delta.clone().into_map()).unwrap();
        assert_eq!(back, delta);
        assert_eq!(back.ids_of(ChangeKind::Created), vec!["b", "a"]);
        assert_eq!(back.ids_of(ChangeKind::Deleted), vec!["d", "7"]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<DeltaData, _> = serde_json::from_str(r#"{"moved": []}"#);
        assert!(result.is_err());
    }

    #[test]
    fn overlapping_ids_reports_duplicates() {
        let delta = DeltaData::new(
            vec![record(json!({"id": "x"}))],
            vec![record(json!({"id": "y"}))],
            vec![DeltaData::deleted_marker("x")],
        );

        let overlaps = delta.overlapping_ids();
        assert_eq!(overlaps.len(), 1);
        let kinds = &overlaps["x"];
        assert!(kinds.contains(&ChangeKind::Created));
        assert!(kinds.contains(&ChangeKind::Deleted));
    }
}
