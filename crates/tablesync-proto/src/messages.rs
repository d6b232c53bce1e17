//! Protocol messages for pull and push.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tablesync_core::{ApplyReport, DeltaData, Watermark};

/// Protocol version carried in every response.
pub const PROTOCOL_VERSION: u32 = 1;

/// Per-table deltas, keyed by table name.
pub type ChangeSet = BTreeMap<String, DeltaData>;

/// JSON and CBOR codecs shared by every message.
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }

    /// Serialize to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    fn to_json(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|e| MessageError::Serialize(e.to_string()))
    }

    /// Deserialize from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    fn from_json(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// A client asking for changes since its last pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Watermark from the previous `PullResponse`; absent on first sync
    #[serde(default)]
    pub last_pulled_at: Option<Watermark>,
    /// Restrict the pull to these tables; absent means every table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<String>>,
}

impl PullRequest {
    /// Create a request for every table since a watermark.
    #[must_use]
    pub fn since(last_pulled_at: Watermark) -> Self {
        Self {
            last_pulled_at: Some(last_pulled_at),
            tables: None,
        }
    }

    /// The effective watermark, the epoch for first syncs.
    #[must_use]
    pub fn watermark(&self) -> Watermark {
        self.last_pulled_at.unwrap_or(Watermark::EPOCH)
    }
}

impl WireMessage for PullRequest {}

/// Changes a client has not seen yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Deltas per table
    pub changes: ChangeSet,
    /// Watermark to send as `last_pulled_at` on the next pull
    pub timestamp: Watermark,
    /// Protocol version
    pub version: u32,
}

impl PullResponse {
    /// Create a response.
    #[must_use]
    pub fn new(changes: ChangeSet, timestamp: Watermark) -> Self {
        Self {
            changes,
            timestamp,
            version: PROTOCOL_VERSION,
        }
    }
}

impl WireMessage for PullResponse {}

/// Client changes to merge into the server store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Client deltas per table
    pub changes: ChangeSet,
    /// Watermark of the client's last successful sync
    #[serde(alias = "last_pulled_at")]
    pub last_pushed_at: Watermark,
}

impl PushRequest {
    /// Create a request.
    #[must_use]
    pub fn new(changes: ChangeSet, last_pushed_at: Watermark) -> Self {
        Self {
            changes,
            last_pushed_at,
        }
    }
}

impl WireMessage for PushRequest {}

/// Result of a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    /// Outcome per table
    pub applied: BTreeMap<String, ApplyReport>,
    /// Protocol version
    pub version: u32,
}

impl PushResponse {
    /// Create a response.
    #[must_use]
    pub fn new(applied: BTreeMap<String, ApplyReport>) -> Self {
        Self {
            applied,
            version: PROTOCOL_VERSION,
        }
    }

    /// Outcome summed over all tables.
    #[must_use]
    pub fn total(&self) -> ApplyReport {
        let mut total = ApplyReport::default();
        for report in self.applied.values() {
            total.absorb(*report);
        }
        total
    }

    /// Total changes skipped as conflicts across all tables.
    #[must_use]
    pub fn conflicts(&self) -> usize {
        self.total().conflicts
    }
}

impl WireMessage for PushResponse {}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}
