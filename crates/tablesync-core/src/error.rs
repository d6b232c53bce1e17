//! Error types shared by every sync capability.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Boxed backend error carried by [`SyncError::Store`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Which way changes were flowing when an operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Server to client
    Down,
    /// Client to server
    Up,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Down => write!(f, "down"),
            Direction::Up => write!(f, "up"),
        }
    }
}

/// Errors raised by sync-down and sync-up operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The entity was registered without the requested capability
    #[error("entity `{entity}` does not implement sync-{capability}")]
    NotImplemented {
        /// Entity name
        entity: String,
        /// Missing capability
        capability: Direction,
    },

    /// No entity is registered under this name
    #[error("no syncable entity named `{0}`")]
    UnknownEntity(String),

    /// The entity definition itself is unusable
    #[error("invalid entity `{name}`: {reason}")]
    InvalidEntity {
        /// Entity name
        name: String,
        /// What is wrong with it
        reason: String,
    },

    /// A client record cannot be applied
    #[error("invalid record for `{entity}`: {reason}")]
    InvalidRecord {
        /// Entity name
        entity: String,
        /// What is wrong with it
        reason: String,
    },

    /// Store access exceeded the caller's deadline
    #[error("sync-{direction} for `{entity}` timed out after {timeout:?}")]
    Timeout {
        /// Entity name
        entity: String,
        /// Operation direction
        direction: Direction,
        /// The deadline that was exceeded
        timeout: Duration,
    },

    /// The backing store failed
    #[error("sync-{direction} for `{entity}` failed: {source}")]
    Store {
        /// Entity name
        entity: String,
        /// Operation direction
        direction: Direction,
        /// Backend error, unchanged
        #[source]
        source: BoxError,
    },
}

impl SyncError {
    /// Wrap a backend failure.
    pub fn store(
        entity: impl Into<String>,
        direction: Direction,
        source: impl Into<BoxError>,
    ) -> Self {
        SyncError::Store {
            entity: entity.into(),
            direction,
            source: source.into(),
        }
    }

    /// The direction of the failed operation, when known.
    #[must_use]
    pub fn direction(&self) -> Option<Direction> {
        match self {
            SyncError::NotImplemented { capability, .. } => Some(*capability),
            SyncError::Timeout { direction, .. } | SyncError::Store { direction, .. } => {
                Some(*direction)
            }
            SyncError::InvalidRecord { .. } => Some(Direction::Up),
            SyncError::UnknownEntity(_) | SyncError::InvalidEntity { .. } => None,
        }
    }

    /// True for deadline failures.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, SyncError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn store_error_keeps_source_and_direction() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection lost");
        let err = SyncError::store("patients", Direction::Down, io);

        assert_eq!(err.direction(), Some(Direction::Down));
        assert!(!err.is_timeout());
        assert_eq!(
            err.to_string(),
            "sync-down for `patients` failed: connection lost"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn timeout_is_distinct() {
        let err = SyncError::Timeout {
            entity: "visits".to_string(),
            direction: Direction::Up,
            timeout: Duration::from_millis(250),
        };
        assert!(err.is_timeout());
        assert_eq!(err.direction(), Some(Direction::Up));
    }
}
