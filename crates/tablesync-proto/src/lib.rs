//! # tablesync protocol
//!
//! Wire envelopes a sync endpoint exchanges with clients, and the handlers
//! that turn them into registry calls.
//!
//! ## Messages
//!
//! - `PullRequest` / `PullResponse`: sync-down, per-table deltas plus the
//!   watermark the client should send next time
//! - `PushRequest` / `PushResponse`: sync-up, per-table client changes
//!
//! Every message encodes to JSON and CBOR.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod handler;
pub mod messages;

pub use handler::{handle_pull, handle_push};
pub use messages::{
    ChangeSet, MessageError, PullRequest, PullResponse, PushRequest, PushResponse, WireMessage,
    PROTOCOL_VERSION,
};
