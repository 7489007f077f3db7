//! The chat platform seam the reconciler talks to.

use crate::cursor::Cursor;
use crate::error::PlatformError;
use crate::messaging::types::Update;

use std::future::Future;

/// Reactions the agent understands or sends. The concrete emoji behind each
/// kind belong to the platform adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReactionKind {
    /// The chat participant asks for the local copy to be removed.
    ConfirmDelete,
    /// Sent by the agent once a deletion has been carried out.
    Acknowledge,
}

impl std::fmt::Display for ReactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReactionKind::ConfirmDelete => f.write_str("confirm_delete"),
            ReactionKind::Acknowledge => f.write_str("acknowledge"),
        }
    }
}

/// Chat platform client.
///
/// Every call is awaited to completion before the reconciler moves on, so
/// implementations need no internal ordering guarantees beyond returning
/// updates in delivery order.
pub trait ChatPlatform: Send + Sync {
    fn name(&self) -> &str;

    /// Updates strictly after `since`, oldest first. Does not consume them.
    fn fetch_updates(
        &self,
        since: Cursor,
    ) -> impl Future<Output = Result<Vec<Update>, PlatformError>> + Send;

    /// Binary content behind a file reference.
    fn fetch_content(
        &self,
        file_ref: &str,
    ) -> impl Future<Output = Result<Vec<u8>, PlatformError>> + Send;

    /// Set the agent's reaction on a message.
    fn send_reaction(
        &self,
        chat_id: i64,
        message_id: i64,
        kind: ReactionKind,
    ) -> impl Future<Output = Result<(), PlatformError>> + Send;

    /// Post a plain text message.
    fn send_message(
        &self,
        chat_id: i64,
        text: &str,
    ) -> impl Future<Output = Result<(), PlatformError>> + Send;

    /// Maximum number of updates returned by one `fetch_updates` call. A
    /// shorter batch means the stream is drained.
    fn page_size(&self) -> usize {
        100
    }
}
