//! Types for the message ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::path::PathBuf;

/// Processing state of a tracked voice note.
///
/// The lifecycle is strictly linear:
/// `Seen -> Downloaded -> DeletionRequested -> Deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Known from the update stream, content not yet on disk.
    Seen,
    /// Content durably written under the recordings directory.
    Downloaded,
    /// A qualifying reaction was observed; the file is being removed.
    DeletionRequested,
    /// Local file removed. Terminal.
    Deleted,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Seen => "seen",
            MessageState::Downloaded => "downloaded",
            MessageState::DeletionRequested => "deletion_requested",
            MessageState::Deleted => "deleted",
        }
    }

    /// Whether `next` is the single state reachable from `self`.
    pub fn can_transition_to(&self, next: MessageState) -> bool {
        matches!(
            (self, next),
            (MessageState::Seen, MessageState::Downloaded)
                | (MessageState::Downloaded, MessageState::DeletionRequested)
                | (MessageState::DeletionRequested, MessageState::Deleted)
        )
    }
}

impl std::fmt::Display for MessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "seen" => Ok(MessageState::Seen),
            "downloaded" => Ok(MessageState::Downloaded),
            "deletion_requested" => Ok(MessageState::DeletionRequested),
            "deleted" => Ok(MessageState::Deleted),
            other => Err(format!(
                "invalid message state: '{other}', expected 'seen', 'downloaded', \
                 'deletion_requested', or 'deleted'"
            )),
        }
    }
}

/// Durable record of one voice-note message.
///
/// Entries are never removed from the ledger. A `Deleted` entry is what keeps
/// a replayed update from downloading the note a second time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedMessage {
    pub message_id: i64,
    /// Platform reference to the voice note's binary content.
    pub file_ref: String,
    /// Where the content lives on disk. Set while `Downloaded` or
    /// `DeletionRequested`, cleared once `Deleted`.
    pub local_path: Option<PathBuf>,
    pub state: MessageState,
    /// The confirmation reaction for the deletion has been sent.
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackedMessage {
    pub(crate) fn new(message_id: i64, file_ref: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            message_id,
            file_ref: file_ref.into(),
            local_path: None,
            state: MessageState::Seen,
            acknowledged: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Deleted but the confirmation reaction has not gone out yet.
    pub fn awaiting_acknowledgement(&self) -> bool {
        self.state == MessageState::Deleted && !self.acknowledged
    }
}
