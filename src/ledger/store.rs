//! MessageLedger: durable CRUD and state transitions for tracked voice notes.

use crate::error::{LedgerError, StoreError};
use crate::ledger::types::{MessageState, TrackedMessage};

use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};

use std::path::Path;
use std::sync::Arc;

/// Ledger entries keyed by platform message id, stored as JSON.
pub(crate) const LEDGER_TABLE: TableDefinition<i64, &str> = TableDefinition::new("ledger");

/// Persistent ledger of voice notes, backed by the state database.
///
/// Each mutator runs in its own write transaction and is committed before it
/// returns. There is no in-memory copy.
#[derive(Clone)]
pub struct MessageLedger {
    db: Arc<Database>,
}

impl MessageLedger {
    pub(crate) fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Get a tracked message by id.
    pub fn get(&self, message_id: i64) -> Result<Option<TrackedMessage>, LedgerError> {
        let read_transaction = self.db.begin_read().map_err(StoreError::backend)?;
        let table = read_transaction
            .open_table(LEDGER_TABLE)
            .map_err(StoreError::backend)?;
        let value = table.get(message_id).map_err(StoreError::backend)?;

        value
            .map(|guard| decode(message_id, guard.value()))
            .transpose()
    }

    /// Start tracking a message in state `Seen`.
    ///
    /// Callers check `get` first. Creating the same id twice is a bug.
    pub fn create(
        &self,
        message_id: i64,
        file_ref: &str,
    ) -> Result<TrackedMessage, LedgerError> {
        let message = TrackedMessage::new(message_id, file_ref);
        let json = encode(&message)?;

        let write_transaction = self.db.begin_write().map_err(StoreError::backend)?;
        {
            let mut table = write_transaction
                .open_table(LEDGER_TABLE)
                .map_err(StoreError::backend)?;
            if table
                .get(message_id)
                .map_err(StoreError::backend)?
                .is_some()
            {
                return Err(LedgerError::AlreadyExists(message_id));
            }
            table
                .insert(message_id, json.as_str())
                .map_err(StoreError::backend)?;
        }
        write_transaction.commit().map_err(StoreError::backend)?;

        tracing::debug!(message_id, "ledger entry created");
        Ok(message)
    }

    /// Move a message to `next`, which must be the successor of its current state.
    pub fn transition(
        &self,
        message_id: i64,
        next: MessageState,
    ) -> Result<TrackedMessage, LedgerError> {
        let updated = self.mutate(message_id, |message| {
            let path_ok = match next {
                MessageState::Downloaded => message.local_path.is_some(),
                MessageState::Deleted => message.local_path.is_none(),
                MessageState::Seen | MessageState::DeletionRequested => true,
            };
            if !message.state.can_transition_to(next) || !path_ok {
                return Err(invalid(message, format!("transition to {next}")));
            }
            message.state = next;
            Ok(())
        })?;

        tracing::debug!(message_id, state = %next, "ledger transition");
        Ok(updated)
    }

    /// Record where the content was written. Only legal before the download is
    /// confirmed, i.e. while `Seen`.
    pub fn set_local_path(
        &self,
        message_id: i64,
        path: &Path,
    ) -> Result<TrackedMessage, LedgerError> {
        self.mutate(message_id, |message| {
            if message.state != MessageState::Seen {
                return Err(invalid(message, "set local path"));
            }
            message.local_path = Some(path.to_path_buf());
            Ok(())
        })
    }

    /// Forget the local path once the file is gone. Only legal while
    /// `DeletionRequested`.
    pub fn clear_local_path(&self, message_id: i64) -> Result<TrackedMessage, LedgerError> {
        self.mutate(message_id, |message| {
            if message.state != MessageState::DeletionRequested {
                return Err(invalid(message, "clear local path"));
            }
            message.local_path = None;
            Ok(())
        })
    }

    /// Mark the deletion as acknowledged on the platform. Only legal once
    /// `Deleted`.
    pub fn set_acknowledged(&self, message_id: i64) -> Result<TrackedMessage, LedgerError> {
        self.mutate(message_id, |message| {
            if message.state != MessageState::Deleted {
                return Err(invalid(message, "acknowledge"));
            }
            message.acknowledged = true;
            Ok(())
        })
    }

    /// All entries currently in `state`, ordered by message id.
    pub fn list_in_state(&self, state: MessageState) -> Result<Vec<TrackedMessage>, LedgerError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|message| message.state == state)
            .collect())
    }

    /// Deleted entries whose confirmation reaction has not been sent.
    pub fn pending_acknowledgements(&self) -> Result<Vec<TrackedMessage>, LedgerError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(TrackedMessage::awaiting_acknowledgement)
            .collect())
    }

    /// Every entry in the ledger, ordered by message id.
    pub fn list(&self) -> Result<Vec<TrackedMessage>, LedgerError> {
        let read_transaction = self.db.begin_read().map_err(StoreError::backend)?;
        let table = read_transaction
            .open_table(LEDGER_TABLE)
            .map_err(StoreError::backend)?;

        let mut messages = Vec::new();
        for entry in table.iter().map_err(StoreError::backend)? {
            let (key, value) = entry.map_err(StoreError::backend)?;
            messages.push(decode(key.value(), value.value())?);
        }
        Ok(messages)
    }

    /// Read-modify-write one entry inside a single committed transaction.
    /// If `apply` fails the transaction is dropped and nothing is written.
    fn mutate(
        &self,
        message_id: i64,
        apply: impl FnOnce(&mut TrackedMessage) -> Result<(), LedgerError>,
    ) -> Result<TrackedMessage, LedgerError> {
        let write_transaction = self.db.begin_write().map_err(StoreError::backend)?;
        let message = {
            let mut table = write_transaction
                .open_table(LEDGER_TABLE)
                .map_err(StoreError::backend)?;
            let current = table
                .get(message_id)
                .map_err(StoreError::backend)?
                .map(|guard| decode(message_id, guard.value()))
                .transpose()?;
            let mut message = current.ok_or(LedgerError::NotFound(message_id))?;

            apply(&mut message)?;
            message.updated_at = Utc::now();

            let json = encode(&message)?;
            table
                .insert(message_id, json.as_str())
                .map_err(StoreError::backend)?;
            message
        };
        write_transaction.commit().map_err(StoreError::backend)?;

        Ok(message)
    }
}

impl std::fmt::Debug for MessageLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageLedger").finish_non_exhaustive()
    }
}

fn invalid(message: &TrackedMessage, action: impl Into<String>) -> LedgerError {
    LedgerError::InvalidTransition {
        message_id: message.message_id,
        from: message.state,
        action: action.into(),
    }
}

fn encode(message: &TrackedMessage) -> Result<String, LedgerError> {
    serde_json::to_string(message).map_err(|error| {
        StoreError::Corrupt {
            key: message.message_id.to_string(),
            reason: format!("failed to encode ledger entry: {error}"),
        }
        .into()
    })
}

fn decode(message_id: i64, json: &str) -> Result<TrackedMessage, LedgerError> {
    let message: TrackedMessage = serde_json::from_str(json).map_err(|error| StoreError::Corrupt {
        key: message_id.to_string(),
        reason: format!("failed to decode ledger entry: {error}"),
    })?;

    if message.message_id != message_id {
        return Err(StoreError::Corrupt {
            key: message_id.to_string(),
            reason: format!("entry is keyed under a different id ({})", message.message_id),
        }
        .into());
    }
    Ok(message)
}
