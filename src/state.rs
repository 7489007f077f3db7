//! Durable state directory holding the cursor and the message ledger.
//!
//! Both live in a single redb file. Every mutation is its own committed write
//! transaction, so whatever a crash leaves behind is a valid point in the
//! message lifecycle.

use crate::cursor::{CURSOR_TABLE, CursorStore};
use crate::error::StoreError;
use crate::ledger::store::{LEDGER_TABLE, MessageLedger};

use redb::Database;

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File name of the state database inside the state directory.
pub const STATE_FILE_NAME: &str = "state.redb";

/// Process-wide state store, opened once at startup and shared by the
/// cursor store and the ledger.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl StateStore {
    /// Open (or create on first run) the state database in `state_dir`.
    ///
    /// A missing file is a first run. An existing file that cannot be opened,
    /// including one locked by a concurrent invocation, fails loudly.
    pub fn open(state_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(state_dir).map_err(|error| StoreError::Unavailable {
            path: state_dir.to_path_buf(),
            reason: format!("failed to create state directory: {error}"),
        })?;

        let path = state_dir.join(STATE_FILE_NAME);
        let first_run = !path.exists();

        let db = Database::create(&path).map_err(|error| StoreError::Unavailable {
            path: path.clone(),
            reason: error.to_string(),
        })?;

        // Ensure all tables exist so read transactions never see a missing table.
        let write_transaction = db.begin_write().map_err(StoreError::backend)?;
        {
            let _cursor = write_transaction
                .open_table(CURSOR_TABLE)
                .map_err(StoreError::backend)?;
            let _ledger = write_transaction
                .open_table(LEDGER_TABLE)
                .map_err(StoreError::backend)?;
        }
        write_transaction.commit().map_err(StoreError::backend)?;

        if first_run {
            tracing::info!(path = %path.display(), "created new state database");
        } else {
            tracing::debug!(path = %path.display(), "opened state database");
        }

        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cursor(&self) -> CursorStore {
        CursorStore::new(self.db.clone())
    }

    pub fn ledger(&self) -> MessageLedger {
        MessageLedger::new(self.db.clone())
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
