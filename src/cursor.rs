//! Persistent cursor over the platform's update stream.

use crate::error::StoreError;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use std::sync::Arc;

/// Single-row table holding the last consumed update id.
pub(crate) const CURSOR_TABLE: TableDefinition<&str, i64> = TableDefinition::new("cursor");

const CURSOR_KEY: &str = "last_update_id";

/// Position of the last platform update that was fully handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cursor(i64);

impl Cursor {
    /// Nothing consumed yet.
    pub const START: Cursor = Cursor(0);

    pub fn new(last_update_id: i64) -> Self {
        Self(last_update_id)
    }

    pub fn last_update_id(&self) -> i64 {
        self.0
    }

    /// The first update id that has not been consumed.
    pub fn next_offset(&self) -> i64 {
        self.0 + 1
    }

    /// Whether the update has already been consumed.
    pub fn covers(&self, update_id: i64) -> bool {
        update_id <= self.0
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable cursor storage. Only the reconciler writes it, and only after the
/// update it points at has been fully handled.
#[derive(Clone)]
pub struct CursorStore {
    db: Arc<Database>,
}

impl CursorStore {
    pub(crate) fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Read the persisted cursor, or `Cursor::START` if none was ever saved.
    pub fn load(&self) -> Result<Cursor, StoreError> {
        let read_transaction = self.db.begin_read().map_err(StoreError::backend)?;
        let table = read_transaction
            .open_table(CURSOR_TABLE)
            .map_err(StoreError::backend)?;
        let value = table.get(CURSOR_KEY).map_err(StoreError::backend)?;

        Ok(value.map(|guard| Cursor(guard.value())).unwrap_or(Cursor::START))
    }

    /// Persist `cursor`. The write is committed before this returns.
    ///
    /// Saving a position behind the persisted one is rejected; saving the same
    /// position again is a no-op.
    pub fn save(&self, cursor: Cursor) -> Result<(), StoreError> {
        let write_transaction = self.db.begin_write().map_err(StoreError::backend)?;
        {
            let mut table = write_transaction
                .open_table(CURSOR_TABLE)
                .map_err(StoreError::backend)?;
            let current = table
                .get(CURSOR_KEY)
                .map_err(StoreError::backend)?
                .map(|guard| guard.value())
                .unwrap_or(Cursor::START.0);

            if cursor.0 < current {
                return Err(StoreError::CursorRegression {
                    current,
                    attempted: cursor.0,
                });
            }
            if cursor.0 == current {
                return Ok(());
            }

            table
                .insert(CURSOR_KEY, cursor.0)
                .map_err(StoreError::backend)?;
        }
        write_transaction.commit().map_err(StoreError::backend)?;

        tracing::debug!(cursor = cursor.0, "cursor saved");
        Ok(())
    }

    /// Record that `update_id` has been handled and return the new cursor.
    pub fn advance(&self, update_id: i64) -> Result<Cursor, StoreError> {
        let cursor = Cursor(update_id);
        self.save(cursor)?;
        Ok(cursor)
    }
}

impl std::fmt::Debug for CursorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateStore;

    #[test]
    fn fresh_store_starts_at_the_beginning() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = StateStore::open(dir.path()).unwrap().cursor();

        assert_eq!(cursor.load().unwrap(), Cursor::START);
        assert_eq!(cursor.load().unwrap().next_offset(), 1);
    }

    #[test]
    fn saved_cursor_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cursor = StateStore::open(dir.path()).unwrap().cursor();
            cursor.save(Cursor::new(815_000_001)).unwrap();
        }

        let cursor = StateStore::open(dir.path()).unwrap().cursor();
        let loaded = cursor.load().unwrap();
        assert_eq!(loaded.last_update_id(), 815_000_001);
        assert!(loaded.covers(815_000_001));
        assert!(!loaded.covers(815_000_002));
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = StateStore::open(dir.path()).unwrap().cursor();

        cursor.advance(10).unwrap();
        cursor.advance(10).unwrap();

        let error = cursor.save(Cursor::new(9)).unwrap_err();
        assert!(matches!(
            error,
            StoreError::CursorRegression {
                current: 10,
                attempted: 9
            }
        ));
        assert_eq!(cursor.load().unwrap(), Cursor::new(10));
    }
}
