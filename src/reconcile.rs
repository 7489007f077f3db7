//! Reconciliation engine: one pass of fetch, classify, apply, persist.
//!
//! Every side effect is followed by its own durable ledger step, and the
//! cursor only moves past an update once everything it asked for is done. A
//! pass that dies half way leaves the ledger at the point the next pass
//! resumes from.

use crate::classifier::{Event, classify};
use crate::cursor::{Cursor, CursorStore};
use crate::error::{Error, Result};
use crate::ledger::{MessageLedger, MessageState, TrackedMessage};
use crate::messaging::traits::{ChatPlatform, ReactionKind};
use crate::messaging::types::Update;
use crate::state::StateStore;

use tokio::io::AsyncWriteExt as _;

use std::path::{Path, PathBuf};

/// Reply to `/start`.
const GREETING: &str = "Hi!";

/// Where the recording for `message_id` lives.
pub fn recording_path(recordings_dir: &Path, message_id: i64) -> PathBuf {
    recordings_dir.join(format!("{message_id}.ogg"))
}

/// What a pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Updates consumed (including irrelevant ones).
    pub updates: usize,
    pub downloaded: usize,
    pub deleted: usize,
    pub acknowledged: usize,
    pub greeted: usize,
    /// Voice notes whose content the platform refused to serve. They stay
    /// `Seen` and are tried again on every pass.
    pub rejected: usize,
    /// Cursor persisted at the end of the pass.
    pub cursor: Cursor,
}

impl PassReport {
    pub fn is_idle(&self) -> bool {
        self.updates == 0
            && self.downloaded == 0
            && self.deleted == 0
            && self.acknowledged == 0
            && self.greeted == 0
    }
}

/// Drives one reconciliation pass for a single chat.
pub struct Reconciler<'a, P> {
    platform: &'a P,
    cursor: CursorStore,
    ledger: MessageLedger,
    recordings_dir: PathBuf,
    chat_id: i64,
}

impl<'a, P: ChatPlatform> Reconciler<'a, P> {
    pub fn new(
        platform: &'a P,
        state: &StateStore,
        recordings_dir: impl Into<PathBuf>,
        chat_id: i64,
    ) -> Self {
        Self {
            platform,
            cursor: state.cursor(),
            ledger: state.ledger(),
            recordings_dir: recordings_dir.into(),
            chat_id,
        }
    }

    /// Run one full pass.
    ///
    /// 1. Finish work a previous pass left half done.
    /// 2. Consume updates after the cursor, page by page, advancing the
    ///    cursor after each one is fully handled.
    /// 3. Retry confirmation reactions still owed for deleted notes.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let mut cursor = self.cursor.load()?;
        let mut report = PassReport {
            cursor,
            ..PassReport::default()
        };
        tracing::info!(%cursor, platform = self.platform.name(), chat_id = self.chat_id, "reconciliation pass started");

        self.resume_interrupted(&mut report).await?;

        loop {
            let updates = self.platform.fetch_updates(cursor).await?;
            let batch_len = updates.len();
            let batch_start = cursor;

            for update in &updates {
                if cursor.covers(update.update_id) {
                    tracing::debug!(update_id = update.update_id, %cursor, "skipping already consumed update");
                    continue;
                }

                self.handle_update(update, &mut report)
                    .await
                    .map_err(|error| Error::Update {
                        update_id: update.update_id,
                        source: Box::new(error),
                    })?;

                cursor = self.cursor.advance(update.update_id)?;
                report.updates += 1;
                report.cursor = cursor;
            }

            if batch_len < self.platform.page_size() || cursor == batch_start {
                break;
            }
        }

        self.retry_acknowledgements(&mut report).await?;

        tracing::info!(
            updates = report.updates,
            downloaded = report.downloaded,
            deleted = report.deleted,
            acknowledged = report.acknowledged,
            rejected = report.rejected,
            cursor = %report.cursor,
            "reconciliation pass finished"
        );
        Ok(report)
    }

    async fn handle_update(&self, update: &Update, report: &mut PassReport) -> Result<()> {
        match classify(update, self.chat_id) {
            Event::NewVoiceNote {
                message_id,
                file_ref,
            } => self.on_voice_note(message_id, &file_ref, report).await,
            Event::Reaction {
                message_id,
                reaction_kind: ReactionKind::ConfirmDelete,
            } => self.on_confirm_delete(message_id, report).await,
            Event::Start { message_id } => {
                self.platform.send_message(self.chat_id, GREETING).await?;
                tracing::info!(message_id, "greeted chat");
                report.greeted += 1;
                Ok(())
            }
            Event::Reaction { .. } | Event::Irrelevant => {
                tracing::debug!(update_id = update.update_id, "ignoring update");
                Ok(())
            }
        }
    }

    async fn on_voice_note(
        &self,
        message_id: i64,
        file_ref: &str,
        report: &mut PassReport,
    ) -> Result<()> {
        let message = match self.ledger.get(message_id)? {
            Some(existing) => existing,
            None => self.ledger.create(message_id, file_ref)?,
        };

        if message.state != MessageState::Seen {
            tracing::debug!(message_id, state = %message.state, "voice note already handled");
            return Ok(());
        }

        self.download_or_skip(&message, report).await
    }

    /// Download a `Seen` entry. A refusal by the platform (e.g. the file is
    /// over the bot download limit) leaves the entry `Seen` and does not
    /// block the rest of the pass.
    async fn download_or_skip(
        &self,
        message: &TrackedMessage,
        report: &mut PassReport,
    ) -> Result<()> {
        match self.download(message).await {
            Ok(()) => {
                report.downloaded += 1;
                Ok(())
            }
            Err(Error::Platform(error)) if error.is_rejection() => {
                tracing::warn!(
                    message_id = message.message_id,
                    %error,
                    "platform refused voice note content, leaving it for an operator"
                );
                report.rejected += 1;
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn on_confirm_delete(&self, message_id: i64, report: &mut PassReport) -> Result<()> {
        let Some(message) = self.ledger.get(message_id)? else {
            tracing::debug!(message_id, "reaction on untracked message");
            return Ok(());
        };

        if message.state != MessageState::Downloaded {
            tracing::debug!(message_id, state = %message.state, "reaction ignored in this state");
            return Ok(());
        }

        let message = self
            .ledger
            .transition(message_id, MessageState::DeletionRequested)?;
        self.complete_deletion(&message, report).await
    }

    /// Fetch the content, write it under its final name, then confirm the
    /// download in the ledger.
    async fn download(&self, message: &TrackedMessage) -> Result<()> {
        let message_id = message.message_id;
        let bytes = self.platform.fetch_content(&message.file_ref).await?;

        let path = recording_path(&self.recordings_dir, message_id);
        write_atomically(&path, &bytes).await?;

        self.ledger.set_local_path(message_id, &path)?;
        self.ledger
            .transition(message_id, MessageState::Downloaded)?;

        tracing::info!(message_id, path = %path.display(), size = bytes.len(), "voice note saved");
        Ok(())
    }

    /// Remove the file of a `DeletionRequested` entry, record the deletion,
    /// then try to acknowledge it. A failed acknowledgement does not undo
    /// the deletion; it stays owed in the ledger.
    async fn complete_deletion(
        &self,
        message: &TrackedMessage,
        report: &mut PassReport,
    ) -> Result<()> {
        let message_id = message.message_id;

        if let Some(path) = &message.local_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(message_id, path = %path.display(), "recording already gone");
                }
                Err(error) => return Err(Error::file_system(path, error)),
            }
        }

        self.ledger.clear_local_path(message_id)?;
        let message = self.ledger.transition(message_id, MessageState::Deleted)?;
        report.deleted += 1;
        tracing::info!(message_id, "voice note deleted");

        match self.acknowledge(&message).await {
            Ok(()) => report.acknowledged += 1,
            Err(error) => {
                tracing::warn!(message_id, %error, "acknowledgement deferred");
            }
        }
        Ok(())
    }

    async fn acknowledge(&self, message: &TrackedMessage) -> Result<()> {
        self.platform
            .send_reaction(self.chat_id, message.message_id, ReactionKind::Acknowledge)
            .await?;
        self.ledger.set_acknowledged(message.message_id)?;
        tracing::debug!(message_id = message.message_id, "deletion acknowledged");
        Ok(())
    }

    /// Finish downloads and deletions a previous pass started but did not
    /// complete. Their triggering updates may already be behind the cursor
    /// (deletions) or no longer retrievable from the platform.
    async fn resume_interrupted(&self, report: &mut PassReport) -> Result<()> {
        for message in self.ledger.list_in_state(MessageState::Seen)? {
            tracing::info!(message_id = message.message_id, "resuming interrupted download");
            self.download_or_skip(&message, report)
                .await
                .map_err(|error| Error::Message {
                    message_id: message.message_id,
                    source: Box::new(error),
                })?;
        }

        for message in self.ledger.list_in_state(MessageState::DeletionRequested)? {
            tracing::info!(message_id = message.message_id, "resuming interrupted deletion");
            self.complete_deletion(&message, report)
                .await
                .map_err(|error| Error::Message {
                    message_id: message.message_id,
                    source: Box::new(error),
                })?;
        }
        Ok(())
    }

    /// Send confirmation reactions still owed for deleted notes.
    ///
    /// A permanent rejection by the platform (for example the message was
    /// removed from the chat) is logged and left owed; anything else aborts
    /// the pass so the failure is visible.
    async fn retry_acknowledgements(&self, report: &mut PassReport) -> Result<()> {
        for message in self.ledger.pending_acknowledgements()? {
            let message_id = message.message_id;
            match self.acknowledge(&message).await {
                Ok(()) => {
                    tracing::info!(message_id, "owed acknowledgement sent");
                    report.acknowledged += 1;
                }
                Err(Error::Platform(error)) if error.is_rejection() => {
                    tracing::warn!(message_id, %error, "platform rejected acknowledgement");
                }
                Err(error) => {
                    return Err(Error::Message {
                        message_id,
                        source: Box::new(error),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A chat observed in discovery mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSighting {
    pub chat_id: i64,
    pub kind: String,
    pub label: String,
    pub updates: usize,
}

/// Bootstrap mode: report which chats have sent updates, without consuming
/// the updates or touching any state.
pub async fn discover_chats<P: ChatPlatform>(platform: &P) -> Result<Vec<ChatSighting>> {
    let updates = platform.fetch_updates(Cursor::START).await?;
    if updates.is_empty() {
        tracing::info!("no updates");
    }

    let mut sightings: Vec<ChatSighting> = Vec::new();
    for chat in updates.iter().filter_map(Update::chat) {
        match sightings.iter_mut().find(|sighting| sighting.chat_id == chat.id) {
            Some(sighting) => sighting.updates += 1,
            None => {
                tracing::info!(chat_id = chat.id, kind = %chat.kind, label = %chat.label(), "new chat");
                sightings.push(ChatSighting {
                    chat_id: chat.id,
                    kind: chat.kind.clone(),
                    label: chat.label(),
                    updates: 1,
                });
            }
        }
    }
    Ok(sightings)
}

/// Write to a hidden sibling, flush it to disk, then rename into place so a
/// crash never leaves a truncated file under the final name.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "recording".to_string());
    let temp_path = path.with_file_name(format!(".{file_name}.part"));

    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .map_err(|error| Error::file_system(&temp_path, error))?;
    file.write_all(bytes)
        .await
        .map_err(|error| Error::file_system(&temp_path, error))?;
    file.sync_all()
        .await
        .map_err(|error| Error::file_system(&temp_path, error))?;
    drop(file);

    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|error| Error::file_system(path, error))?;

    // The rename is only durable once the directory entry is.
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        let directory = tokio::fs::File::open(parent)
            .await
            .map_err(|error| Error::file_system(parent, error))?;
        directory
            .sync_all()
            .await
            .map_err(|error| Error::file_system(parent, error))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LedgerError, PlatformError, StoreError};
    use crate::ledger::store::LEDGER_TABLE;
    use crate::state::STATE_FILE_NAME;

    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const CHAT: i64 = 42;

    /// In-memory platform. Keeps the whole update stream and serves the part
    /// after the requested cursor, like the Bot API does.
    struct FakePlatform {
        updates: Mutex<Vec<Update>>,
        contents: HashMap<String, Vec<u8>>,
        page_size: usize,
        reactions: Mutex<Vec<(i64, i64, ReactionKind)>>,
        messages: Mutex<Vec<(i64, String)>>,
        update_fetches: AtomicUsize,
        content_fetches: AtomicUsize,
        fail_updates: AtomicBool,
        fail_content: AtomicBool,
        fail_reactions: AtomicBool,
        reject_reactions: AtomicBool,
    }

    impl FakePlatform {
        fn new() -> Self {
            Self {
                updates: Mutex::new(Vec::new()),
                contents: HashMap::from([
                    ("A".to_string(), b"OggS voice A".to_vec()),
                    ("B".to_string(), b"OggS voice B".to_vec()),
                ]),
                page_size: 100,
                reactions: Mutex::new(Vec::new()),
                messages: Mutex::new(Vec::new()),
                update_fetches: AtomicUsize::new(0),
                content_fetches: AtomicUsize::new(0),
                fail_updates: AtomicBool::new(false),
                fail_content: AtomicBool::new(false),
                fail_reactions: AtomicBool::new(false),
                reject_reactions: AtomicBool::new(false),
            }
        }

        fn push(&self, update: Update) {
            self.updates.lock().unwrap().push(update);
        }

        fn acknowledgements(&self) -> Vec<i64> {
            self.reactions
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, _, kind)| *kind == ReactionKind::Acknowledge)
                .map(|(_, message_id, _)| *message_id)
                .collect()
        }
    }

    impl ChatPlatform for FakePlatform {
        fn name(&self) -> &str {
            "fake"
        }

        async fn fetch_updates(&self, since: Cursor) -> std::result::Result<Vec<Update>, PlatformError> {
            self.update_fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(PlatformError::Unreachable("connection refused".into()));
            }
            Ok(self
                .updates
                .lock()
                .unwrap()
                .iter()
                .filter(|update| !since.covers(update.update_id))
                .take(self.page_size)
                .cloned()
                .collect())
        }

        async fn fetch_content(&self, file_ref: &str) -> std::result::Result<Vec<u8>, PlatformError> {
            self.content_fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail_content.load(Ordering::SeqCst) {
                return Err(PlatformError::RateLimited {
                    retry_after: Some(5),
                });
            }
            self.contents.get(file_ref).cloned().ok_or_else(|| PlatformError::Api {
                code: 400,
                description: "Bad Request: invalid file_id".into(),
            })
        }

        async fn send_reaction(
            &self,
            chat_id: i64,
            message_id: i64,
            kind: ReactionKind,
        ) -> std::result::Result<(), PlatformError> {
            if self.fail_reactions.load(Ordering::SeqCst) {
                return Err(PlatformError::Unreachable("timed out".into()));
            }
            if self.reject_reactions.load(Ordering::SeqCst) {
                return Err(PlatformError::Api {
                    code: 400,
                    description: "Bad Request: message to react not found".into(),
                });
            }
            self.reactions
                .lock()
                .unwrap()
                .push((chat_id, message_id, kind));
            Ok(())
        }

        async fn send_message(&self, chat_id: i64, text: &str) -> std::result::Result<(), PlatformError> {
            self.messages
                .lock()
                .unwrap()
                .push((chat_id, text.to_string()));
            Ok(())
        }

        fn page_size(&self) -> usize {
            self.page_size
        }
    }

    fn voice(update_id: i64, message_id: i64, file_ref: &str) -> Update {
        serde_json::from_value(serde_json::json!({
            "update_id": update_id,
            "message": {
                "message_id": message_id,
                "chat": {"id": CHAT, "type": "private"},
                "date": 1760000000,
                "voice": {"file_id": file_ref, "file_unique_id": format!("u{file_ref}"), "duration": 2}
            }
        }))
        .unwrap()
    }

    fn thumbs_up(update_id: i64, message_id: i64) -> Update {
        serde_json::from_value(serde_json::json!({
            "update_id": update_id,
            "message_reaction": {
                "chat": {"id": CHAT, "type": "private"},
                "message_id": message_id,
                "user": {"id": 7, "is_bot": false, "first_name": "Sam"},
                "date": 1760000100,
                "old_reaction": [],
                "new_reaction": [{"type": "emoji", "emoji": "👍"}]
            }
        }))
        .unwrap()
    }

    fn text(update_id: i64, chat_id: i64, text: &str) -> Update {
        serde_json::from_value(serde_json::json!({
            "update_id": update_id,
            "message": {
                "message_id": update_id,
                "chat": {"id": chat_id, "type": "private", "first_name": "Sam"},
                "date": 1760000000,
                "text": text
            }
        }))
        .unwrap()
    }

    struct Harness {
        state_dir: tempfile::TempDir,
        recordings: tempfile::TempDir,
        platform: FakePlatform,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                state_dir: tempfile::tempdir().unwrap(),
                recordings: tempfile::tempdir().unwrap(),
                platform: FakePlatform::new(),
            }
        }

        /// One invocation: open state, run a pass, close state.
        async fn invoke(&self) -> Result<PassReport> {
            let state = StateStore::open(self.state_dir.path()).unwrap();
            Reconciler::new(&self.platform, &state, self.recordings.path(), CHAT)
                .run_pass()
                .await
        }

        fn state(&self) -> StateStore {
            StateStore::open(self.state_dir.path()).unwrap()
        }

        fn entry(&self, message_id: i64) -> TrackedMessage {
            self.state().ledger().get(message_id).unwrap().unwrap()
        }

        fn recording(&self, message_id: i64) -> PathBuf {
            recording_path(self.recordings.path(), message_id)
        }

        fn recording_count(&self) -> usize {
            std::fs::read_dir(self.recordings.path()).unwrap().count()
        }
    }

    #[tokio::test]
    async fn voice_note_is_downloaded_then_deleted_on_reaction() {
        let harness = Harness::new();
        harness.platform.push(voice(100, 1, "A"));

        let report = harness.invoke().await.unwrap();
        assert_eq!(report.downloaded, 1);
        assert_eq!(report.cursor, Cursor::new(100));
        assert_eq!(
            std::fs::read(harness.recording(1)).unwrap(),
            b"OggS voice A"
        );
        let entry = harness.entry(1);
        assert_eq!(entry.state, MessageState::Downloaded);
        assert_eq!(entry.local_path, Some(harness.recording(1)));

        harness.platform.push(thumbs_up(101, 1));
        let report = harness.invoke().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.acknowledged, 1);
        assert!(!harness.recording(1).exists());

        let entry = harness.entry(1);
        assert_eq!(entry.state, MessageState::Deleted);
        assert!(entry.acknowledged);
        assert!(entry.local_path.is_none());
        assert_eq!(harness.platform.acknowledgements(), vec![1]);
        assert_eq!(
            harness.platform.reactions.lock().unwrap()[0],
            (CHAT, 1, ReactionKind::Acknowledge)
        );
    }

    #[tokio::test]
    async fn duplicate_voice_note_in_one_batch_is_written_once() {
        let harness = Harness::new();
        harness.platform.push(voice(100, 1, "A"));
        harness.platform.push(voice(101, 1, "A"));

        let report = harness.invoke().await.unwrap();

        assert_eq!(report.updates, 2);
        assert_eq!(report.downloaded, 1);
        assert_eq!(harness.platform.content_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(harness.recording_count(), 1);
        assert_eq!(harness.entry(1).state, MessageState::Downloaded);
    }

    #[tokio::test]
    async fn replayed_voice_note_is_not_downloaded_again() {
        let harness = Harness::new();
        harness.platform.push(voice(100, 1, "A"));
        harness.invoke().await.unwrap();

        // Redelivery of the same message under a later update.
        harness.platform.push(voice(105, 1, "A"));
        let report = harness.invoke().await.unwrap();
        assert_eq!(report.downloaded, 0);

        // And again after it was deleted.
        harness.platform.push(thumbs_up(106, 1));
        harness.platform.push(voice(107, 1, "A"));
        harness.invoke().await.unwrap();

        assert_eq!(harness.platform.content_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(harness.recording_count(), 0);
        assert_eq!(harness.entry(1).state, MessageState::Deleted);
    }

    #[tokio::test]
    async fn replayed_reaction_deletes_once() {
        let harness = Harness::new();
        harness.platform.push(voice(100, 1, "A"));
        harness.platform.push(thumbs_up(101, 1));
        harness.platform.push(thumbs_up(102, 1));
        harness.invoke().await.unwrap();

        harness.platform.push(thumbs_up(103, 1));
        let report = harness.invoke().await.unwrap();
        assert_eq!(report.deleted, 0);

        let entry = harness.entry(1);
        assert_eq!(entry.state, MessageState::Deleted);
        assert!(entry.acknowledged);
        assert_eq!(harness.platform.acknowledgements(), vec![1]);
    }

    #[tokio::test]
    async fn reaction_on_untracked_message_is_a_no_op() {
        let harness = Harness::new();
        harness.platform.push(thumbs_up(100, 77));

        let report = harness.invoke().await.unwrap();

        assert_eq!(report.updates, 1);
        assert_eq!(report.cursor, Cursor::new(100));
        assert!(harness.state().ledger().get(77).unwrap().is_none());
        assert!(harness.platform.reactions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reaction_before_download_leaves_note_downloadable() {
        let harness = Harness::new();
        let state = harness.state();
        state.ledger().create(1, "A").unwrap();

        let reconciler = Reconciler::new(&harness.platform, &state, harness.recordings.path(), CHAT);
        let mut report = PassReport::default();
        reconciler
            .handle_update(&thumbs_up(100, 1), &mut report)
            .await
            .unwrap();

        assert_eq!(report.deleted, 0);
        assert_eq!(state.ledger().get(1).unwrap().unwrap().state, MessageState::Seen);
        drop(reconciler);
        drop(state);

        // A later pass still downloads it.
        harness.platform.push(voice(101, 1, "A"));
        let report = harness.invoke().await.unwrap();
        assert_eq!(report.downloaded, 1);
        assert_eq!(harness.entry(1).state, MessageState::Downloaded);
        assert!(harness.recording(1).exists());
    }

    #[tokio::test]
    async fn failed_download_keeps_cursor_and_resumes() {
        let harness = Harness::new();
        harness.platform.push(text(99, CHAT, "hello"));
        harness.platform.push(voice(100, 1, "A"));
        harness.platform.fail_content.store(true, Ordering::SeqCst);

        let error = harness.invoke().await.unwrap_err();
        assert!(matches!(error, Error::Update { update_id: 100, .. }), "{error}");
        assert!(error.is_transient());
        assert_eq!(harness.state().cursor().load().unwrap(), Cursor::new(99));
        assert_eq!(harness.entry(1).state, MessageState::Seen);
        assert_eq!(harness.recording_count(), 0);

        harness.platform.fail_content.store(false, Ordering::SeqCst);
        let report = harness.invoke().await.unwrap();
        assert_eq!(report.downloaded, 1);
        assert_eq!(report.cursor, Cursor::new(100));
        assert_eq!(harness.entry(1).state, MessageState::Downloaded);
        assert_eq!(harness.recording_count(), 1);
    }

    #[tokio::test]
    async fn failed_acknowledgement_is_retried_without_side_effects() {
        let harness = Harness::new();
        harness.platform.push(voice(100, 1, "A"));
        harness.platform.push(thumbs_up(101, 1));
        harness.platform.fail_reactions.store(true, Ordering::SeqCst);

        let error = harness.invoke().await.unwrap_err();
        assert!(matches!(error, Error::Message { message_id: 1, .. }), "{error}");
        assert!(error.is_transient());

        // Deletion stands and the reaction update is consumed.
        assert!(!harness.recording(1).exists());
        let entry = harness.entry(1);
        assert_eq!(entry.state, MessageState::Deleted);
        assert!(!entry.acknowledged);
        assert_eq!(harness.state().cursor().load().unwrap(), Cursor::new(101));

        harness.platform.fail_reactions.store(false, Ordering::SeqCst);
        let report = harness.invoke().await.unwrap();

        assert_eq!(report.acknowledged, 1);
        assert_eq!(report.downloaded, 0);
        assert_eq!(report.deleted, 0);
        assert!(harness.entry(1).acknowledged);
        assert_eq!(harness.platform.acknowledgements(), vec![1]);
        assert_eq!(harness.platform.content_fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_acknowledgement_stays_owed_without_failing_the_pass() {
        let harness = Harness::new();
        harness.platform.push(voice(100, 1, "A"));
        harness.platform.push(thumbs_up(101, 1));
        harness.platform.reject_reactions.store(true, Ordering::SeqCst);

        let report = harness.invoke().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.acknowledged, 0);
        assert_eq!(report.cursor, Cursor::new(101));
        let entry = harness.entry(1);
        assert_eq!(entry.state, MessageState::Deleted);
        assert!(!entry.acknowledged);

        harness.platform.reject_reactions.store(false, Ordering::SeqCst);
        let report = harness.invoke().await.unwrap();
        assert_eq!(report.acknowledged, 1);
        assert!(harness.entry(1).acknowledged);
        assert_eq!(harness.platform.acknowledgements(), vec![1]);
    }

    #[tokio::test]
    async fn refused_download_does_not_block_other_notes() {
        let harness = Harness::new();
        harness.platform.push(voice(100, 2, "B"));
        harness.invoke().await.unwrap();

        // "Z" is content the platform refuses to serve.
        harness.platform.push(voice(101, 1, "Z"));
        harness.platform.push(thumbs_up(102, 2));

        let report = harness.invoke().await.unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.cursor, Cursor::new(102));
        assert_eq!(harness.entry(1).state, MessageState::Seen);
        assert_eq!(harness.entry(2).state, MessageState::Deleted);
        assert!(!harness.recording(2).exists());

        // Later passes keep trying the refused note and still succeed.
        let report = harness.invoke().await.unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.updates, 0);
        assert_eq!(harness.entry(1).state, MessageState::Seen);
        assert!(!harness.recording(1).exists());
    }

    #[tokio::test]
    async fn download_interrupted_after_path_was_recorded_is_redone() {
        let harness = Harness::new();
        {
            let state = harness.state();
            state.cursor().advance(100).unwrap();
            state.ledger().create(1, "A").unwrap();
            state
                .ledger()
                .set_local_path(1, &harness.recording(1))
                .unwrap();
        }
        std::fs::write(harness.recording(1), b"Og").unwrap();

        let report = harness.invoke().await.unwrap();

        assert_eq!(report.downloaded, 1);
        let entry = harness.entry(1);
        assert_eq!(entry.state, MessageState::Downloaded);
        assert_eq!(entry.local_path, Some(harness.recording(1)));
        assert_eq!(
            std::fs::read(harness.recording(1)).unwrap(),
            b"OggS voice A"
        );
        assert_eq!(harness.recording_count(), 1);
    }

    #[tokio::test]
    async fn corrupt_ledger_row_fails_the_pass() {
        let harness = Harness::new();
        drop(harness.state());
        {
            let db = redb::Database::create(harness.state_dir.path().join(STATE_FILE_NAME)).unwrap();
            let write_transaction = db.begin_write().unwrap();
            {
                let mut table = write_transaction.open_table(LEDGER_TABLE).unwrap();
                table.insert(7, "{not json").unwrap();
            }
            write_transaction.commit().unwrap();
        }
        harness.platform.push(voice(100, 1, "A"));

        let error = harness.invoke().await.unwrap_err();

        assert!(
            matches!(
                error,
                Error::Ledger(LedgerError::Store(StoreError::Corrupt { ref key, .. })) if key == "7"
            ),
            "{error}"
        );
        assert!(!error.is_transient());
        assert_eq!(harness.state().cursor().load().unwrap(), Cursor::START);
        assert_eq!(harness.platform.content_fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn interrupted_deletion_is_completed_on_next_pass() {
        let harness = Harness::new();
        harness.platform.push(voice(100, 1, "A"));
        harness.invoke().await.unwrap();

        // Crash right after the deletion was requested.
        {
            let state = harness.state();
            state.cursor().advance(101).unwrap();
            state
                .ledger()
                .transition(1, MessageState::DeletionRequested)
                .unwrap();
        }

        let report = harness.invoke().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.acknowledged, 1);
        assert!(!harness.recording(1).exists());
        let entry = harness.entry(1);
        assert_eq!(entry.state, MessageState::Deleted);
        assert!(entry.acknowledged);
    }

    #[tokio::test]
    async fn deletion_tolerates_already_removed_file() {
        let harness = Harness::new();
        harness.platform.push(voice(100, 1, "A"));
        harness.invoke().await.unwrap();
        std::fs::remove_file(harness.recording(1)).unwrap();

        harness.platform.push(thumbs_up(101, 1));
        let report = harness.invoke().await.unwrap();

        assert_eq!(report.deleted, 1);
        assert_eq!(harness.entry(1).state, MessageState::Deleted);
    }

    #[tokio::test]
    async fn platform_outage_aborts_without_moving_cursor() {
        let harness = Harness::new();
        harness.platform.push(voice(100, 1, "A"));
        harness.platform.fail_updates.store(true, Ordering::SeqCst);

        let error = harness.invoke().await.unwrap_err();
        assert!(matches!(error, Error::Platform(PlatformError::Unreachable(_))));
        assert!(error.is_transient());
        assert_eq!(harness.state().cursor().load().unwrap(), Cursor::START);
        assert!(harness.state().ledger().list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cursor_walks_every_page_and_never_regresses() {
        let mut harness = Harness::new();
        harness.platform.page_size = 2;
        for update_id in 1..=5 {
            harness.platform.push(text(update_id, 555, "chatter elsewhere"));
        }

        let report = harness.invoke().await.unwrap();
        assert_eq!(report.updates, 5);
        assert_eq!(report.cursor, Cursor::new(5));
        // Pages of 2, 2, 1.
        assert_eq!(harness.platform.update_fetches.load(Ordering::SeqCst), 3);

        let report = harness.invoke().await.unwrap();
        assert!(report.is_idle());
        assert_eq!(report.cursor, Cursor::new(5));
    }

    #[test]
    fn greeting_counts_as_activity() {
        let report = PassReport {
            greeted: 1,
            ..PassReport::default()
        };
        assert!(!report.is_idle());
        assert!(PassReport::default().is_idle());
    }

    #[tokio::test]
    async fn start_command_is_greeted() {
        let harness = Harness::new();
        harness.platform.push(text(100, CHAT, "/start"));
        harness.platform.push(text(101, 555, "/start"));

        let report = harness.invoke().await.unwrap();

        assert_eq!(report.greeted, 1);
        assert_eq!(
            *harness.platform.messages.lock().unwrap(),
            vec![(CHAT, "Hi!".to_string())]
        );
    }

    #[tokio::test]
    async fn discovery_reports_chats_without_touching_state() {
        let platform = FakePlatform::new();
        platform.push(text(1, 42, "hi"));
        platform.push(text(2, -1001, "hey"));
        platform.push(text(3, 42, "again"));

        let sightings = discover_chats(&platform).await.unwrap();

        assert_eq!(sightings.len(), 2);
        assert_eq!(sightings[0].chat_id, 42);
        assert_eq!(sightings[0].updates, 2);
        assert_eq!(sightings[0].label, "Sam");
        assert_eq!(sightings[1].chat_id, -1001);
        assert!(platform.reactions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn interrupted_write_leaves_no_partial_recording() {
        let dir = tempfile::tempdir().unwrap();
        let path = recording_path(dir.path(), 9);

        write_atomically(&path, b"first").await.unwrap();
        write_atomically(&path, b"second").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("9.ogg")]);
    }
}
