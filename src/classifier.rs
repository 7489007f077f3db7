//! Classifies raw platform updates into the events the reconciler acts on.
//!
//! Pure and stateless: it never looks at the ledger.

use crate::messaging::telegram::reaction_kind;
use crate::messaging::traits::ReactionKind;
use crate::messaging::types::{MessageReactionUpdated, ReactionType, Update};

/// Command that greets the chat.
const START_COMMAND: &str = "/start";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A voice note was posted in the watched chat.
    NewVoiceNote { message_id: i64, file_ref: String },
    /// A qualifying reaction was added to a message in the watched chat.
    Reaction {
        message_id: i64,
        reaction_kind: ReactionKind,
    },
    /// `/start` was sent in the watched chat.
    Start { message_id: i64 },
    Irrelevant,
}

/// Classify one update for the chat `chat_id`.
pub fn classify(update: &Update, chat_id: i64) -> Event {
    if update.chat().map(|chat| chat.id) != Some(chat_id) {
        return Event::Irrelevant;
    }

    if let Some(message) = &update.message {
        if let Some(voice) = &message.voice {
            return Event::NewVoiceNote {
                message_id: message.message_id,
                file_ref: voice.file_id.clone(),
            };
        }
        if is_start_command(message.text.as_deref()) {
            return Event::Start {
                message_id: message.message_id,
            };
        }
        return Event::Irrelevant;
    }

    if let Some(reaction) = &update.message_reaction
        && let Some(reaction_kind) = added_reaction(reaction)
    {
        return Event::Reaction {
            message_id: reaction.message_id,
            reaction_kind,
        };
    }

    Event::Irrelevant
}

/// The recognised reaction newly added by a person, if any. Reactions that
/// were already present, or that come from bots (including this one), do not
/// count.
fn added_reaction(reaction: &MessageReactionUpdated) -> Option<ReactionKind> {
    if reaction.user.as_ref().is_some_and(|user| user.is_bot) {
        return None;
    }

    reaction
        .new_reaction
        .iter()
        .filter(|added| !reaction.old_reaction.contains(*added))
        .filter_map(ReactionType::as_emoji)
        .find_map(reaction_kind)
}

/// `/start`, optionally addressed (`/start@SomeBot`) or with a payload.
fn is_start_command(text: Option<&str>) -> bool {
    let Some(command) = text.and_then(|text| text.split_whitespace().next()) else {
        return false;
    };
    command == START_COMMAND
        || command
            .strip_prefix(START_COMMAND)
            .is_some_and(|rest| rest.starts_with('@'))
}
