//! Chat platform client (Telegram).

pub mod telegram;
pub mod traits;
pub mod types;

pub use telegram::TelegramClient;
pub use traits::{ChatPlatform, ReactionKind};
pub use types::Update;
