//! Telegram Bot API adapter using reqwest.

use crate::cursor::Cursor;
use crate::error::PlatformError;
use crate::messaging::traits::{ChatPlatform, ReactionKind};
use crate::messaging::types::{ApiResponse, File, ReactionType, Update};
use crate::secrets::ApiToken;

use serde::de::DeserializeOwned;

use std::time::Duration;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Updates per `getUpdates` page (the Bot API maximum).
const UPDATES_PAGE_SIZE: usize = 100;

/// Request timeout. A hung request fails the run rather than blocking it forever.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Update kinds to subscribe to. Reaction updates are only delivered when
/// requested explicitly.
const ALLOWED_UPDATES: &[&str] = &["message", "message_reaction"];

/// Reactions that count as a request to delete the local copy. Exact match.
pub const CONFIRM_DELETE_EMOJI: &[&str] = &["👍", "👌"];

/// Reaction the agent sets once a deletion is done.
pub const ACKNOWLEDGE_EMOJI: &str = "🫡";

/// Map a platform emoji to the reaction it stands for.
pub fn reaction_kind(emoji: &str) -> Option<ReactionKind> {
    CONFIRM_DELETE_EMOJI
        .contains(&emoji)
        .then_some(ReactionKind::ConfirmDelete)
}

/// Emoji the agent sends for a reaction kind.
pub fn reaction_emoji(kind: ReactionKind) -> &'static str {
    match kind {
        ReactionKind::ConfirmDelete => CONFIRM_DELETE_EMOJI[0],
        ReactionKind::Acknowledge => ACKNOWLEDGE_EMOJI,
    }
}

/// Telegram Bot API client.
pub struct TelegramClient {
    http: reqwest::Client,
    token: ApiToken,
    api_base: String,
}

impl TelegramClient {
    pub fn new(token: ApiToken) -> Result<Self, PlatformError> {
        Self::with_api_base(token, DEFAULT_API_BASE)
    }

    /// Point the client at a different Bot API server (e.g. a self-hosted one).
    pub fn with_api_base(token: ApiToken, api_base: &str) -> Result<Self, PlatformError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| PlatformError::Unreachable(format!("failed to build HTTP client: {error}")))?;

        Ok(Self {
            http,
            token,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.token.expose())
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{file_path}", self.api_base, self.token.expose())
    }

    /// Transport errors carry the request URL, and with it the token.
    fn transport_error(&self, error: reqwest::Error) -> PlatformError {
        PlatformError::Unreachable(self.token.scrub(&error.without_url().to_string()))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, PlatformError> {
        let response = self
            .http
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|error| self.transport_error(error))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|error| self.transport_error(error))?;

        parse_response(status.as_u16(), &text)
    }
}

/// Turn a Bot API reply into its result or a classified error.
pub(crate) fn parse_response<T: DeserializeOwned>(
    status: u16,
    body: &str,
) -> Result<T, PlatformError> {
    let envelope: ApiResponse<T> = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(_) if status == 429 => return Err(PlatformError::RateLimited { retry_after: None }),
        Err(error) => {
            return Err(PlatformError::InvalidResponse(format!(
                "HTTP {status}: unparseable body: {error}"
            )));
        }
    };

    if envelope.ok {
        return envelope
            .result
            .ok_or_else(|| PlatformError::InvalidResponse("ok reply without result".into()));
    }

    let code = envelope.error_code.unwrap_or(i64::from(status));
    if code == 429 {
        return Err(PlatformError::RateLimited {
            retry_after: envelope.parameters.and_then(|parameters| parameters.retry_after),
        });
    }

    Err(PlatformError::Api {
        code,
        description: envelope
            .description
            .unwrap_or_else(|| "no description".into()),
    })
}

impl ChatPlatform for TelegramClient {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn fetch_updates(&self, since: Cursor) -> Result<Vec<Update>, PlatformError> {
        let updates: Vec<Update> = self
            .call(
                "getUpdates",
                serde_json::json!({
                    "offset": since.next_offset(),
                    "limit": UPDATES_PAGE_SIZE,
                    "timeout": 0,
                    "allowed_updates": ALLOWED_UPDATES,
                }),
            )
            .await?;

        tracing::debug!(count = updates.len(), offset = since.next_offset(), "fetched updates");
        Ok(updates)
    }

    async fn fetch_content(&self, file_ref: &str) -> Result<Vec<u8>, PlatformError> {
        let file: File = self
            .call("getFile", serde_json::json!({ "file_id": file_ref }))
            .await?;
        let file_path = file.file_path.ok_or_else(|| {
            PlatformError::InvalidResponse(format!("no download path for file {}", file.file_id))
        })?;

        let response = self
            .http
            .get(self.file_url(&file_path))
            .send()
            .await
            .map_err(|error| self.transport_error(error))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(PlatformError::RateLimited { retry_after: None });
        }
        if !status.is_success() {
            return Err(PlatformError::Api {
                code: i64::from(status.as_u16()),
                description: format!("file download failed for {file_ref}"),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|error| self.transport_error(error))?;

        tracing::debug!(size = bytes.len(), expected = ?file.file_size, "downloaded file content");
        Ok(bytes.to_vec())
    }

    async fn send_reaction(
        &self,
        chat_id: i64,
        message_id: i64,
        kind: ReactionKind,
    ) -> Result<(), PlatformError> {
        let _: bool = self
            .call(
                "setMessageReaction",
                serde_json::json!({
                    "chat_id": chat_id,
                    "message_id": message_id,
                    "reaction": [ReactionType::emoji(reaction_emoji(kind))],
                }),
            )
            .await?;
        Ok(())
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), PlatformError> {
        let _: serde_json::Value = self
            .call(
                "sendMessage",
                serde_json::json!({ "chat_id": chat_id, "text": text }),
            )
            .await?;
        Ok(())
    }

    fn page_size(&self) -> usize {
        UPDATES_PAGE_SIZE
    }
}

impl std::fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramClient")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}
