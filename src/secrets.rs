//! Bot API credential loading and redaction.
//!
//! The token is read once from a JSON secrets file (`{"api_token": "..."}`) and
//! only ever leaves the process inside request URLs. `Debug` and `Display`
//! print `***`, and `scrub` removes it from any text headed for a log line or
//! an error message.

use crate::error::ConfigError;

use serde::Deserialize;

use std::fmt::{Debug, Display, Formatter};
use std::path::Path;

/// Bot API token. Redacted in Debug and Display.
#[derive(Clone)]
pub struct ApiToken(String);

impl ApiToken {
    pub fn new(token: impl Into<String>) -> Result<Self, ConfigError> {
        let token = token.into();
        let trimmed = token.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::Invalid("api_token is empty".into()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Read the token from a secrets file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct SecretsFile {
            api_token: String,
        }

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: SecretsFile = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::new(file.api_token)
    }

    /// Access the raw token.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Replace every occurrence of the token in `text`.
    pub fn scrub(&self, text: &str) -> String {
        text.replace(&self.0, "[REDACTED]")
    }
}

impl Debug for ApiToken {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "ApiToken(***)")
    }
}

impl Display for ApiToken {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "***")
    }
}
