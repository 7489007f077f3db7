//! Agent configuration: which chat to watch and where recordings live.

use crate::error::ConfigError;

use serde::Deserialize;

use std::path::{Path, PathBuf};

/// Configuration loaded from the JSON config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Chat to watch. `None` runs discovery only.
    pub chat_id: Option<i64>,
    /// Directory that receives one file per downloaded voice note.
    pub recordings_dir: PathBuf,
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    chat_id: Option<i64>,
    recordings_dir: String,
}

impl Config {
    /// Load and validate the config file. The recordings directory must
    /// already exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let recordings_dir = expand_home(&raw.recordings_dir)?;
        if !recordings_dir.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "recordings_dir must be a directory ({})",
                recordings_dir.display()
            )));
        }

        Ok(Self {
            chat_id: raw.chat_id,
            recordings_dir,
        })
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_home(path: &str) -> Result<PathBuf, ConfigError> {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return Ok(PathBuf::from(path)),
    };

    let home = dirs::home_dir()
        .ok_or_else(|| ConfigError::Invalid("cannot determine home directory".into()))?;
    Ok(home.join(rest))
}
