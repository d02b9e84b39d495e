//! Runtime configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kvsession_engine::TokenId;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Tunables for conversations, generation and persistence.
///
/// Every field has a default, so a JSON file only needs the fields it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Generated tokens per streamed chunk.
    pub chunk_size: usize,
    /// Maximum tokens generated per turn.
    pub response_limit: usize,
    /// Maximum encoded prompt length.
    pub prompt_limit: usize,
    /// Primary end-of-sequence token ID.
    pub eos_token_id: TokenId,
    /// Fallback end-of-sequence token ID.
    pub eos_token_id_backup: TokenId,
    /// Default interaction persistence for new conversations.
    pub save_interactions: bool,
    /// Root of the `{user}/sessions/{id}` hierarchy.
    pub sessions_root: PathBuf,
    /// Idle time after which a registered session expires.
    pub session_timeout_secs: u64,
    /// Checkpoint file name inside a conversation directory.
    pub cache_file_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4,
            response_limit: 8192,
            prompt_limit: 1024,
            eos_token_id: 151645,
            eos_token_id_backup: 151643,
            save_interactions: false,
            sessions_root: PathBuf::from("users"),
            session_timeout_secs: 120,
            cache_file_name: "session_cache.snapshot".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| SessionError::Config(format!("{}: {e}", path.display())))
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_response_limit(mut self, limit: usize) -> Self {
        self.response_limit = limit;
        self
    }

    pub fn with_prompt_limit(mut self, limit: usize) -> Self {
        self.prompt_limit = limit;
        self
    }

    pub fn with_eos_tokens(mut self, primary: TokenId, backup: TokenId) -> Self {
        self.eos_token_id = primary;
        self.eos_token_id_backup = backup;
        self
    }

    pub fn with_save_interactions(mut self, save: bool) -> Self {
        self.save_interactions = save;
        self
    }

    pub fn with_sessions_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sessions_root = root.into();
        self
    }

    pub fn with_session_timeout_secs(mut self, secs: u64) -> Self {
        self.session_timeout_secs = secs;
        self
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Check the config against an engine with `capacity` working-memory positions.
    pub fn validate(&self, capacity: usize) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SessionError::Config("chunk_size must be > 0".into()));
        }
        if self.response_limit == 0 {
            return Err(SessionError::Config("response_limit must be > 0".into()));
        }
        if self.cache_file_name.is_empty() || self.cache_file_name.contains(['/', '\\']) {
            return Err(SessionError::Config(format!(
                "cache_file_name '{}' must be a plain file name",
                self.cache_file_name
            )));
        }
        let turn = self.prompt_limit.saturating_add(self.response_limit);
        if turn > capacity {
            return Err(SessionError::Config(format!(
                "prompt_limit + response_limit = {turn} exceeds engine capacity {capacity}"
            )));
        }
        Ok(())
    }
}
