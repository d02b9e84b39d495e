//! Error types for conversation-level operations.

use kvsession_engine::EngineError;
use kvsession_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("token sequences diverge at index {index}")]
    PrefixMismatch { index: usize },

    #[error("no active conversation to merge into")]
    NoActiveConversation,

    #[error("engine not ready")]
    EngineNotReady,

    #[error("restore failed: {0}")]
    RestoreFailed(String),

    #[error("no conversation directory; connect first")]
    NoConversationDirectory,

    #[error("empty prompt")]
    EmptyPrompt,

    #[error("prompt is {len} tokens, limit is {limit}")]
    PromptTooLong { len: usize, limit: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T> = std::result::Result<T, SessionError>;
