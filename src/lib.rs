//! Resumable conversational sessions over an LLM inference engine.
//!
//! This crate re-exports the workspace layers:
//! - [`kv`]: per-layer key/value working memory
//! - [`engine`]: the `InferenceEngine` narrow waist
//! - [`store`]: snapshot codec, atomic persistence, conversation directories
//! - [`runtime`]: conversation context, merge/restore, streaming generation

pub use kvsession_engine as engine;
pub use kvsession_kv as kv;
pub use kvsession_runtime as runtime;
pub use kvsession_store as store;

pub use kvsession_engine::{InferenceEngine, TokenId};
pub use kvsession_runtime::{
    ConversationContext, GenerationStream, ReferenceEngine, RuntimeConfig, SessionError,
    StreamChunk,
};
pub use kvsession_store::{CacheSnapshot, InteractionSnapshot, SnapshotStore, StoreError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
