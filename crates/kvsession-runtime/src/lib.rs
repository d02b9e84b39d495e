//! # kvsession-runtime
//!
//! Conversation runtime over any [`InferenceEngine`](kvsession_engine::InferenceEngine):
//! - [`ConversationContext`]: exclusively-owned live state (engine, token sequence, active directory)
//! - restore / merge / replay of stored working memory
//! - [`GenerationStream`]: chunked streaming generation with optional interaction persistence
//! - [`SessionRegistry`]: authenticated session records with idle expiry
//! - [`ReferenceEngine`]: deterministic CPU engine for demos and tests

pub mod config;
pub mod context;
pub mod error;
pub mod generation;
pub mod merge;
pub mod reference;
pub mod registry;
pub mod telemetry;

pub use config::RuntimeConfig;
pub use context::{Conversation, ConversationContext};
pub use error::{Result, SessionError};
pub use generation::{GenerationStream, StreamChunk, DONE_SENTINEL};
pub use merge::{first_divergence, MergeReport};
pub use reference::{ReferenceConfig, ReferenceEngine, REFERENCE_BOS, REFERENCE_EOS};
pub use registry::{SessionRecord, SessionRegistry};
pub use telemetry::{GenerationReport, LogTelemetry, NoopTelemetry, TelemetryHook, TurnTimer};
