//! # kvsession-engine
//!
//! The "narrow waist" between conversation state and the inference engine.
//! Defines the [`InferenceEngine`] trait and the types every other crate speaks.
//! Session persistence, prefix merging and streaming all depend on *engine
//! behavior*, never on a particular backend.
//!
//! ## Design Notes
//!
//! ### Exclusive Ownership
//! Methods that advance working memory take `&mut self`. The engine and its
//! working memory have exactly one owner at a time (the active conversation),
//! and the borrow checker enforces that no two generations overlap.
//!
//! ### Token Type
//! `TokenId` is aliased as `i32` for FFI compatibility, though token IDs are logically
//! non-negative.

use kvsession_kv::{KVError, WorkingMemory};

pub type Result<T> = std::result::Result<T, EngineError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Top-level error type for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine not ready")]
    NotReady,
    #[error("Tokenization failed: {0}")]
    Tokenization(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("context exhausted: {needed} positions needed, {capacity} available")]
    ContextExhausted { needed: usize, capacity: usize },
    #[error("working memory error: {0}")]
    Cache(#[from] KVError),
}

/// Result of a single generation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutput {
    /// The generated token. It has already been written to working memory.
    pub token: TokenId,
    /// The engine considers this token the end of the response.
    pub is_stop: bool,
    /// Occupied working-memory length after this step.
    pub working_memory_len: usize,
}

/// The engine capability everything else plugs into.
///
/// Implementations own their working memory. Callers read and splice it
/// through [`memory`](InferenceEngine::memory) and
/// [`memory_mut`](InferenceEngine::memory_mut); values are copied into the
/// existing buffers, so the engine's storage is never swapped out from under it.
pub trait InferenceEngine {
    /// Whether weights are loaded and the engine can serve requests.
    fn is_ready(&self) -> bool {
        true
    }

    /// Convert text into token IDs, optionally framed by begin/end markers.
    fn encode(&self, text: &str, add_bos: bool, add_eos: bool) -> Result<Vec<TokenId>>;

    /// Convert token IDs back into text. Special tokens decode to nothing.
    fn decode(&self, tokens: &[TokenId]) -> Result<String>;

    /// Advance working memory over `tokens` without generating.
    fn feed(&mut self, tokens: &[TokenId]) -> Result<()>;

    /// Generate one token, append it to working memory and report it.
    fn step(&mut self) -> Result<StepOutput>;

    /// Live working memory.
    fn memory(&self) -> &WorkingMemory;

    /// Live working memory, for in-place splicing.
    fn memory_mut(&mut self) -> &mut WorkingMemory;

    /// Beginning-of-sequence token ID.
    fn bos_token_id(&self) -> TokenId;

    /// Occupied working-memory length.
    fn working_memory_len(&self) -> usize {
        self.memory().seq_len()
    }

    /// Drop everything in working memory.
    fn reset(&mut self) {
        self.memory_mut().clear();
    }
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn encode(&self, text: &str, add_bos: bool, add_eos: bool) -> Result<Vec<TokenId>> {
        (**self).encode(text, add_bos, add_eos)
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        (**self).decode(tokens)
    }

    fn feed(&mut self, tokens: &[TokenId]) -> Result<()> {
        (**self).feed(tokens)
    }

    fn step(&mut self) -> Result<StepOutput> {
        (**self).step()
    }

    fn memory(&self) -> &WorkingMemory {
        (**self).memory()
    }

    fn memory_mut(&mut self) -> &mut WorkingMemory {
        (**self).memory_mut()
    }

    fn bos_token_id(&self) -> TokenId {
        (**self).bos_token_id()
    }

    fn working_memory_len(&self) -> usize {
        (**self).working_memory_len()
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}
