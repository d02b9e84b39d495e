//! Disk-resident conversation state.
//!
//! A [`CacheSnapshot`] records where a conversation sits in working memory.
//! An [`InteractionSnapshot`] records one prompt/response turn for audit and replay.

use kvsession_engine::TokenId;
use kvsession_kv::{KVResult, KVShape, LayerState, WorkingMemory};

/// Reasons a [`CacheSnapshot`] is internally inconsistent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidSnapshot {
    #[error("snapshot has no layers")]
    NoLayers,

    #[error("occupied length {occupied} exceeds token sequence length {tokens}")]
    OccupiedBeyondTokens { occupied: usize, tokens: usize },

    #[error("layer {layer} key {key} and value {value} shapes differ")]
    KeyValueMismatch {
        layer: usize,
        key: KVShape,
        value: KVShape,
    },

    #[error("layer {layer} shape {got} differs from layer 0 shape {expected}")]
    LayerGeometry {
        layer: usize,
        expected: KVShape,
        got: KVShape,
    },

    #[error("layer {layer} holds {got} positions, occupied length is {occupied}")]
    LayerLength {
        layer: usize,
        got: usize,
        occupied: usize,
    },
}

/// A conversation's position inside the engine's working memory.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSnapshot {
    /// Every token fed so far, prompts and responses in order.
    pub token_sequence: Vec<TokenId>,
    /// Positions valid in working memory. Never exceeds `token_sequence.len()`.
    pub occupied_length: usize,
    /// One key/value pair per layer, each `[batch, occupied_length, n_heads, head_dim]`.
    pub layer_states: Vec<LayerState>,
}

impl CacheSnapshot {
    /// Copy the occupied prefix of `memory` together with the token sequence.
    pub fn capture(token_sequence: &[TokenId], memory: &WorkingMemory) -> KVResult<Self> {
        let occupied_length = memory.seq_len();
        Ok(Self {
            token_sequence: token_sequence.to_vec(),
            occupied_length,
            layer_states: memory.export_prefix(occupied_length)?,
        })
    }

    pub fn n_layers(&self) -> usize {
        self.layer_states.len()
    }

    /// Check the cross-layer invariants.
    pub fn validate(&self) -> Result<(), InvalidSnapshot> {
        let first = self.layer_states.first().ok_or(InvalidSnapshot::NoLayers)?;

        if self.occupied_length > self.token_sequence.len() {
            return Err(InvalidSnapshot::OccupiedBeyondTokens {
                occupied: self.occupied_length,
                tokens: self.token_sequence.len(),
            });
        }

        let expected = first.key.shape;
        for (layer, state) in self.layer_states.iter().enumerate() {
            if state.key.shape != state.value.shape {
                return Err(InvalidSnapshot::KeyValueMismatch {
                    layer,
                    key: state.key.shape,
                    value: state.value.shape,
                });
            }
            if !state.key.shape.same_geometry(&expected) {
                return Err(InvalidSnapshot::LayerGeometry {
                    layer,
                    expected,
                    got: state.key.shape,
                });
            }
            if state.key.seq_len() != self.occupied_length {
                return Err(InvalidSnapshot::LayerLength {
                    layer,
                    got: state.key.seq_len(),
                    occupied: self.occupied_length,
                });
            }
        }
        Ok(())
    }
}

/// One prompt/response turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractionSnapshot {
    pub prompt_ids: Vec<TokenId>,
    pub response_ids: Vec<TokenId>,
    /// Working-memory length before the prompt was fed.
    pub start_offset: usize,
    /// Working-memory length after the response finished.
    pub end_offset: usize,
}

impl InteractionSnapshot {
    /// Tokens to re-feed to reproduce this turn.
    pub fn replay_tokens(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.prompt_ids.iter().chain(&self.response_ids).copied()
    }
}
