//! Restoring and merging stored working memory into a live conversation.
//!
//! Both entry points validate every layer against the live buffers before
//! touching them, then copy values into the existing storage. A failed
//! restore or merge leaves the token sequence and working memory exactly as
//! they were.

use std::path::Path;

use kvsession_engine::{EngineError, InferenceEngine, TokenId};
use kvsession_store::{CacheSnapshot, SnapshotStore, StoreError};
use tracing::{info, warn};

use crate::context::ConversationContext;
use crate::error::{Result, SessionError};

/// Outcome of a successful [`merge`](ConversationContext::merge).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeReport {
    /// Positions copied from the stored snapshot.
    pub occupied_length: usize,
    /// Live tokens re-fed after the splice.
    pub refed: usize,
}

/// Index of the first position where the two sequences differ, over their common length.
pub fn first_divergence(stored: &[TokenId], live: &[TokenId]) -> Option<usize> {
    stored.iter().zip(live).position(|(a, b)| a != b)
}

impl<E: InferenceEngine> ConversationContext<E> {
    /// Replace live state with a stored snapshot.
    pub fn restore(&mut self, path: &Path) -> Result<()> {
        let snapshot = load_for_restore(path)?;
        self.engine
            .memory()
            .check_splice(&snapshot.layer_states, snapshot.occupied_length)
            .map_err(|e| SessionError::RestoreFailed(e.to_string()))?;

        self.engine
            .memory_mut()
            .splice_prefix(&snapshot.layer_states, snapshot.occupied_length)
            .map_err(|e| SessionError::RestoreFailed(e.to_string()))?;
        self.tokens = snapshot.token_sequence;

        info!(
            path = %path.display(),
            tokens = self.tokens.len(),
            occupied = snapshot.occupied_length,
            "Restored working memory"
        );
        Ok(())
    }

    /// Reuse the stored snapshot's cache for the prefix shared with the live
    /// token sequence, then re-feed the live tokens past it.
    ///
    /// Fails with [`SessionError::PrefixMismatch`] if the sequences disagree
    /// anywhere in their common length.
    pub fn merge(&mut self, path: &Path) -> Result<MergeReport> {
        if self.tokens.is_empty() {
            return Err(SessionError::NoActiveConversation);
        }
        if !self.engine.is_ready() {
            return Err(SessionError::EngineNotReady);
        }
        let stored = load_for_restore(path)?;

        let common = stored.token_sequence.len().min(self.tokens.len());
        if let Some(index) = first_divergence(&stored.token_sequence, &self.tokens) {
            return Err(SessionError::PrefixMismatch { index });
        }

        // Stored positions past its occupied length have no cached values.
        let reuse = common.min(stored.occupied_length);
        let suffix: Vec<TokenId> = self.tokens[reuse..].to_vec();
        if self.tokens.len() > self.engine.memory().capacity() {
            return Err(SessionError::RestoreFailed(format!(
                "{} live tokens exceed working-memory capacity {}",
                self.tokens.len(),
                self.engine.memory().capacity()
            )));
        }

        self.engine
            .memory()
            .check_splice(&stored.layer_states, reuse)
            .map_err(|e| SessionError::RestoreFailed(e.to_string()))?;

        // Kept so a failed re-feed can put the live memory back.
        let live_len = self.engine.working_memory_len();
        let live = self
            .engine
            .memory()
            .export_prefix(live_len)
            .map_err(EngineError::from)?;

        self.engine
            .memory_mut()
            .splice_prefix(&stored.layer_states, reuse)
            .map_err(|e| SessionError::RestoreFailed(e.to_string()))?;

        if !suffix.is_empty() {
            if let Err(e) = self.engine.feed(&suffix) {
                self.engine
                    .memory_mut()
                    .splice_prefix(&live, live_len)
                    .map_err(EngineError::from)?;
                warn!(error = %e, "Re-feed failed; live working memory kept");
                return Err(e.into());
            }
        }

        info!(
            path = %path.display(),
            reused = reuse,
            refed = suffix.len(),
            "Merged stored working memory"
        );
        Ok(MergeReport {
            occupied_length: reuse,
            refed: suffix.len(),
        })
    }

    /// Rebuild working memory from the interaction files in `directory`.
    ///
    /// Clears live state and re-feeds each turn's prompt and response in load
    /// order. Returns the number of turns replayed.
    pub fn replay_interactions(&mut self, directory: &Path) -> Result<usize> {
        let turns = SnapshotStore::load_all_interactions(directory)?;
        let tokens: Vec<TokenId> = turns.iter().flat_map(|t| t.replay_tokens()).collect();

        let capacity = self.engine.memory().capacity();
        if tokens.len() > capacity {
            return Err(SessionError::Engine(EngineError::ContextExhausted {
                needed: tokens.len(),
                capacity,
            }));
        }

        self.clear();
        self.engine.feed(&tokens)?;
        self.tokens = tokens;

        info!(
            path = %directory.display(),
            turns = turns.len(),
            tokens = self.tokens.len(),
            "Replayed interactions"
        );
        Ok(turns.len())
    }
}

/// Missing and corrupt snapshots pass through; other I/O failures are restore failures.
fn load_for_restore(path: &Path) -> Result<CacheSnapshot> {
    SnapshotStore::load(path).map_err(|e| match e {
        StoreError::Io(err) => SessionError::RestoreFailed(err.to_string()),
        other => SessionError::Store(other),
    })
}
