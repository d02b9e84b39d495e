//! Streaming generation for one prompt-to-response turn.
//!
//! [`GenerationStream`] is a lazy, finite iterator of [`StreamChunk`]s. Each
//! call to `next` runs decode steps until a chunk of `chunk_size` tokens is
//! ready, so the caller regains control at every chunk boundary.
//!
//! The stream always ends with exactly one [`StreamChunk::Done`]. Failures
//! (engine not ready, empty or oversized prompt, engine errors) surface as a
//! [`StreamChunk::Error`] immediately before it.
//!
//! Dropping the stream early does not cancel the turn: the remaining steps
//! run to completion and their output is discarded, so the token sequence and
//! working memory stay aligned.

use std::collections::VecDeque;
use std::iter::FusedIterator;
use std::path::{Path, PathBuf};

use kvsession_engine::{EngineError, InferenceEngine, TokenId};
use kvsession_store::{InteractionSnapshot, SnapshotStore};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::context::ConversationContext;
use crate::error::{Result, SessionError};
use crate::telemetry::{TelemetryHook, TurnTimer};

/// Text carried by the terminal chunk.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One unit of the output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// Decoded text for up to `chunk_size` generated tokens.
    Text(String),
    /// The turn failed; the message describes why.
    Error(String),
    /// End of stream.
    Done,
}

impl StreamChunk {
    pub fn text(&self) -> &str {
        match self {
            StreamChunk::Text(text) | StreamChunk::Error(text) => text,
            StreamChunk::Done => DONE_SENTINEL,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamChunk::Done)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamChunk::Error(_))
    }

    /// Server-Sent Events framing: `data: {"text": ...}\n\n`.
    pub fn to_sse(&self) -> String {
        let body = match self {
            StreamChunk::Error(message) => json!({ "text": message, "error": true }),
            other => json!({ "text": other.text() }),
        };
        format!("data: {body}\n\n")
    }
}

enum Phase {
    Prefill(String),
    Decode,
    Finished,
}

/// Iterator over the chunks of one turn. Borrows the context exclusively.
pub struct GenerationStream<'a, E: InferenceEngine> {
    ctx: &'a mut ConversationContext<E>,
    phase: Phase,
    pending: VecDeque<StreamChunk>,
    buffer: Vec<TokenId>,
    prompt_ids: Vec<TokenId>,
    response_ids: Vec<TokenId>,
    start_offset: usize,
    stop_tokens: [TokenId; 3],
    hook: Option<Box<dyn TelemetryHook>>,
    timer: Option<TurnTimer>,
    interaction_path: Option<PathBuf>,
}

impl<'a, E: InferenceEngine> GenerationStream<'a, E> {
    pub(crate) fn new(
        ctx: &'a mut ConversationContext<E>,
        prompt: &str,
        hook: Box<dyn TelemetryHook>,
    ) -> Self {
        let stop_tokens = [
            ctx.config.eos_token_id,
            ctx.config.eos_token_id_backup,
            ctx.engine.bos_token_id(),
        ];
        Self {
            ctx,
            phase: Phase::Prefill(prompt.to_string()),
            pending: VecDeque::new(),
            buffer: Vec::new(),
            prompt_ids: Vec::new(),
            response_ids: Vec::new(),
            start_offset: 0,
            stop_tokens,
            hook: Some(hook),
            timer: None,
            interaction_path: None,
        }
    }

    /// Where this turn's interaction file was written, if persistence is on.
    pub fn interaction_path(&self) -> Option<&Path> {
        self.interaction_path.as_deref()
    }

    pub fn prompt_ids(&self) -> &[TokenId] {
        &self.prompt_ids
    }

    fn prefill(&mut self, prompt: &str) -> Result<()> {
        let ctx = &mut *self.ctx;
        if !ctx.engine.is_ready() {
            return Err(SessionError::EngineNotReady);
        }
        if prompt.trim().is_empty() {
            return Err(SessionError::EmptyPrompt);
        }

        // Working memory already starts with BOS after the first turn.
        let first_turn = ctx.tokens.is_empty();
        let prompt_ids = ctx.engine.encode(prompt, first_turn, true)?;
        if prompt_ids.len() > ctx.config.prompt_limit {
            return Err(SessionError::PromptTooLong {
                len: prompt_ids.len(),
                limit: ctx.config.prompt_limit,
            });
        }

        // A restored snapshot may hold tokens past its occupied length.
        let occupied = ctx.engine.working_memory_len();
        let mut feed: Vec<TokenId> = ctx.tokens.get(occupied..).unwrap_or_default().to_vec();
        feed.extend_from_slice(&prompt_ids);
        if feed.len() > ctx.engine.memory().remaining() {
            return Err(EngineError::ContextExhausted {
                needed: occupied + feed.len(),
                capacity: ctx.engine.memory().capacity(),
            }
            .into());
        }

        let hook = self
            .hook
            .take()
            .unwrap_or_else(|| Box::new(crate::telemetry::NoopTelemetry));
        let mut timer = TurnTimer::start(prompt_ids.len(), occupied, hook);
        ctx.engine.feed(&feed)?;
        ctx.tokens.extend_from_slice(&prompt_ids);
        timer.prefill_done();

        debug!(prompt_tokens = prompt_ids.len(), start_offset = occupied, "Prompt fed");
        self.start_offset = occupied;
        self.prompt_ids = prompt_ids;
        self.timer = Some(timer);
        Ok(())
    }

    /// Run one decode step. Returns `true` once the turn should end.
    fn decode_step(&mut self) -> Result<bool> {
        if self.response_ids.len() >= self.ctx.config.response_limit {
            debug!(limit = self.ctx.config.response_limit, "Response limit reached");
            return Ok(true);
        }

        let out = self.ctx.engine.step()?;
        if let Some(timer) = &mut self.timer {
            timer.step_done();
        }
        self.ctx.tokens.push(out.token);
        self.response_ids.push(out.token);

        if out.is_stop || self.stop_tokens.contains(&out.token) {
            return Ok(true);
        }

        self.buffer.push(out.token);
        if self.buffer.len() >= self.ctx.config.chunk_size {
            self.flush()?;
        }
        Ok(false)
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let text = self.ctx.engine.decode(&self.buffer)?;
        debug!(tokens = self.buffer.len(), "Flushing chunk");
        self.buffer.clear();
        self.pending.push_back(StreamChunk::Text(text));
        Ok(())
    }

    fn finish(&mut self) {
        if let Err(e) = self.flush() {
            self.fail(e);
            return;
        }

        let end_offset = self.ctx.engine.working_memory_len();
        self.persist_interaction(end_offset);

        if let Some(timer) = self.timer.take() {
            let report = timer.finish(end_offset);
            info!(
                prompt_tokens = report.prompt_tokens,
                generated_tokens = report.generated_tokens,
                tokens_per_sec = report.tokens_per_sec,
                start_offset = report.start_offset,
                end_offset = report.end_offset,
                "Generation complete"
            );
            self.ctx.last_report = Some(report);
        }

        self.pending.push_back(StreamChunk::Done);
        self.phase = Phase::Finished;
    }

    fn fail(&mut self, err: SessionError) {
        if !self.buffer.is_empty() {
            if let Ok(text) = self.ctx.engine.decode(&self.buffer) {
                self.pending.push_back(StreamChunk::Text(text));
            }
            self.buffer.clear();
        }
        warn!(error = %err, "Generation failed");
        self.pending.push_back(StreamChunk::Error(err.to_string()));
        self.pending.push_back(StreamChunk::Done);
        self.phase = Phase::Finished;
    }

    fn persist_interaction(&mut self, end_offset: usize) {
        let Some(conv) = self.ctx.conversation.as_ref() else {
            return;
        };
        if !conv.save_interactions {
            return;
        }
        let interaction = InteractionSnapshot {
            prompt_ids: self.prompt_ids.clone(),
            response_ids: self.response_ids.clone(),
            start_offset: self.start_offset,
            end_offset,
        };
        match SnapshotStore::save_interaction(&interaction, &conv.directory) {
            Ok(path) => self.interaction_path = Some(path),
            Err(e) => warn!(
                error = %e,
                directory = %conv.directory.display(),
                "Failed to save interaction"
            ),
        }
    }
}

impl<E: InferenceEngine> Iterator for GenerationStream<'_, E> {
    type Item = StreamChunk;

    fn next(&mut self) -> Option<StreamChunk> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Some(chunk);
            }
            match std::mem::replace(&mut self.phase, Phase::Finished) {
                Phase::Finished => return None,
                Phase::Prefill(prompt) => match self.prefill(&prompt) {
                    Ok(()) => self.phase = Phase::Decode,
                    Err(e) => self.fail(e),
                },
                Phase::Decode => match self.decode_step() {
                    Ok(true) => self.finish(),
                    Ok(false) => self.phase = Phase::Decode,
                    Err(e) => self.fail(e),
                },
            }
        }
    }
}

impl<E: InferenceEngine> FusedIterator for GenerationStream<'_, E> {}

impl<E: InferenceEngine> Drop for GenerationStream<'_, E> {
    fn drop(&mut self) {
        while !matches!(self.phase, Phase::Finished) {
            if self.next().is_none() {
                break;
            }
        }
    }
}
