//! The exclusively-owned conversation context.
//!
//! A [`ConversationContext`] owns the engine, the live token sequence and the
//! active conversation directory. Every operation that touches working memory
//! takes `&mut self`, so at most one generation, restore or merge can be in
//! flight at a time.

use std::path::{Path, PathBuf};

use kvsession_engine::{InferenceEngine, TokenId};
use kvsession_store::{CacheSnapshot, SessionDirectories, SnapshotStore};
use tracing::info;

use crate::config::RuntimeConfig;
use crate::error::{Result, SessionError};
use crate::generation::GenerationStream;
use crate::telemetry::{GenerationReport, NoopTelemetry, TelemetryHook};

/// The conversation currently bound to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub username: String,
    /// Numeric ID for allocated directories; `None` for renamed ones.
    pub conversation_id: Option<u64>,
    pub directory: PathBuf,
    pub save_interactions: bool,
}

pub struct ConversationContext<E: InferenceEngine> {
    pub(crate) engine: E,
    pub(crate) config: RuntimeConfig,
    pub(crate) directories: SessionDirectories,
    pub(crate) tokens: Vec<TokenId>,
    pub(crate) conversation: Option<Conversation>,
    pub(crate) last_report: Option<GenerationReport>,
}

impl<E: InferenceEngine> ConversationContext<E> {
    /// Wrap `engine`, checking `config` against its working-memory capacity.
    pub fn new(engine: E, config: RuntimeConfig) -> Result<Self> {
        config.validate(engine.memory().capacity())?;
        let directories = SessionDirectories::new(&config.sessions_root);
        Ok(Self {
            engine,
            config,
            directories,
            tokens: Vec::new(),
            conversation: None,
            last_report: None,
        })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn directories(&self) -> &SessionDirectories {
        &self.directories
    }

    /// Every token fed so far, prompts and responses in order.
    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    /// Positions currently valid in working memory.
    pub fn occupied_length(&self) -> usize {
        self.engine.working_memory_len()
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.conversation.as_ref()
    }

    /// Report from the most recently finished generation.
    pub fn last_report(&self) -> Option<&GenerationReport> {
        self.last_report.as_ref()
    }

    pub fn set_save_interactions(&mut self, save: bool) {
        if let Some(conv) = &mut self.conversation {
            conv.save_interactions = save;
        }
    }

    /// Start a fresh conversation for `username` in a newly allocated directory.
    pub fn connect(&mut self, username: &str, save_interactions: bool) -> Result<PathBuf> {
        let directory = self.directories.allocate(username)?;
        self.directories.set_active(&directory);
        self.clear();
        let conversation_id = directory
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse().ok());
        self.conversation = Some(Conversation {
            username: username.to_string(),
            conversation_id,
            directory: directory.clone(),
            save_interactions,
        });
        info!(user = username, path = %directory.display(), save_interactions, "Connected");
        Ok(directory)
    }

    /// Bind an existing conversation directory and restore its checkpoint, if any.
    ///
    /// Returns whether a checkpoint was restored. Without one, live state is
    /// cleared and the conversation starts from an empty working memory.
    pub fn open(&mut self, username: &str, name: &str, save_interactions: bool) -> Result<bool> {
        let directory = self.directories.open(username, name)?;
        self.clear();
        self.conversation = Some(Conversation {
            username: username.to_string(),
            conversation_id: name.parse().ok(),
            directory: directory.clone(),
            save_interactions,
        });

        let cache = directory.join(&self.config.cache_file_name);
        if cache.is_file() {
            self.restore(&cache)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Drop the conversation binding and all live state.
    pub fn disconnect(&mut self) {
        self.clear();
        self.conversation = None;
        self.directories.clear_active();
    }

    /// Empty the token sequence and the engine's working memory.
    pub fn clear(&mut self) {
        self.tokens.clear();
        self.engine.reset();
    }

    /// Save the live state as the active conversation's checkpoint.
    pub fn checkpoint(&self) -> Result<PathBuf> {
        let directory = self.active_directory()?;
        let path = directory.join(&self.config.cache_file_name);
        let snapshot = CacheSnapshot::capture(&self.tokens, self.engine.memory())
            .map_err(kvsession_engine::EngineError::from)?;
        SnapshotStore::save(&snapshot, &path)?;
        info!(path = %path.display(), occupied = snapshot.occupied_length, "Checkpoint written");
        Ok(path)
    }

    /// Stream a response to `prompt`.
    pub fn generate(&mut self, prompt: &str) -> GenerationStream<'_, E> {
        self.generate_with(prompt, Box::new(NoopTelemetry))
    }

    /// Stream a response to `prompt`, reporting timings to `hook`.
    pub fn generate_with(
        &mut self,
        prompt: &str,
        hook: Box<dyn TelemetryHook>,
    ) -> GenerationStream<'_, E> {
        GenerationStream::new(self, prompt, hook)
    }

    pub(crate) fn active_directory(&self) -> Result<&Path> {
        self.conversation
            .as_ref()
            .map(|c| c.directory.as_path())
            .ok_or(SessionError::NoConversationDirectory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{ReferenceConfig, ReferenceEngine};

    fn context(root: &Path) -> ConversationContext<ReferenceEngine> {
        let engine = ReferenceEngine::new(ReferenceConfig {
            max_seq_len: 256,
            ..Default::default()
        });
        let config = RuntimeConfig::default()
            .with_sessions_root(root)
            .with_prompt_limit(64)
            .with_response_limit(64);
        ConversationContext::new(engine, config).unwrap()
    }

    #[test]
    fn new_rejects_config_that_does_not_fit() {
        let engine = ReferenceEngine::new(ReferenceConfig {
            max_seq_len: 128,
            ..Default::default()
        });
        assert!(matches!(
            ConversationContext::new(engine, RuntimeConfig::default()),
            Err(SessionError::Config(_))
        ));
    }

    #[test]
    fn connect_allocates_and_activates() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = context(root.path());

        let first = ctx.connect("alice", false).unwrap();
        assert!(first.ends_with("alice/sessions/0"));
        let second = ctx.connect("alice", true).unwrap();
        assert!(second.ends_with("alice/sessions/1"));

        let conv = ctx.conversation().unwrap();
        assert_eq!(conv.conversation_id, Some(1));
        assert!(conv.save_interactions);
        assert_eq!(ctx.directories().active(), Some(second.as_path()));
    }

    #[test]
    fn connect_clears_live_state() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = context(root.path());
        ctx.connect("alice", false).unwrap();
        ctx.generate("hello").for_each(drop);
        assert!(ctx.occupied_length() > 0);

        ctx.connect("alice", false).unwrap();
        assert!(ctx.tokens().is_empty());
        assert_eq!(ctx.occupied_length(), 0);
    }

    #[test]
    fn checkpoint_requires_a_directory() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path());
        assert!(matches!(
            ctx.checkpoint(),
            Err(SessionError::NoConversationDirectory)
        ));
    }

    #[test]
    fn open_restores_checkpoint() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = context(root.path());
        ctx.connect("alice", false).unwrap();
        ctx.generate("remember me").for_each(drop);
        ctx.checkpoint().unwrap();
        let tokens = ctx.tokens().to_vec();

        ctx.connect("alice", false).unwrap();
        assert!(ctx.open("alice", "0", false).unwrap());
        assert_eq!(ctx.tokens(), tokens.as_slice());
        assert_eq!(ctx.occupied_length(), tokens.len());

        // A conversation without a checkpoint opens empty.
        assert!(!ctx.open("alice", "1", false).unwrap());
        assert!(ctx.tokens().is_empty());
    }

    #[test]
    fn disconnect_releases_directory() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = context(root.path());
        ctx.connect("alice", false).unwrap();
        ctx.disconnect();
        assert!(ctx.conversation().is_none());
        assert!(ctx.directories().active().is_none());
        ctx.directories().delete("alice", "0").unwrap();
    }
}
