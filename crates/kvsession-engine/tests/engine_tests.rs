//! Integration tests for the engine capability trait.
//!
//! Validates:
//! - InferenceEngine can be implemented by a minimal mock backend
//! - Default methods (working_memory_len, reset, is_ready) track working memory
//! - Boxed engines dispatch through the trait
//! - Error types display correctly and carry context

use kvsession_engine::*;
use kvsession_kv::{KVError, WorkingMemory};

// ---------------------------------------------------------------------------
// Mock backend
// ---------------------------------------------------------------------------

/// Echo engine: every token is a byte, and generation repeats the last fed byte
/// until a fixed budget runs out, then emits EOS.
struct EchoEngine {
    memory: WorkingMemory,
    last: Option<TokenId>,
    budget: usize,
}

const BOS: TokenId = 1;
const EOS: TokenId = 2;

impl EchoEngine {
    fn new(budget: usize) -> Self {
        Self {
            memory: WorkingMemory::new(2, 1, 32, 1, 2),
            last: None,
            budget,
        }
    }

    fn write(&mut self, token: TokenId) -> Result<()> {
        let row = [token as f32, self.memory.seq_len() as f32];
        let row: &[f32] = &row;
        self.memory.append_token(&[row, row], &[row, row])?;
        self.last = Some(token);
        Ok(())
    }
}

impl InferenceEngine for EchoEngine {
    fn encode(&self, text: &str, add_bos: bool, add_eos: bool) -> Result<Vec<TokenId>> {
        let mut ids = Vec::new();
        if add_bos {
            ids.push(BOS);
        }
        ids.extend(text.bytes().map(|b| b as TokenId + 3));
        if add_eos {
            ids.push(EOS);
        }
        Ok(ids)
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        let bytes: Vec<u8> = tokens
            .iter()
            .filter(|&&t| t >= 3)
            .map(|&t| (t - 3) as u8)
            .collect();
        String::from_utf8(bytes).map_err(|e| EngineError::Tokenization(e.to_string()))
    }

    fn feed(&mut self, tokens: &[TokenId]) -> Result<()> {
        for &t in tokens {
            self.write(t)?;
        }
        Ok(())
    }

    fn step(&mut self) -> Result<StepOutput> {
        let token = if self.budget == 0 {
            EOS
        } else {
            self.budget -= 1;
            self.last.ok_or(EngineError::Inference("nothing fed".into()))?
        };
        self.write(token)?;
        Ok(StepOutput {
            token,
            is_stop: token == EOS,
            working_memory_len: self.memory.seq_len(),
        })
    }

    fn memory(&self) -> &WorkingMemory {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut WorkingMemory {
        &mut self.memory
    }

    fn bos_token_id(&self) -> TokenId {
        BOS
    }
}

// ---------------------------------------------------------------------------
// Trait behaviour
// ---------------------------------------------------------------------------

#[test]
fn encode_adds_markers_on_request() {
    let engine = EchoEngine::new(0);
    assert_eq!(engine.encode("a", false, false).unwrap(), vec![100]);
    assert_eq!(engine.encode("a", true, true).unwrap(), vec![BOS, 100, EOS]);
}

#[test]
fn decode_skips_special_tokens() {
    let engine = EchoEngine::new(0);
    let ids = engine.encode("hi", true, true).unwrap();
    assert_eq!(engine.decode(&ids).unwrap(), "hi");
}

#[test]
fn feed_and_step_advance_working_memory() {
    let mut engine = EchoEngine::new(2);
    engine.feed(&[BOS, 100]).unwrap();
    assert_eq!(engine.working_memory_len(), 2);

    let first = engine.step().unwrap();
    assert_eq!(first.token, 100);
    assert!(!first.is_stop);
    assert_eq!(first.working_memory_len, 3);

    engine.step().unwrap();
    let last = engine.step().unwrap();
    assert!(last.is_stop);
    assert_eq!(engine.working_memory_len(), 5);
}

#[test]
fn default_reset_clears_working_memory() {
    let mut engine = EchoEngine::new(0);
    engine.feed(&[5, 6, 7]).unwrap();
    engine.reset();
    assert_eq!(engine.working_memory_len(), 0);
    assert!(engine.is_ready());
}

#[test]
fn boxed_engine_dispatches_through_trait() {
    let mut engine: Box<dyn InferenceEngine> = Box::new(EchoEngine::new(1));
    engine.feed(&[BOS, 104]).unwrap();
    let out = engine.step().unwrap();
    assert_eq!(out.token, 104);
    assert_eq!(engine.working_memory_len(), 3);
    assert_eq!(engine.bos_token_id(), BOS);
}

#[test]
fn capacity_overflow_surfaces_as_cache_error() {
    let mut engine = EchoEngine::new(0);
    let tokens: Vec<TokenId> = (0..33).collect();
    let err = engine.feed(&tokens).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Cache(KVError::CapacityExceeded { seq_len: 33, max: 32 })
    ));
}

// ---------------------------------------------------------------------------
// Error display
// ---------------------------------------------------------------------------

#[test]
fn error_messages_carry_context() {
    assert_eq!(EngineError::NotReady.to_string(), "engine not ready");
    assert_eq!(
        EngineError::ContextExhausted {
            needed: 10,
            capacity: 4
        }
        .to_string(),
        "context exhausted: 10 positions needed, 4 available"
    );
    assert!(EngineError::Tokenization("bad".into())
        .to_string()
        .contains("bad"));
}
