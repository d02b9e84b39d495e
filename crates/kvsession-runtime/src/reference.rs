//! Deterministic CPU reference engine.
//!
//! Byte-level tokenizer (`id = byte + 3`, BOS = 1, EOS = 2) over a
//! [`WorkingMemory`] whose key/value rows are a pure function of the token and
//! everything before it. Two engines fed the same token history hold
//! bit-identical working memory, and a splice of the wrong prefix changes
//! every later row. Used by the CLI and as the test double for the runtime.

use std::collections::VecDeque;

use kvsession_engine::{EngineError, InferenceEngine, Result, StepOutput, TokenId};
use kvsession_kv::WorkingMemory;

pub const REFERENCE_BOS: TokenId = 1;
pub const REFERENCE_EOS: TokenId = 2;
const BYTE_OFFSET: TokenId = 3;
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz ";

#[derive(Debug, Clone)]
pub struct ReferenceConfig {
    pub n_layers: usize,
    pub n_heads: usize,
    pub head_dim: usize,
    pub max_seq_len: usize,
    /// One in `stop_period` sampled tokens is EOS.
    pub stop_period: u64,
    pub seed: u64,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            n_layers: 2,
            n_heads: 2,
            head_dim: 4,
            max_seq_len: 16384,
            stop_period: 48,
            seed: 12345,
        }
    }
}

/// Deterministic engine for demos and tests.
pub struct ReferenceEngine {
    config: ReferenceConfig,
    memory: WorkingMemory,
    script: Option<VecDeque<TokenId>>,
    ready: bool,
}

impl ReferenceEngine {
    pub fn new(config: ReferenceConfig) -> Self {
        let memory = WorkingMemory::new(
            config.n_layers.max(1),
            1,
            config.max_seq_len,
            config.n_heads,
            config.head_dim,
        );
        Self {
            config,
            memory,
            script: None,
            ready: true,
        }
    }

    /// Make [`step`](InferenceEngine::step) emit `tokens` in order, then EOS forever.
    pub fn with_script(mut self, tokens: impl IntoIterator<Item = TokenId>) -> Self {
        self.script = Some(tokens.into_iter().collect());
        self
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    pub fn config(&self) -> &ReferenceConfig {
        &self.config
    }

    /// Hash of the most recent position of the last layer, or the seed when empty.
    fn context_state(&self) -> u64 {
        let len = self.memory.seq_len();
        let last = self.memory.n_layers() - 1;
        match (len.checked_sub(1), self.memory.layer(last)) {
            (Some(pos), Some(layer)) => fold_row(self.config.seed, layer.key_at(0, pos)),
            _ => self.config.seed,
        }
    }

    fn write(&mut self, token: TokenId) -> Result<()> {
        let row = self.config.n_heads * self.config.head_dim;
        let pos = self.memory.seq_len();
        let mut keys = Vec::with_capacity(self.memory.n_layers());
        let mut values = Vec::with_capacity(self.memory.n_layers());

        for l in 0..self.memory.n_layers() {
            let prev = match (pos.checked_sub(1), self.memory.layer(l)) {
                (Some(p), Some(layer)) => fold_row(self.config.seed, layer.key_at(0, p)),
                _ => self.config.seed,
            };
            let base = mix(prev ^ mix(token as u64 ^ ((l as u64) << 32)));
            keys.push((0..row).map(|j| unit(mix(base ^ j as u64))).collect::<Vec<f32>>());
            values.push(
                (0..row)
                    .map(|j| unit(mix(base ^ ((j as u64) << 16) ^ 0x5bd1)))
                    .collect::<Vec<f32>>(),
            );
        }

        let k_refs: Vec<&[f32]> = keys.iter().map(|k| k.as_slice()).collect();
        let v_refs: Vec<&[f32]> = values.iter().map(|v| v.as_slice()).collect();
        self.memory.append_token(&k_refs, &v_refs)?;
        Ok(())
    }

    fn sample(&mut self) -> TokenId {
        if let Some(script) = &mut self.script {
            return script.pop_front().unwrap_or(REFERENCE_EOS);
        }
        let h = mix(self.context_state());
        if self.config.stop_period > 0 && h % self.config.stop_period == 0 {
            return REFERENCE_EOS;
        }
        let byte = ALPHABET[((h >> 8) % ALPHABET.len() as u64) as usize];
        byte as TokenId + BYTE_OFFSET
    }
}

impl Default for ReferenceEngine {
    fn default() -> Self {
        Self::new(ReferenceConfig::default())
    }
}

impl InferenceEngine for ReferenceEngine {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn encode(&self, text: &str, add_bos: bool, add_eos: bool) -> Result<Vec<TokenId>> {
        let mut ids = Vec::with_capacity(text.len() + 2);
        if add_bos {
            ids.push(REFERENCE_BOS);
        }
        ids.extend(text.bytes().map(|b| b as TokenId + BYTE_OFFSET));
        if add_eos {
            ids.push(REFERENCE_EOS);
        }
        Ok(ids)
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        let mut bytes = Vec::with_capacity(tokens.len());
        for &t in tokens {
            match t {
                REFERENCE_BOS | REFERENCE_EOS => {}
                t if (BYTE_OFFSET..BYTE_OFFSET + 256).contains(&t) => {
                    bytes.push((t - BYTE_OFFSET) as u8)
                }
                other => {
                    return Err(EngineError::Tokenization(format!(
                        "token {other} outside reference vocabulary"
                    )))
                }
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn feed(&mut self, tokens: &[TokenId]) -> Result<()> {
        if !self.ready {
            return Err(EngineError::NotReady);
        }
        if tokens.len() > self.memory.remaining() {
            return Err(EngineError::ContextExhausted {
                needed: self.memory.seq_len() + tokens.len(),
                capacity: self.memory.capacity(),
            });
        }
        for &t in tokens {
            self.write(t)?;
        }
        Ok(())
    }

    fn step(&mut self) -> Result<StepOutput> {
        if !self.ready {
            return Err(EngineError::NotReady);
        }
        if self.memory.seq_len() == 0 {
            return Err(EngineError::Inference("nothing fed to condition on".into()));
        }
        if self.memory.remaining() == 0 {
            return Err(EngineError::ContextExhausted {
                needed: self.memory.seq_len() + 1,
                capacity: self.memory.capacity(),
            });
        }
        let token = self.sample();
        self.write(token)?;
        Ok(StepOutput {
            token,
            is_stop: token == REFERENCE_EOS,
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
        REFERENCE_BOS
    }
}

/// xorshift64* finalizer.
fn mix(mut x: u64) -> u64 {
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    x.wrapping_mul(0x2545_F491_4F6C_DD1D)
}

fn fold_row(seed: u64, row: &[f32]) -> u64 {
    row.iter().fold(seed, |acc, x| mix(acc ^ x.to_bits() as u64))
}

/// Map hash bits to `[-1, 1)`.
fn unit(h: u64) -> f32 {
    ((h >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> ReferenceEngine {
        ReferenceEngine::new(ReferenceConfig {
            max_seq_len: 64,
            ..Default::default()
        })
    }

    #[test]
    fn encode_decode_round_trip_text() {
        let engine = small();
        let ids = engine.encode("hi there", true, true).unwrap();
        assert_eq!(ids.first(), Some(&REFERENCE_BOS));
        assert_eq!(ids.last(), Some(&REFERENCE_EOS));
        assert_eq!(engine.decode(&ids).unwrap(), "hi there");
    }

    #[test]
    fn decode_rejects_unknown_ids() {
        assert!(small().decode(&[151645]).is_err());
    }

    #[test]
    fn same_history_same_memory() {
        let mut a = small();
        let mut b = small();
        a.feed(&[1, 10, 11, 12]).unwrap();
        b.feed(&[1, 10]).unwrap();
        b.feed(&[11, 12]).unwrap();
        for l in 0..2 {
            assert_eq!(
                a.memory().layer(l).unwrap().key_at(0, 3),
                b.memory().layer(l).unwrap().key_at(0, 3)
            );
        }
    }

    #[test]
    fn history_changes_later_rows() {
        let mut a = small();
        let mut b = small();
        a.feed(&[1, 10, 12]).unwrap();
        b.feed(&[1, 11, 12]).unwrap();
        assert_ne!(
            a.memory().layer(0).unwrap().key_at(0, 2),
            b.memory().layer(0).unwrap().key_at(0, 2)
        );
    }

    #[test]
    fn scripted_steps_then_eos() {
        let mut engine = small().with_script([50, 51]);
        engine.feed(&[REFERENCE_BOS]).unwrap();
        assert_eq!(engine.step().unwrap().token, 50);
        assert_eq!(engine.step().unwrap().token, 51);
        let last = engine.step().unwrap();
        assert!(last.is_stop);
        assert_eq!(last.working_memory_len, 4);
    }

    #[test]
    fn sampling_is_deterministic() {
        let run = || {
            let mut engine = small();
            engine.feed(&[1, 70, 71]).unwrap();
            (0..8).map(|_| engine.step().unwrap().token).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn feed_past_capacity_leaves_memory_untouched() {
        let mut engine = small();
        engine.feed(&[5; 60]).unwrap();
        let err = engine.feed(&[5; 5]).unwrap_err();
        assert!(matches!(err, EngineError::ContextExhausted { needed: 65, capacity: 64 }));
        assert_eq!(engine.working_memory_len(), 60);
    }

    #[test]
    fn not_ready_refuses_work() {
        let mut engine = small();
        engine.set_ready(false);
        assert!(!engine.is_ready());
        assert!(matches!(engine.feed(&[1]), Err(EngineError::NotReady)));
    }
}
