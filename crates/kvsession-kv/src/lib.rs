//! # kvsession-kv
//!
//! Live working memory (KV cache) for a conversation.
//!
//! Supports:
//! - **Decode**: Appends K/V for one token at a time, tracking the occupied length
//! - **Multi-layer**: [`WorkingMemory`] manages K/V for all layers with a synchronized occupied length
//! - **Export**: Copies the occupied prefix of every layer out as owned [`KVTensor`]s
//! - **Splice**: Copies stored tensor values back into the live buffers in place,
//!   validating every layer before any buffer is touched

use std::fmt;

/// Tensor shape: `[batch, seq_len, n_heads, head_dim]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KVShape {
    pub batch: usize,
    pub seq_len: usize,
    pub n_heads: usize,
    pub head_dim: usize,
}

impl KVShape {
    pub fn new(batch: usize, seq_len: usize, n_heads: usize, head_dim: usize) -> Self {
        Self {
            batch,
            seq_len,
            n_heads,
            head_dim,
        }
    }

    /// Elements held by a single position of a single batch row.
    pub fn row_elements(&self) -> usize {
        self.n_heads * self.head_dim
    }

    pub fn total_elements(&self) -> usize {
        self.batch * self.seq_len * self.row_elements()
    }

    /// Dimensions in storage order.
    pub fn dims(&self) -> [usize; 4] {
        [self.batch, self.seq_len, self.n_heads, self.head_dim]
    }

    /// Build a shape from storage-order dimensions. Returns `None` unless exactly four are given.
    pub fn from_dims(dims: &[usize]) -> Option<Self> {
        match dims {
            [batch, seq_len, n_heads, head_dim] => {
                Some(Self::new(*batch, *seq_len, *n_heads, *head_dim))
            }
            _ => None,
        }
    }

    /// Whether two shapes agree on everything except sequence length.
    pub fn same_geometry(&self, other: &KVShape) -> bool {
        self.batch == other.batch && self.n_heads == other.n_heads && self.head_dim == other.head_dim
    }
}

impl fmt::Display for KVShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[batch:{}, seq:{}, heads:{}, dim:{}]",
            self.batch, self.seq_len, self.n_heads, self.head_dim
        )
    }
}

/// Error type for KV cache operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KVError {
    #[error("KV cache capacity exceeded: {seq_len} > {max}")]
    CapacityExceeded { seq_len: usize, max: usize },

    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: usize, got: usize },

    #[error("Layer count mismatch: expected {expected}, got {got}")]
    LayerCountMismatch { expected: usize, got: usize },

    #[error("Layer {layer} tensor {got} is incompatible with live cache {expected}")]
    IncompatibleTensor {
        layer: usize,
        expected: KVShape,
        got: KVShape,
    },

    #[error("Tensor holds {got} positions, {needed} required")]
    TooShort { needed: usize, got: usize },
}

pub type KVResult<T> = Result<T, KVError>;

/// An owned, dense f32 tensor laid out as `[batch, seq_len, n_heads, head_dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct KVTensor {
    pub shape: KVShape,
    pub data: Vec<f32>,
}

impl KVTensor {
    /// Wrap `data`, checking that its length matches `shape`.
    pub fn new(shape: KVShape, data: Vec<f32>) -> KVResult<Self> {
        if data.len() != shape.total_elements() {
            return Err(KVError::ShapeMismatch {
                expected: shape.total_elements(),
                got: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: KVShape) -> Self {
        Self {
            data: vec![0.0; shape.total_elements()],
            shape,
        }
    }

    pub fn seq_len(&self) -> usize {
        self.shape.seq_len
    }

    /// Values for one position of one batch row, `[n_heads * head_dim]`.
    pub fn row(&self, batch: usize, pos: usize) -> &[f32] {
        let row = self.shape.row_elements();
        let offset = (batch * self.shape.seq_len + pos) * row;
        &self.data[offset..offset + row]
    }
}

/// Key and value tensors captured from one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerState {
    pub key: KVTensor,
    pub value: KVTensor,
}

/// Single layer's K and V cache.
///
/// # Invariants
/// - All operations maintain `seq_len <= capacity`
/// - K and V buffers are always the same size
/// - Buffers are allocated once; splicing copies values into them and never
///   replaces the allocation
#[derive(Debug, Clone)]
pub struct LayerKVCache {
    /// K buffer, flattened `[batch, capacity, n_heads, head_dim]`.
    pub k: Vec<f32>,
    /// V buffer, flattened `[batch, capacity, n_heads, head_dim]`.
    pub v: Vec<f32>,

    /// Maximum number of positions this layer can hold.
    pub capacity: usize,
    pub batch: usize,
    pub n_heads: usize,
    pub head_dim: usize,
    /// Occupied length (how many positions are valid).
    pub seq_len: usize,
}

impl LayerKVCache {
    /// Create a new KV cache for one layer.
    ///
    /// # Arguments
    /// - `batch`: Batch size (1 for interactive use)
    /// - `max_seq_len`: Maximum number of positions this cache can hold
    /// - `n_heads`: Number of KV heads
    /// - `head_dim`: Dimension of each head
    pub fn new(batch: usize, max_seq_len: usize, n_heads: usize, head_dim: usize) -> Self {
        let buf_len = batch * max_seq_len * n_heads * head_dim;

        Self {
            k: vec![0.0; buf_len],
            v: vec![0.0; buf_len],
            capacity: max_seq_len,
            batch,
            n_heads,
            head_dim,
            seq_len: 0,
        }
    }

    fn row_len(&self) -> usize {
        self.n_heads * self.head_dim
    }

    fn offset(&self, batch: usize, pos: usize) -> usize {
        (batch * self.capacity + pos) * self.row_len()
    }

    /// Shape of the occupied region.
    pub fn shape(&self) -> KVShape {
        KVShape::new(self.batch, self.seq_len, self.n_heads, self.head_dim)
    }

    /// Key row for one position of one batch row.
    pub fn key_at(&self, batch: usize, pos: usize) -> &[f32] {
        let offset = self.offset(batch, pos);
        &self.k[offset..offset + self.row_len()]
    }

    /// Value row for one position of one batch row.
    pub fn value_at(&self, batch: usize, pos: usize) -> &[f32] {
        let offset = self.offset(batch, pos);
        &self.v[offset..offset + self.row_len()]
    }

    /// Append K and V for a single token.
    ///
    /// `k_token`/`v_token` hold every batch row back to back,
    /// length `batch * n_heads * head_dim`.
    ///
    /// # Errors
    /// - `CapacityExceeded`: If appending would exceed max sequence length
    /// - `ShapeMismatch`: If token shape doesn't match `batch * n_heads * head_dim`
    pub fn append_token(&mut self, k_token: &[f32], v_token: &[f32]) -> KVResult<()> {
        self.check_token(k_token, v_token)?;

        let row = self.row_len();
        for b in 0..self.batch {
            let dst = self.offset(b, self.seq_len);
            self.k[dst..dst + row].copy_from_slice(&k_token[b * row..(b + 1) * row]);
            self.v[dst..dst + row].copy_from_slice(&v_token[b * row..(b + 1) * row]);
        }
        self.seq_len += 1;

        Ok(())
    }

    fn check_token(&self, k_token: &[f32], v_token: &[f32]) -> KVResult<()> {
        let expected_len = self.batch * self.row_len();

        if k_token.len() != expected_len || v_token.len() != expected_len {
            let got_len = if k_token.len() != expected_len {
                k_token.len()
            } else {
                v_token.len()
            };
            return Err(KVError::ShapeMismatch {
                expected: expected_len,
                got: got_len,
            });
        }

        if self.seq_len >= self.capacity {
            return Err(KVError::CapacityExceeded {
                seq_len: self.seq_len + 1,
                max: self.capacity,
            });
        }

        Ok(())
    }

    /// Copy the first `len` positions out as owned tensors.
    pub fn export_prefix(&self, len: usize) -> KVResult<LayerState> {
        if len > self.seq_len {
            return Err(KVError::TooShort {
                needed: len,
                got: self.seq_len,
            });
        }

        let shape = KVShape::new(self.batch, len, self.n_heads, self.head_dim);
        let mut key = Vec::with_capacity(shape.total_elements());
        let mut value = Vec::with_capacity(shape.total_elements());
        for b in 0..self.batch {
            let start = self.offset(b, 0);
            let end = self.offset(b, len);
            key.extend_from_slice(&self.k[start..end]);
            value.extend_from_slice(&self.v[start..end]);
        }

        Ok(LayerState {
            key: KVTensor { shape, data: key },
            value: KVTensor { shape, data: value },
        })
    }

    /// Validate that `state` can supply the first `len` positions of this layer.
    fn check_prefix(&self, layer: usize, state: &LayerState, len: usize) -> KVResult<()> {
        let live = self.shape();
        for tensor in [&state.key, &state.value] {
            if !tensor.shape.same_geometry(&live) {
                return Err(KVError::IncompatibleTensor {
                    layer,
                    expected: live,
                    got: tensor.shape,
                });
            }
            if tensor.data.len() != tensor.shape.total_elements() {
                return Err(KVError::ShapeMismatch {
                    expected: tensor.shape.total_elements(),
                    got: tensor.data.len(),
                });
            }
            if tensor.seq_len() < len {
                return Err(KVError::TooShort {
                    needed: len,
                    got: tensor.seq_len(),
                });
            }
        }
        if len > self.capacity {
            return Err(KVError::CapacityExceeded {
                seq_len: len,
                max: self.capacity,
            });
        }
        Ok(())
    }

    /// Copy positions `[0, len)` of `state` into the live buffers and set `seq_len = len`.
    ///
    /// Caller must have validated with `check_prefix`.
    fn write_prefix(&mut self, state: &LayerState, len: usize) {
        let row = self.row_len();
        let src_seq = state.key.seq_len();
        for b in 0..self.batch {
            let dst = self.offset(b, 0);
            let src = b * src_seq * row;
            let n = len * row;
            self.k[dst..dst + n].copy_from_slice(&state.key.data[src..src + n]);
            self.v[dst..dst + n].copy_from_slice(&state.value.data[src..src + n]);
        }
        self.seq_len = len;
    }

    /// Clear the cache (reset seq_len to 0).
    pub fn clear(&mut self) {
        self.seq_len = 0;
    }
}

/// Working memory spanning every layer of the engine.
///
/// Ensures all layers maintain a synchronized occupied length.
#[derive(Debug, Clone)]
pub struct WorkingMemory {
    layers: Vec<LayerKVCache>,
}

impl WorkingMemory {
    /// Create working memory for `n_layers` layers.
    ///
    /// # Panics
    /// If `n_layers == 0`.
    pub fn new(
        n_layers: usize,
        batch: usize,
        max_seq_len: usize,
        n_heads: usize,
        head_dim: usize,
    ) -> Self {
        assert!(n_layers > 0, "WorkingMemory requires n_layers > 0");
        let layers = (0..n_layers)
            .map(|_| LayerKVCache::new(batch, max_seq_len, n_heads, head_dim))
            .collect();

        Self { layers }
    }

    /// Get KV cache for a specific layer.
    pub fn layer(&self, layer_idx: usize) -> Option<&LayerKVCache> {
        self.layers.get(layer_idx)
    }

    /// Occupied length. All layers share it.
    pub fn seq_len(&self) -> usize {
        self.layers[0].seq_len
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Maximum number of positions.
    pub fn capacity(&self) -> usize {
        self.layers[0].capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.seq_len()
    }

    /// Append K/V for one token to all layers.
    ///
    /// All layers are validated before any is written, so a failed append
    /// leaves every layer untouched.
    pub fn append_token(&mut self, k_tokens: &[&[f32]], v_tokens: &[&[f32]]) -> KVResult<()> {
        if k_tokens.len() != self.layers.len() || v_tokens.len() != self.layers.len() {
            return Err(KVError::LayerCountMismatch {
                expected: self.layers.len(),
                got: k_tokens.len().min(v_tokens.len()),
            });
        }

        for (i, layer) in self.layers.iter().enumerate() {
            layer.check_token(k_tokens[i], v_tokens[i])?;
        }

        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.append_token(k_tokens[i], v_tokens[i])?;
        }

        Ok(())
    }

    /// Copy the first `len` positions of every layer out as owned tensors.
    pub fn export_prefix(&self, len: usize) -> KVResult<Vec<LayerState>> {
        self.layers.iter().map(|l| l.export_prefix(len)).collect()
    }

    /// Check that `states` can be spliced in with occupied length `len`, without mutating anything.
    pub fn check_splice(&self, states: &[LayerState], len: usize) -> KVResult<()> {
        if states.len() != self.layers.len() {
            return Err(KVError::LayerCountMismatch {
                expected: self.layers.len(),
                got: states.len(),
            });
        }
        for (i, (layer, state)) in self.layers.iter().zip(states).enumerate() {
            layer.check_prefix(i, state, len)?;
        }
        Ok(())
    }

    /// Copy positions `[0, len)` of every stored layer into the live buffers
    /// and set the occupied length to `len`.
    ///
    /// Validation covers every layer first; on error nothing has been written.
    pub fn splice_prefix(&mut self, states: &[LayerState], len: usize) -> KVResult<()> {
        self.check_splice(states, len)?;
        for (layer, state) in self.layers.iter_mut().zip(states) {
            layer.write_prefix(state, len);
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.clear();
        }
    }
}
