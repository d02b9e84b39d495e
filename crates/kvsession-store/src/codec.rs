//! Tensor file codec.
//!
//! Snapshots use the safetensors container layout:
//! - 8-byte little-endian header size
//! - JSON header mapping tensor names to dtype, shape and data offsets, with an
//!   optional `__metadata__` string map
//! - Raw little-endian tensor data
//!
//! ```text
//! [8 bytes: header_size (u64 LE)]
//! [header_size bytes: JSON header, space-padded to a multiple of 8]
//! [remaining bytes: tensor data]
//! ```
//!
//! Files written here can be opened by any safetensors reader, and files
//! written by other tools load here as long as they use `F32`, `I32` or `I64`.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::mmap::MappedFile;

const METADATA_KEY: &str = "__metadata__";

/// Errors raised while encoding or decoding a tensor file.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("file too small for header")]
    TooSmall,

    #[error("header size {header_size} exceeds file size {file_size}")]
    HeaderOverflow { header_size: usize, file_size: usize },

    #[error("invalid UTF-8 in header: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("invalid header JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing tensor '{0}'")]
    MissingTensor(String),

    #[error("tensor '{name}' has dtype {dtype}, expected {expected}")]
    UnexpectedDtype {
        name: String,
        dtype: String,
        expected: &'static str,
    },

    #[error("tensor '{name}' is malformed: {reason}")]
    Malformed { name: String, reason: String },
}

pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Element types the codec reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    F32,
    I32,
    I64,
}

impl Dtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dtype::F32 => "F32",
            Dtype::I32 => "I32",
            Dtype::I64 => "I64",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "F32" => Some(Dtype::F32),
            "I32" => Some(Dtype::I32),
            "I64" => Some(Dtype::I64),
            _ => None,
        }
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            Dtype::F32 | Dtype::I32 => 4,
            Dtype::I64 => 8,
        }
    }
}

/// Metadata for a single tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorInfo {
    /// Data type string ("F32", "I32", "I64").
    pub dtype: String,

    /// Tensor shape. Scalars use `[]`.
    pub shape: Vec<usize>,

    /// Byte offset range `[start, end)` within the data section.
    pub data_offsets: [usize; 2],
}

impl TensorInfo {
    pub fn byte_size(&self) -> usize {
        self.data_offsets[1].saturating_sub(self.data_offsets[0])
    }

    /// Element count, or `None` if the shape product overflows.
    pub fn num_elements(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }
}

/// Parsed file header.
#[derive(Debug)]
pub struct Header {
    pub tensors: HashMap<String, TensorInfo>,
    pub metadata: HashMap<String, String>,
    /// Byte offset where the data section begins.
    pub data_offset: usize,
}

/// Parse the header from the start of a tensor file.
pub fn parse_header(bytes: &[u8]) -> CodecResult<Header> {
    if bytes.len() < 8 {
        return Err(CodecError::TooSmall);
    }

    let header_size = (&bytes[..8]).read_u64::<LittleEndian>()? as usize;

    if header_size > bytes.len() - 8 {
        return Err(CodecError::HeaderOverflow {
            header_size,
            file_size: bytes.len(),
        });
    }

    let header_str = std::str::from_utf8(&bytes[8..8 + header_size])?;
    let raw: HashMap<String, serde_json::Value> = serde_json::from_str(header_str)?;

    let mut tensors = HashMap::new();
    let mut metadata = HashMap::new();

    for (key, value) in raw {
        if key == METADATA_KEY {
            if let Some(obj) = value.as_object() {
                for (mk, mv) in obj {
                    if let Some(s) = mv.as_str() {
                        metadata.insert(mk.clone(), s.to_string());
                    }
                }
            }
        } else {
            let info: TensorInfo = serde_json::from_value(value)?;
            tensors.insert(key, info);
        }
    }

    Ok(Header {
        tensors,
        metadata,
        data_offset: 8 + header_size,
    })
}

struct PendingTensor {
    name: String,
    dtype: Dtype,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

/// Accumulates named tensors and serializes them into one file image.
#[derive(Default)]
pub struct TensorWriter {
    tensors: Vec<PendingTensor>,
    metadata: BTreeMap<String, String>,
}

impl TensorWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn push_f32(&mut self, name: impl Into<String>, shape: &[usize], data: &[f32]) {
        let mut bytes = Vec::with_capacity(data.len() * 4);
        for &x in data {
            // Writing into a Vec cannot fail.
            let _ = bytes.write_f32::<LittleEndian>(x);
        }
        self.push(name.into(), Dtype::F32, shape, bytes);
    }

    pub fn push_i32(&mut self, name: impl Into<String>, shape: &[usize], data: &[i32]) {
        let mut bytes = Vec::with_capacity(data.len() * 4);
        for &x in data {
            let _ = bytes.write_i32::<LittleEndian>(x);
        }
        self.push(name.into(), Dtype::I32, shape, bytes);
    }

    pub fn push_i64_scalar(&mut self, name: impl Into<String>, value: i64) {
        let mut bytes = Vec::with_capacity(8);
        let _ = bytes.write_i64::<LittleEndian>(value);
        self.push(name.into(), Dtype::I64, &[], bytes);
    }

    fn push(&mut self, name: String, dtype: Dtype, shape: &[usize], bytes: Vec<u8>) {
        self.tensors.push(PendingTensor {
            name,
            dtype,
            shape: shape.to_vec(),
            bytes,
        });
    }

    /// Serialize header and data into a single buffer.
    pub fn to_bytes(&self) -> CodecResult<Vec<u8>> {
        let mut header: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        if !self.metadata.is_empty() {
            header.insert(METADATA_KEY.to_string(), serde_json::to_value(&self.metadata)?);
        }

        let mut offset = 0;
        for t in &self.tensors {
            let info = TensorInfo {
                dtype: t.dtype.as_str().to_string(),
                shape: t.shape.clone(),
                data_offsets: [offset, offset + t.bytes.len()],
            };
            offset += t.bytes.len();
            header.insert(t.name.clone(), serde_json::to_value(info)?);
        }

        let mut header_bytes = serde_json::to_vec(&header)?;
        while header_bytes.len() % 8 != 0 {
            header_bytes.push(b' ');
        }

        let mut out = Vec::with_capacity(8 + header_bytes.len() + offset);
        out.write_u64::<LittleEndian>(header_bytes.len() as u64)?;
        out.extend_from_slice(&header_bytes);
        for t in &self.tensors {
            out.extend_from_slice(&t.bytes);
        }
        Ok(out)
    }
}

/// An opened tensor file with parsed header and memory-mapped data.
pub struct TensorFile {
    pub header: Header,
    mapped: MappedFile,
}

impl TensorFile {
    /// Open and parse a tensor file.
    pub fn open(path: &Path) -> CodecResult<Self> {
        let mapped = MappedFile::open(path)?;
        let header = parse_header(mapped.as_bytes())?;
        Ok(TensorFile { header, mapped })
    }

    pub fn has_tensor(&self, name: &str) -> bool {
        self.header.tensors.contains_key(name)
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.header.metadata.get(key).map(|s| s.as_str())
    }

    fn info(&self, name: &str) -> CodecResult<&TensorInfo> {
        self.header
            .tensors
            .get(name)
            .ok_or_else(|| CodecError::MissingTensor(name.to_string()))
    }

    /// Raw bytes of a tensor, after bounds and size checks.
    fn tensor_bytes(&self, name: &str, info: &TensorInfo, dtype: Dtype) -> CodecResult<&[u8]> {
        let malformed = |reason: String| CodecError::Malformed {
            name: name.to_string(),
            reason,
        };

        let [start, end] = info.data_offsets;
        if start > end {
            return Err(malformed(format!("data offsets [{start}, {end}) are reversed")));
        }
        let expected = info
            .num_elements()
            .and_then(|n| n.checked_mul(dtype.size_bytes()))
            .ok_or_else(|| malformed(format!("shape {:?} overflows", info.shape)))?;
        if info.byte_size() != expected {
            return Err(malformed(format!(
                "{} bytes for shape {:?}, expected {expected}",
                info.byte_size(),
                info.shape
            )));
        }
        let (abs_start, abs_end) = match (
            self.header.data_offset.checked_add(start),
            self.header.data_offset.checked_add(end),
        ) {
            (Some(s), Some(e)) => (s, e),
            _ => return Err(malformed(format!("data offsets [{start}, {end}) overflow"))),
        };
        if abs_end > self.mapped.size() {
            return Err(malformed(format!(
                "data [{abs_start}..{abs_end}] exceeds file size {}",
                self.mapped.size()
            )));
        }
        Ok(&self.mapped.as_bytes()[abs_start..abs_end])
    }

    /// Read an `F32` tensor, returning its shape and values.
    pub fn read_f32(&self, name: &str) -> CodecResult<(Vec<usize>, Vec<f32>)> {
        let info = self.info(name)?;
        if Dtype::parse(&info.dtype) != Some(Dtype::F32) {
            return Err(CodecError::UnexpectedDtype {
                name: name.to_string(),
                dtype: info.dtype.clone(),
                expected: "F32",
            });
        }
        let bytes = self.tensor_bytes(name, info, Dtype::F32)?;
        let mut out = vec![0.0f32; bytes.len() / 4];
        LittleEndian::read_f32_into(bytes, &mut out);
        Ok((info.shape.clone(), out))
    }

    /// Read a token-id vector stored as `I32` or `I64`.
    ///
    /// Accepts shape `[n]` or a single-row `[1, n]`.
    pub fn read_ids(&self, name: &str) -> CodecResult<Vec<i32>> {
        let info = self.info(name)?;
        match info.shape.as_slice() {
            [_] | [1, _] => {}
            other => {
                return Err(CodecError::Malformed {
                    name: name.to_string(),
                    reason: format!("expected shape [n] or [1, n], got {other:?}"),
                })
            }
        }
        self.read_integers(name, info)
    }

    /// Read a single integer stored as `I64` or `I32`.
    pub fn read_scalar(&self, name: &str) -> CodecResult<i64> {
        let info = self.info(name)?;
        if info.num_elements() != Some(1) {
            return Err(CodecError::Malformed {
                name: name.to_string(),
                reason: format!("expected a scalar, got shape {:?}", info.shape),
            });
        }
        match Dtype::parse(&info.dtype) {
            Some(Dtype::I64) => {
                let bytes = self.tensor_bytes(name, info, Dtype::I64)?;
                Ok(LittleEndian::read_i64(bytes))
            }
            Some(Dtype::I32) => {
                let bytes = self.tensor_bytes(name, info, Dtype::I32)?;
                Ok(LittleEndian::read_i32(bytes) as i64)
            }
            _ => Err(CodecError::UnexpectedDtype {
                name: name.to_string(),
                dtype: info.dtype.clone(),
                expected: "I64",
            }),
        }
    }

    fn read_integers(&self, name: &str, info: &TensorInfo) -> CodecResult<Vec<i32>> {
        match Dtype::parse(&info.dtype) {
            Some(Dtype::I32) => {
                let bytes = self.tensor_bytes(name, info, Dtype::I32)?;
                let mut out = vec![0i32; bytes.len() / 4];
                LittleEndian::read_i32_into(bytes, &mut out);
                Ok(out)
            }
            Some(Dtype::I64) => {
                let bytes = self.tensor_bytes(name, info, Dtype::I64)?;
                let mut wide = vec![0i64; bytes.len() / 8];
                LittleEndian::read_i64_into(bytes, &mut wide);
                wide.into_iter()
                    .map(|id| {
                        i32::try_from(id).map_err(|_| CodecError::Malformed {
                            name: name.to_string(),
                            reason: format!("token id {id} out of range"),
                        })
                    })
                    .collect()
            }
            _ => Err(CodecError::UnexpectedDtype {
                name: name.to_string(),
                dtype: info.dtype.clone(),
                expected: "I32",
            }),
        }
    }
}
