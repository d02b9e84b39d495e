//! Snapshot persistence.
//!
//! Every write goes to a temporary file in the destination directory and is
//! renamed into place, so a reader never observes a partially-written snapshot.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use kvsession_kv::{KVShape, KVTensor, LayerState};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::codec::{CodecError, TensorFile, TensorWriter};
use crate::error::{Result, StoreError};
use crate::snapshot::{CacheSnapshot, InteractionSnapshot};

const CACHE_FORMAT: &str = "kvsession-cache";
const INTERACTION_FORMAT: &str = "kvsession-interaction";
const INTERACTION_PREFIX: &str = "interaction_";
const SNAPSHOT_EXTENSIONS: &[&str] = &["snapshot", "safetensors"];
const MAX_NOCLOBBER_ATTEMPTS: usize = 16;

/// Loads and saves snapshots. Holds no state; all policy lives with the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotStore;

impl SnapshotStore {
    /// Write `snapshot` to `path`, replacing any existing file.
    pub fn save(snapshot: &CacheSnapshot, path: &Path) -> Result<()> {
        let mut writer = TensorWriter::new()
            .metadata("format", CACHE_FORMAT)
            .metadata("num_layers", snapshot.n_layers().to_string());

        let n = snapshot.token_sequence.len();
        writer.push_i32("token_sequence", &[n], &snapshot.token_sequence);
        writer.push_i64_scalar("occupied_length", snapshot.occupied_length as i64);
        for (i, state) in snapshot.layer_states.iter().enumerate() {
            writer.push_f32(
                format!("layers.{i}.key"),
                &state.key.shape.dims(),
                &state.key.data,
            );
            writer.push_f32(
                format!("layers.{i}.value"),
                &state.value.shape.dims(),
                &state.value.data,
            );
        }

        let bytes = writer.to_bytes().map_err(|e| codec_to_io(path, e))?;
        let tmp = write_temp(path, &bytes)?;
        tmp.persist(path).map_err(|e| e.error)?;

        info!(
            path = %path.display(),
            tokens = n,
            occupied = snapshot.occupied_length,
            layers = snapshot.n_layers(),
            bytes = bytes.len(),
            "Saved cache snapshot"
        );
        Ok(())
    }

    /// Read a cache snapshot, validating its cross-layer invariants.
    pub fn load(path: &Path) -> Result<CacheSnapshot> {
        let file = open(path)?;
        let corrupt = |reason: String| StoreError::SnapshotCorrupt {
            path: path.to_path_buf(),
            reason,
        };

        let token_sequence = file
            .read_ids("token_sequence")
            .map_err(|e| corrupt(e.to_string()))?;
        let occupied = file
            .read_scalar("occupied_length")
            .map_err(|e| corrupt(e.to_string()))?;
        let occupied_length =
            usize::try_from(occupied).map_err(|_| corrupt(format!("occupied length {occupied}")))?;

        let n_layers = layer_count(&file).map_err(&corrupt)?;
        let mut layer_states = Vec::new();
        for i in 0..n_layers {
            let key = read_kv(&file, &format!("layers.{i}.key")).map_err(&corrupt)?;
            let value = read_kv(&file, &format!("layers.{i}.value")).map_err(&corrupt)?;
            layer_states.push(LayerState { key, value });
        }

        let snapshot = CacheSnapshot {
            token_sequence,
            occupied_length,
            layer_states,
        };
        snapshot.validate().map_err(|e| corrupt(e.to_string()))?;

        debug!(
            path = %path.display(),
            occupied = snapshot.occupied_length,
            layers = snapshot.n_layers(),
            "Loaded cache snapshot"
        );
        Ok(snapshot)
    }

    /// Write one turn under `directory` with the next free index.
    ///
    /// Never replaces an existing interaction file. Returns the written path.
    pub fn save_interaction(interaction: &InteractionSnapshot, directory: &Path) -> Result<PathBuf> {
        let mut writer = TensorWriter::new().metadata("format", INTERACTION_FORMAT);
        writer.push_i32(
            "prompt_ids",
            &[interaction.prompt_ids.len()],
            &interaction.prompt_ids,
        );
        writer.push_i32(
            "response_ids",
            &[interaction.response_ids.len()],
            &interaction.response_ids,
        );
        writer.push_i64_scalar("start_offset", interaction.start_offset as i64);
        writer.push_i64_scalar("end_offset", interaction.end_offset as i64);
        let bytes = writer.to_bytes().map_err(|e| codec_to_io(directory, e))?;

        let mut index = next_interaction_index(directory)?;
        let mut tmp = write_temp(&directory.join(interaction_file_name(index)), &bytes)?;
        for _ in 0..MAX_NOCLOBBER_ATTEMPTS {
            let target = directory.join(interaction_file_name(index));
            match tmp.persist_noclobber(&target) {
                Ok(_) => {
                    debug!(path = %target.display(), "Saved interaction");
                    return Ok(target);
                }
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                    tmp = e.file;
                    index = index.checked_add(1).ok_or_else(|| {
                        io::Error::new(io::ErrorKind::AlreadyExists, "interaction index exhausted")
                    })?;
                }
                Err(e) => return Err(e.error.into()),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free interaction index under {}", directory.display()),
        )
        .into())
    }

    /// Load every interaction under `directory`, oldest first.
    ///
    /// Files with a numeric suffix (`interaction_000012.snapshot`) sort by that
    /// index and come first; the rest follow in modification-time order.
    /// Files missing the prompt/response fields or failing to decode are
    /// skipped.
    pub fn load_all_interactions(directory: &Path) -> Result<Vec<InteractionSnapshot>> {
        let mut candidates = Vec::new();
        for entry in fs::read_dir(directory)? {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_file() || !has_snapshot_extension(&path) {
                continue;
            }
            let key = match file_index(&path) {
                Some(index) => OrderKey::Indexed(index),
                None => OrderKey::Unindexed(
                    entry
                        .metadata()?
                        .modified()
                        .unwrap_or(SystemTime::UNIX_EPOCH),
                ),
            };
            candidates.push((key, path));
        }
        candidates.sort();

        let mut interactions = Vec::with_capacity(candidates.len());
        for (_, path) in candidates {
            match read_interaction(&path) {
                Ok(Some(turn)) => interactions.push(turn),
                Ok(None) => {}
                Err(reason) => {
                    warn!(path = %path.display(), %reason, "Skipping unreadable interaction file");
                }
            }
        }
        Ok(interactions)
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OrderKey {
    Indexed(u64),
    Unindexed(SystemTime),
}

fn open(path: &Path) -> Result<TensorFile> {
    TensorFile::open(path).map_err(|e| match e {
        CodecError::Io(err) if err.kind() == io::ErrorKind::NotFound => {
            StoreError::SnapshotNotFound(path.to_path_buf())
        }
        CodecError::Io(err) => StoreError::Io(err),
        other => StoreError::SnapshotCorrupt {
            path: path.to_path_buf(),
            reason: other.to_string(),
        },
    })
}

/// `Ok(None)` for snapshot files that are not interactions, such as a
/// checkpoint sharing the directory.
fn read_interaction(path: &Path) -> std::result::Result<Option<InteractionSnapshot>, String> {
    let file = TensorFile::open(path).map_err(|e| e.to_string())?;
    if !file.has_tensor("prompt_ids") || !file.has_tensor("response_ids") {
        if file.has_tensor("token_sequence") {
            return Ok(None);
        }
        return Err("missing prompt_ids or response_ids".to_string());
    }
    let offset = |name: &str| -> std::result::Result<usize, String> {
        let v = file.read_scalar(name).map_err(|e| e.to_string())?;
        usize::try_from(v).map_err(|_| format!("{name} is negative: {v}"))
    };
    Ok(Some(InteractionSnapshot {
        prompt_ids: file.read_ids("prompt_ids").map_err(|e| e.to_string())?,
        response_ids: file.read_ids("response_ids").map_err(|e| e.to_string())?,
        start_offset: offset("start_offset")?,
        end_offset: offset("end_offset")?,
    }))
}

/// Number of contiguous `layers.{i}.key` tensors, checked against the
/// `num_layers` metadata when present.
fn layer_count(file: &TensorFile) -> std::result::Result<usize, String> {
    let present = (0..)
        .take_while(|i| file.has_tensor(&format!("layers.{i}.key")))
        .count();
    if let Some(n) = file.metadata("num_layers") {
        let declared: usize = n
            .parse()
            .map_err(|_| format!("invalid num_layers metadata '{n}'"))?;
        if declared != present {
            return Err(format!(
                "num_layers metadata is {declared} but {present} layer tensors are present"
            ));
        }
    }
    Ok(present)
}

fn read_kv(file: &TensorFile, name: &str) -> std::result::Result<KVTensor, String> {
    let (dims, data) = file.read_f32(name).map_err(|e| e.to_string())?;
    let shape = KVShape::from_dims(&dims)
        .ok_or_else(|| format!("tensor '{name}' has shape {dims:?}, expected 4 dimensions"))?;
    KVTensor::new(shape, data).map_err(|e| format!("tensor '{name}': {e}"))
}

fn write_temp(target: &Path, bytes: &[u8]) -> Result<NamedTempFile> {
    let dir = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}

fn codec_to_io(path: &Path, e: CodecError) -> StoreError {
    match e {
        CodecError::Io(err) => StoreError::Io(err),
        other => StoreError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("encoding {}: {other}", path.display()),
        )),
    }
}

fn interaction_file_name(index: u64) -> String {
    format!("{INTERACTION_PREFIX}{index:06}.snapshot")
}

fn has_snapshot_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SNAPSHOT_EXTENSIONS.contains(&e))
}

/// Numeric suffix after the last `_` in the file stem.
fn file_index(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let (_, suffix) = stem.rsplit_once('_')?;
    suffix.parse().ok()
}

fn next_interaction_index(directory: &Path) -> Result<u64> {
    let mut next = 0;
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        let is_interaction = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(INTERACTION_PREFIX));
        if is_interaction && has_snapshot_extension(&path) {
            // u64::MAX has no successor.
            if let Some(after) = file_index(&path).and_then(|i| i.checked_add(1)) {
                next = next.max(after);
            }
        }
    }
    Ok(next)
}
