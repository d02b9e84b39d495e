//! # kvsession-store
//!
//! Durable conversation state:
//! - [`CacheSnapshot`] / [`InteractionSnapshot`]: what gets persisted
//! - [`SnapshotStore`]: atomic tensor-file reads and writes
//! - [`SessionDirectories`]: the `{root}/{user}/sessions/{id}` hierarchy
//!
//! Snapshot files use the safetensors container format (see [`codec`]).

pub mod codec;
pub mod directory;
pub mod error;
pub mod mmap;
pub mod snapshot;
pub mod store;

pub use directory::SessionDirectories;
pub use error::{Result, StoreError};
pub use snapshot::{CacheSnapshot, InteractionSnapshot, InvalidSnapshot};
pub use store::SnapshotStore;
