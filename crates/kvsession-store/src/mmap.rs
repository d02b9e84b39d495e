//! Memory-mapped reads of snapshot files.

use std::fs::File;
use std::io;
use std::path::Path;

use memmap2::Mmap;

/// A read-only memory-mapped file.
///
/// The mapped region remains valid for the lifetime of this struct.
/// Snapshot files are replaced by rename, never rewritten in place, so an
/// open mapping always sees one complete file.
pub struct MappedFile {
    mmap: Mmap,
}

impl MappedFile {
    /// Map a file into memory.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;

        // Safety: snapshot files are only ever replaced atomically, so the
        // mapped inode is never modified while we hold it.
        let mmap = unsafe { Mmap::map(&file)? };

        Ok(MappedFile { mmap })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }

    pub fn size(&self) -> usize {
        self.mmap.len()
    }
}
