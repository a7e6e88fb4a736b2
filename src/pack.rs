//! Positional, stateless reads from pack files, and the sequential,
//! byte-counting append writer used while building a snapshot.

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use countio::Counter;

use crate::error::{CivdError, CivdResult};

/// Read `length` bytes starting at `offset` from a pack file.
///
/// Stateless: opens the file fresh on every call. A pool of handles would
/// be an internal optimization, not part of the contract.
pub fn read_slice(pack_path: &Path, offset: u64, length: u64) -> CivdResult<Vec<u8>> {
    let mut file = File::open(pack_path).map_err(|e| CivdError::from(e).with_path(pack_path))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| CivdError::from(e).with_path(pack_path))?;
    let mut buf = vec![0u8; length as usize];
    file.read_exact(&mut buf)
        .map_err(|e| CivdError::from(e).with_path(pack_path))?;
    Ok(buf)
}

/// Sequential, byte-counting append writer for a pack file under
/// construction. Mirrors the counted-writer pattern used to build the
/// index alongside the bytes as they are appended.
pub struct PackWriter {
    path: PathBuf,
    out: Counter<BufWriter<File>>,
}

impl PackWriter {
    pub fn create(path: impl Into<PathBuf>) -> CivdResult<Self> {
        let path = path.into();
        let file = File::create(&path).map_err(|e| CivdError::from(e).with_path(&path))?;
        Ok(Self {
            path,
            out: Counter::new(BufWriter::new(file)),
        })
    }

    /// Current write offset — the offset the next append will land at.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.out.writer_bytes() as u64
    }

    /// Append already-compressed bytes, returning `(offset, length)`.
    pub fn append(&mut self, data: &[u8]) -> CivdResult<(u64, u64)> {
        let offset = self.position();
        self.out
            .write_all(data)
            .map_err(|e| CivdError::from(e).with_path(&self.path))?;
        Ok((offset, data.len() as u64))
    }

    pub fn finish(mut self) -> CivdResult<()> {
        self.out
            .flush()
            .map_err(|e| CivdError::from(e).with_path(&self.path))
    }
}
