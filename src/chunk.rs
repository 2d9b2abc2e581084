//! Fixed-size chunking of local files and chunk fingerprints.
//!
//! Chunks are numbered from 1. Every chunk is `chunk_size` bytes except the
//! last, which holds the remainder (or a full chunk when the size divides
//! evenly). Enumeration reopens the file each time, so it can be restarted.

use std::io::{Read, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Number of chunks a file of `total_size` bytes splits into.
pub fn total_chunks(total_size: u64, chunk_size: u64) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size) as u32
}

/// Length of the 1-based chunk `index`.
pub fn chunk_len(total_size: u64, chunk_size: u64, index: u32) -> u64 {
    let start = u64::from(index.saturating_sub(1)) * chunk_size;
    total_size.saturating_sub(start).min(chunk_size)
}

/// Content fingerprint the object store records for an uploaded chunk (hex MD5).
pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// One chunk read from disk.
#[derive(Debug)]
pub struct Chunk {
    /// 1-based index
    pub index: u32,
    /// Chunk contents
    pub data: Vec<u8>,
}

/// Reads a local file in fixed-size chunks.
#[derive(Debug, Clone)]
pub struct ChunkReader {
    path: PathBuf,
    chunk_size: u64,
}

impl ChunkReader {
    /// Reader over `path` with the given chunk size.
    pub fn new(path: impl Into<PathBuf>, chunk_size: u64) -> Self {
        Self {
            path: path.into(),
            chunk_size,
        }
    }

    /// File being chunked.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Enumerate every chunk from the start of the file.
    ///
    /// Each call opens the file afresh, so the sequence can be restarted.
    pub fn chunks(&self) -> std::io::Result<Chunks> {
        let file = std::fs::File::open(&self.path)?;
        Ok(Chunks {
            file,
            chunk_size: self.chunk_size,
            next_index: 1,
        })
    }

    /// Read the 1-based chunk `index` without touching the others.
    ///
    /// Returns an empty buffer for an index past the end of the file.
    pub async fn read(&self, index: u32) -> std::io::Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        let offset = u64::from(index.saturating_sub(1)) * self.chunk_size;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut data = Vec::with_capacity(self.chunk_size.min(8 * 1024 * 1024) as usize);
        file.take(self.chunk_size).read_to_end(&mut data).await?;
        Ok(data)
    }
}

/// Lazy iterator over a file's chunks.
pub struct Chunks {
    file: std::fs::File,
    chunk_size: u64,
    next_index: u32,
}

impl Iterator for Chunks {
    type Item = std::io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut data = Vec::new();
        match (&mut self.file)
            .take(self.chunk_size)
            .read_to_end(&mut data)
        {
            Ok(0) => None,
            Ok(_) => {
                let index = self.next_index;
                self.next_index += 1;
                Some(Ok(Chunk { index, data }))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
