//! SSTable writer — builds a complete SSTable file from a sorted,
//! deduplicated run of entries (the memtable's flush snapshot).
//!
//! Entries must already be sorted by key with no duplicates; the writer
//! does not sort or merge. It accumulates entries into 4 KiB
//! (uncompressed, configurable) blocks, compresses each block, builds a
//! sparse index and a bloom filter alongside the block stream, and
//! publishes the finished file atomically via a temp-file-then-rename.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use tracing::{info, warn};

use crate::bloom::{BloomFilter, DEFAULT_FALSE_POSITIVE_RATE};
use crate::encoding::encode_to_vec;

use super::{
    Block, SparseIndex, SparseIndexEntry, SstableError, SstableEntry, SstableFooter, SstableHeader,
    DEFAULT_BLOCK_SIZE_BYTES, HEADER_SIZE,
};

/// Builds and atomically publishes a single SSTable file.
pub struct SstableWriter {
    block_size_bytes: usize,
    bloom_false_positive_rate: f64,
    level: u8,
}

impl Default for SstableWriter {
    fn default() -> Self {
        Self {
            block_size_bytes: DEFAULT_BLOCK_SIZE_BYTES,
            bloom_false_positive_rate: DEFAULT_FALSE_POSITIVE_RATE,
            level: 0,
        }
    }
}

impl SstableWriter {
    /// Create a writer using the default block size and bloom
    /// false-positive rate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the uncompressed-bytes threshold at which a data block
    /// is closed and a new one started.
    pub fn with_block_size_bytes(mut self, size: usize) -> Self {
        self.block_size_bytes = size;
        self
    }

    /// Override the bloom filter's target false-positive rate.
    pub fn with_bloom_false_positive_rate(mut self, rate: f64) -> Self {
        self.bloom_false_positive_rate = rate;
        self
    }

    /// Override the LSM level recorded in the table's header.
    pub fn with_level(mut self, level: u8) -> Self {
        self.level = level;
        self
    }

    /// Write `entries` (sorted ascending by key, no duplicates) to a new
    /// SSTable file at `path`, publishing it atomically.
    pub fn write<P: AsRef<Path>>(&self, path: P, entries: &[SstableEntry]) -> Result<(), SstableError> {
        if entries.is_empty() {
            return Err(SstableError::EmptyInput);
        }
        let path = path.as_ref();

        let (block_bytes, index) = self.build_blocks(entries)?;
        let header = SstableHeader {
            version: super::CURRENT_VERSION,
            level: self.level,
            entry_count: entries.len() as u32,
        };

        let index_bytes = index.encode()?;
        let index_offset = (HEADER_SIZE + block_bytes.len()) as u64;

        let bloom = BloomFilter::from_keys(
            entries.iter().map(|e| e.key.as_slice()),
            self.bloom_false_positive_rate,
        )
        .map_err(|e| SstableError::Internal(e.to_string()))?;
        let bloom_bytes = bloom.to_bytes();
        let bloom_offset = index_offset + index_bytes.len() as u64;

        let footer = SstableFooter {
            index_offset,
            index_size: index_bytes.len() as u32,
            bloom_offset,
            bloom_size: bloom_bytes.len() as u32,
        };

        let tmp_path = path.with_extension("tmp");
        let result = self.write_file(&tmp_path, &header, &block_bytes, &index_bytes, &bloom_bytes, &footer);

        match result {
            Ok(()) => {
                fs::rename(&tmp_path, path)?;
                fsync_parent_dir(path);
                info!(path = %path.display(), entries = entries.len(), "published SSTable");
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp_path);
                Err(err)
            }
        }
    }

    fn write_file(
        &self,
        tmp_path: &Path,
        header: &SstableHeader,
        block_bytes: &[u8],
        index_bytes: &[u8],
        bloom_bytes: &[u8],
        footer: &SstableFooter,
    ) -> Result<(), SstableError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(tmp_path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(&header.encode())?;
        writer.write_all(block_bytes)?;
        writer.write_all(index_bytes)?;
        writer.write_all(bloom_bytes)?;
        writer.write_all(&footer.encode())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Partition `entries` into blocks, compress each, and build the
    /// sparse index that points at them. Returns the concatenated block
    /// bytes and the finished index.
    fn build_blocks(&self, entries: &[SstableEntry]) -> Result<(Vec<u8>, SparseIndex), SstableError> {
        let mut out = Vec::new();
        let mut index = SparseIndex::default();
        let mut offset = HEADER_SIZE as u64;

        let mut pending: Vec<&SstableEntry> = Vec::new();
        let mut pending_raw_size = 0usize;

        for entry in entries {
            pending_raw_size += entry.encoded_size();
            pending.push(entry);

            if pending_raw_size >= self.block_size_bytes {
                offset = self.flush_block(&pending, offset, &mut out, &mut index)?;
                pending.clear();
                pending_raw_size = 0;
            }
        }

        if !pending.is_empty() {
            self.flush_block(&pending, offset, &mut out, &mut index)?;
        }

        Ok((out, index))
    }

    fn flush_block(
        &self,
        pending: &[&SstableEntry],
        offset: u64,
        out: &mut Vec<u8>,
        index: &mut SparseIndex,
    ) -> Result<u64, SstableError> {
        let first_key = pending[0].key.clone();

        let mut raw = Vec::new();
        for entry in pending {
            entry.encode_to(&mut raw)?;
        }

        let block = Block::encode(&raw)?;
        index.entries.push(SparseIndexEntry { offset, key: first_key });

        let next_offset = offset + block.len() as u64;
        out.extend_from_slice(&block);
        Ok(next_offset)
    }
}

/// Best-effort fsync of the parent directory after a rename, so the
/// directory entry for the new file is itself durable. Not all
/// filesystems support this; failures are logged, not propagated.
fn fsync_parent_dir(path: &Path) {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return;
    };
    let dir_path: PathBuf = parent.to_path_buf();
    match File::open(&dir_path) {
        Ok(dir) => {
            if let Err(err) = dir.sync_all() {
                warn!(path = %dir_path.display(), %err, "directory fsync after SSTable publish failed");
            }
        }
        Err(err) => {
            warn!(path = %dir_path.display(), %err, "failed to open directory for post-publish fsync");
        }
    }
}
