//! SSTable reader — opens a table, keeps its bloom filter and sparse
//! index resident in memory, and serves point lookups.
//!
//! The underlying file is memory-mapped once at open time and kept for
//! the reader's lifetime, avoiding repeated syscalls on every lookup.
//! Opening eagerly loads the footer, bloom filter, and sparse index;
//! data blocks are read (and checksum-verified) lazily, one per `get`.

use std::{fs::File, path::Path};

use memmap2::Mmap;
use tracing::trace;

use crate::bloom::BloomFilter;

use super::{Block, SparseIndex, SstableError, SstableFooter, SstableHeader, BLOCK_FOOTER_SIZE, BLOCK_HEADER_SIZE, FOOTER_SIZE, HEADER_SIZE};

/// The outcome of a point lookup against a single SSTable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SstableLookup {
    /// The key was found with a live value.
    Found(Vec<u8>),
    /// The key was found but shadowed by a tombstone.
    Tombstone,
    /// The key is definitely absent from this table.
    Absent,
}

/// A read-only handle to a published SSTable file.
pub struct SstableReader {
    // Kept alive for the mmap's backing file descriptor; never read
    // directly once `mmap` is established.
    _file: File,
    mmap: Mmap,
    pub header: SstableHeader,
    bloom: BloomFilter,
    index: SparseIndex,
}

impl SstableReader {
    /// Open `path`, validating the header and footer and eagerly loading
    /// the bloom filter and sparse index into memory.
    ///
    /// # Safety
    ///
    /// Uses `unsafe { Mmap::map(...) }`. This is sound here because the
    /// file is never written to after being published (SSTables are
    /// immutable once renamed into place) and the mapping is read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SstableError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Self::load(file, path)
    }

    fn load(file: File, path: &Path) -> Result<Self, SstableError> {
        let mmap = unsafe { Mmap::map(&file) }?;
        let len = mmap.len();
        if len < HEADER_SIZE + FOOTER_SIZE {
            return Err(SstableError::Internal(format!(
                "{}: file too small ({len} bytes)",
                path.display()
            )));
        }

        let header = SstableHeader::decode(&mmap[..HEADER_SIZE])?;

        let footer_start = len - FOOTER_SIZE;
        let footer = SstableFooter::decode(&mmap[footer_start..])?;

        let bloom_start = footer.bloom_offset as usize;
        let bloom_end = bloom_start + footer.bloom_size as usize;
        if bloom_end > footer_start {
            return Err(SstableError::Internal("bloom filter extends past footer".into()));
        }
        let bloom = BloomFilter::from_bytes(&mmap[bloom_start..bloom_end])
            .map_err(|e| SstableError::Internal(e.to_string()))?;

        let index_start = footer.index_offset as usize;
        let index_end = index_start + footer.index_size as usize;
        if index_end > bloom_start {
            return Err(SstableError::Internal("sparse index overlaps bloom filter".into()));
        }
        let index = SparseIndex::decode(&mmap[index_start..index_end])?;

        Ok(Self {
            _file: file,
            mmap,
            header,
            bloom,
            index,
        })
    }

    /// Look up `key`. Checks the bloom filter first, then the sparse
    /// index, then (if a candidate block exists) scans that one block,
    /// stopping as soon as a key greater than `key` is seen.
    pub fn get(&self, key: &[u8]) -> Result<SstableLookup, SstableError> {
        if !self.bloom.contains(key) {
            trace!(?key, "bloom filter excluded key");
            return Ok(SstableLookup::Absent);
        }

        let Some(block_offset) = self.index.find_block_offset(key) else {
            return Ok(SstableLookup::Absent);
        };

        let entries = self.read_block_at(block_offset as usize)?;
        for entry in entries {
            if entry.key == key {
                return Ok(match entry.value {
                    Some(value) => SstableLookup::Found(value),
                    None => SstableLookup::Tombstone,
                });
            }
            if entry.key.as_slice() > key {
                break;
            }
        }
        Ok(SstableLookup::Absent)
    }

    fn read_block_at(&self, offset: usize) -> Result<Vec<super::SstableEntry>, SstableError> {
        let data = &self.mmap[..];
        if offset + BLOCK_HEADER_SIZE > data.len() {
            return Err(SstableError::Internal("block header out of bounds".into()));
        }
        let header = &data[offset..offset + BLOCK_HEADER_SIZE];
        let compressed_size = u32::from_be_bytes(header[0..4].try_into().unwrap_or_default()) as usize;

        let compressed_start = offset + BLOCK_HEADER_SIZE;
        let compressed_end = compressed_start + compressed_size;
        let checksum_end = compressed_end + BLOCK_FOOTER_SIZE;
        if checksum_end > data.len() {
            return Err(SstableError::Internal("block data out of bounds".into()));
        }

        let compressed = &data[compressed_start..compressed_end];
        let stored_checksum =
            u32::from_be_bytes(data[compressed_end..checksum_end].try_into().unwrap_or_default());

        let raw = Block::decode(header, compressed, stored_checksum)?;

        let mut entries = Vec::new();
        let mut pos = 0;
        while pos < raw.len() {
            let (entry, consumed) = super::SstableEntry::decode_from(&raw[pos..])?;
            entries.push(entry);
            pos += consumed;
        }
        Ok(entries)
    }
}
