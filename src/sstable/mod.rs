//! Immutable, sorted, on-disk tables produced by flushing the memtable.
//!
//! An SSTable is written once, atomically, and never mutated afterward.
//! Its file is laid out as:
//!
//! ```text
//! [HEADER 17B] [BLOCK]... [SPARSE INDEX] [BLOOM FILTER] [FOOTER 32B]
//! ```
//!
//! - **Header** — magic, format version, LSM level, and total entry count.
//! - **Data blocks** — LZ4-compressed runs of entries, each self-describing
//!   and individually checksummed with xxh32.
//! - **Sparse index** — the first key of every block and its file offset,
//!   enabling a binary search to the candidate block for any key.
//! - **Bloom filter** — a serialized membership filter over every key in
//!   the table, checked before touching the index or any block.
//! - **Footer** — fixed 32-byte trailer giving the index and bloom filter
//!   their offsets and sizes, so a reader can locate both with two seeks
//!   from the end of the file.
//!
//! This module defines the shared wire types ([`SstableHeader`],
//! [`SstableFooter`], [`SstableEntry`], [`Block`], [`SparseIndex`]).
//! [`builder`] produces tables; [`reader`] opens and queries them.

pub mod builder;
pub mod reader;

#[cfg(test)]
mod tests;

use lz4_flex::block::{compress as lz4_compress, decompress as lz4_decompress};
use thiserror::Error;
use xxhash_rust::xxh32::xxh32;

use crate::encoding::{self, Decode, Encode, EncodingError};

pub use builder::SstableWriter;
pub use reader::SstableReader;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

pub(crate) const MAGIC: [u8; 8] = *b"SEGMTSST";
pub(crate) const CURRENT_VERSION: u32 = 1;
pub(crate) const HEADER_SIZE: usize = 8 + 4 + 1 + 4; // magic + version + level + entry_count
pub(crate) const FOOTER_SIZE: usize = 8 + 4 + 8 + 4 + 8; // index_offset/size + bloom_offset/size + magic
pub(crate) const BLOCK_HEADER_SIZE: usize = 4 + 4; // compressed_size + uncompressed_size
pub(crate) const BLOCK_FOOTER_SIZE: usize = 4; // xxh32 checksum

/// Default threshold, in uncompressed bytes, at which a data block is
/// closed and a new one started.
pub const DEFAULT_BLOCK_SIZE_BYTES: usize = 4 * 1024;

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable construction, reading, or lookup.
#[derive(Debug, Error)]
pub enum SstableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Binary encoding/decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A checksum did not match the data it protects.
    #[error("checksum mismatch in {context}: stored={stored:#x}, computed={computed:#x}")]
    ChecksumMismatch {
        /// Where the mismatch was found (e.g. "data block at offset 128").
        context: String,
        /// The checksum stored on disk.
        stored: u32,
        /// The checksum computed from the bytes actually read.
        computed: u32,
    },

    /// A magic number did not match what was expected.
    #[error("bad magic number in {0}")]
    BadMagic(&'static str),

    /// LZ4 compression or decompression failed.
    #[error("LZ4 error: {0}")]
    Compression(String),

    /// Attempted to build a table from zero entries.
    #[error("cannot build an SSTable from an empty entry set")]
    EmptyInput,

    /// An internal invariant was violated.
    #[error("internal SSTable error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

/// Fixed 17-byte header at the start of every SSTable file.
///
/// `level` records which LSM level this table belongs to. This is a
/// level-bearing extension of the plain magic/version/count header;
/// nothing downstream of the Memtable/WAL/SSTable boundary interprets
/// the level today, but recording it at write time costs one byte and
/// avoids a future format break once compaction needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SstableHeader {
    /// Format version.
    pub version: u32,
    /// LSM level this table was written at. Always `0` for a table
    /// produced directly by a memtable flush.
    pub level: u8,
    /// Number of entries stored in the table.
    pub entry_count: u32,
}

impl SstableHeader {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.push(self.level);
        buf.extend_from_slice(&self.entry_count.to_be_bytes());
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self, SstableError> {
        if buf.len() != HEADER_SIZE {
            return Err(SstableError::Internal(format!(
                "expected {HEADER_SIZE}-byte header, got {} bytes",
                buf.len()
            )));
        }
        if buf[0..8] != MAGIC {
            return Err(SstableError::BadMagic("SSTable header"));
        }
        let version = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let level = buf[12];
        let entry_count = u32::from_be_bytes([buf[13], buf[14], buf[15], buf[16]]);
        Ok(Self {
            version,
            level,
            entry_count,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Entry
// ------------------------------------------------------------------------------------------------

/// A single logical key/value (or tombstone) record inside a data block.
///
/// In-block wire format: `length(4) || seq_no(8) || key_len(2) ||
/// val_len(4) || tombstone(1) || key || value`. `length` covers every
/// field after itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SstableEntry {
    /// Caller-assigned sequence number, preserved from the memtable.
    pub seq_no: u64,
    /// The entry's key.
    pub key: Vec<u8>,
    /// `None` for a tombstone, `Some(value)` otherwise.
    pub value: Option<Vec<u8>>,
}

impl SstableEntry {
    pub(crate) fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), SstableError> {
        if self.key.len() > u16::MAX as usize {
            return Err(SstableError::Encoding(EncodingError::LengthOverflow(
                format!("key length {} exceeds u16::MAX", self.key.len()),
            )));
        }
        let value = self.value.as_deref().unwrap_or(&[]);
        let tombstone = u8::from(self.value.is_none());

        let mut payload = Vec::with_capacity(8 + 2 + 4 + 1 + self.key.len() + value.len());
        self.seq_no.encode_to(&mut payload)?;
        (self.key.len() as u16).encode_to(&mut payload)?;
        (value.len() as u32).encode_to(&mut payload)?;
        tombstone.encode_to(&mut payload)?;
        payload.extend_from_slice(&self.key);
        payload.extend_from_slice(value);

        (payload.len() as u32).encode_to(buf)?;
        buf.extend_from_slice(&payload);
        Ok(())
    }

    /// Decode one entry starting at `buf[0]`, returning `(entry, bytes_consumed)`.
    pub(crate) fn decode_from(buf: &[u8]) -> Result<(Self, usize), SstableError> {
        let (len, offset) = u32::decode_from(buf).map_err(SstableError::Encoding)?;
        let len = len as usize;
        if buf.len() < offset + len {
            return Err(SstableError::Encoding(EncodingError::UnexpectedEof {
                needed: offset + len,
                available: buf.len(),
            }));
        }
        let body = &buf[offset..offset + len];

        let (seq_no, n) = u64::decode_from(body)?;
        let mut body_off = n;
        let (key_len, n) = u16::decode_from(&body[body_off..])?;
        body_off += n;
        let (val_len, n) = u32::decode_from(&body[body_off..])?;
        body_off += n;
        let (tombstone, n) = u8::decode_from(&body[body_off..])?;
        body_off += n;
        let (key, n) = encoding::read_raw_bytes(&body[body_off..], key_len as usize)?;
        body_off += n;
        let (value_bytes, n) = encoding::read_raw_bytes(&body[body_off..], val_len as usize)?;
        body_off += n;
        let _ = body_off;

        let value = if tombstone != 0 { None } else { Some(value_bytes) };

        Ok((
            Self {
                seq_no,
                key,
                value,
            },
            offset + len,
        ))
    }

    pub(crate) fn encoded_size(&self) -> usize {
        4 + 8 + 2 + 4 + 1 + self.key.len() + self.value.as_ref().map_or(0, Vec::len)
    }
}

// ------------------------------------------------------------------------------------------------
// Data block
// ------------------------------------------------------------------------------------------------

/// An LZ4-compressed, self-describing, checksummed run of entries.
///
/// On-disk layout: `comp_size(4) || uncomp_size(4) || compressed_data ||
/// xxh32(comp_size || uncomp_size || compressed_data)(4)`. The checksum
/// covers the header and the *compressed* bytes, not the decompressed
/// payload.
pub(crate) struct Block;

impl Block {
    /// Compress `raw_entries` (already concatenated, encoded entries) into
    /// the on-disk block representation.
    pub(crate) fn encode(raw_entries: &[u8]) -> Result<Vec<u8>, SstableError> {
        let compressed = lz4_compress(raw_entries);
        let compressed = compressed.as_slice();

        let mut header = Vec::with_capacity(BLOCK_HEADER_SIZE);
        (compressed.len() as u32).encode_to(&mut header)?;
        (raw_entries.len() as u32).encode_to(&mut header)?;

        let mut hashable = Vec::with_capacity(header.len() + compressed.len());
        hashable.extend_from_slice(&header);
        hashable.extend_from_slice(compressed);
        let checksum = xxh32(&hashable, 0);

        let mut out = hashable;
        out.extend_from_slice(&checksum.to_be_bytes());
        Ok(out)
    }

    /// Decode and verify a block's checksum, returning its decompressed
    /// entry bytes.
    pub(crate) fn decode(header: &[u8], compressed: &[u8], stored_checksum: u32) -> Result<Vec<u8>, SstableError> {
        let mut hashable = Vec::with_capacity(header.len() + compressed.len());
        hashable.extend_from_slice(header);
        hashable.extend_from_slice(compressed);
        let computed = xxh32(&hashable, 0);
        if computed != stored_checksum {
            return Err(SstableError::ChecksumMismatch {
                context: "data block".into(),
                stored: stored_checksum,
                computed,
            });
        }

        let uncompressed_size = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

        // lz4_flex::block::decompress needs the original uncompressed
        // size since this format does not store lz4's own size prefix.
        lz4_decompress(compressed, uncompressed_size)
            .map_err(|e| SstableError::Compression(e.to_string()))
    }
}

// ------------------------------------------------------------------------------------------------
// Sparse index
// ------------------------------------------------------------------------------------------------

/// One entry in the sparse index: the first key of a block and that
/// block's byte offset in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SparseIndexEntry {
    pub offset: u64,
    pub key: Vec<u8>,
}

impl SparseIndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), SstableError> {
        if self.key.len() > u16::MAX as usize {
            return Err(SstableError::Encoding(EncodingError::LengthOverflow(
                format!("index key length {} exceeds u16::MAX", self.key.len()),
            )));
        }
        self.offset.encode_to(buf)?;
        (self.key.len() as u16).encode_to(buf)?;
        buf.extend_from_slice(&self.key);
        Ok(())
    }

    fn decode_from(buf: &[u8]) -> Result<(Self, usize), SstableError> {
        let (offset, mut n) = u64::decode_from(buf)?;
        let (key_len, m) = u16::decode_from(&buf[n..])?;
        n += m;
        let (key, m) = encoding::read_raw_bytes(&buf[n..], key_len as usize)?;
        n += m;
        Ok((Self { offset, key }, n))
    }
}

/// Sparse directory mapping the first key of each block to its offset,
/// supporting a binary search down to the candidate block for any key.
#[derive(Debug, Clone, Default)]
pub(crate) struct SparseIndex {
    pub entries: Vec<SparseIndexEntry>,
}

impl SparseIndex {
    pub(crate) fn encode(&self) -> Result<Vec<u8>, SstableError> {
        let mut buf = Vec::new();
        (self.entries.len() as u32).encode_to(&mut buf)?;
        for entry in &self.entries {
            entry.encode_to(&mut buf)?;
        }
        Ok(buf)
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self, SstableError> {
        let (count, mut offset) = u32::decode_from(buf)?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (entry, n) = SparseIndexEntry::decode_from(&buf[offset..])?;
            offset += n;
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    /// Return the offset of the block that may contain `key`, using the
    /// same "rightmost key not greater than the target" rule as a
    /// `bisect_right(keys, key) - 1` binary search. Returns `None` if
    /// `key` precedes every indexed key.
    pub(crate) fn find_block_offset(&self, key: &[u8]) -> Option<u64> {
        if self.entries.is_empty() {
            return None;
        }
        // partition_point finds the first index where entries[i].key > key,
        // i.e. the same split point as bisect_right.
        let idx = self.entries.partition_point(|e| e.key.as_slice() <= key);
        if idx == 0 {
            return None;
        }
        Some(self.entries[idx - 1].offset)
    }
}

// ------------------------------------------------------------------------------------------------
// Footer
// ------------------------------------------------------------------------------------------------

/// Fixed 32-byte trailer at the end of every SSTable file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SstableFooter {
    /// Byte offset of the sparse index.
    pub index_offset: u64,
    /// Byte length of the encoded sparse index.
    pub index_size: u32,
    /// Byte offset of the bloom filter.
    pub bloom_offset: u64,
    /// Byte length of the encoded bloom filter.
    pub bloom_size: u32,
}

impl SstableFooter {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        buf.extend_from_slice(&self.index_offset.to_be_bytes());
        buf.extend_from_slice(&self.index_size.to_be_bytes());
        buf.extend_from_slice(&self.bloom_offset.to_be_bytes());
        buf.extend_from_slice(&self.bloom_size.to_be_bytes());
        buf.extend_from_slice(&MAGIC);
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self, SstableError> {
        if buf.len() != FOOTER_SIZE {
            return Err(SstableError::Internal(format!(
                "expected {FOOTER_SIZE}-byte footer, got {} bytes",
                buf.len()
            )));
        }
        let index_offset = u64::from_be_bytes(buf[0..8].try_into().unwrap_or_default());
        let index_size = u32::from_be_bytes(buf[8..12].try_into().unwrap_or_default());
        let bloom_offset = u64::from_be_bytes(buf[12..20].try_into().unwrap_or_default());
        let bloom_size = u32::from_be_bytes(buf[20..24].try_into().unwrap_or_default());
        if buf[24..32] != MAGIC {
            return Err(SstableError::BadMagic("SSTable footer"));
        }
        Ok(Self {
            index_offset,
            index_size,
            bloom_offset,
            bloom_size,
        })
    }
}
