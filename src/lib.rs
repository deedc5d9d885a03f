//! # segmentkv
//!
//! An embeddable, persistent key-value storage engine built on a
//! **Log-Structured Merge Tree (LSM-tree)** architecture. Designed for
//! fast writes and crash-safe operation over opaque byte keys and values.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      Memtable                        │
//! │  ┌────────────┐  ┌──────────────┐                    │
//! │  │  Active     │  │  Immutable   │                    │
//! │  │  store      │  │  queue       │                    │
//! │  │  + WAL      │  │  (flushing)  │                    │
//! │  └─────┬───────┘  └──────┬───────┘                    │
//! │        │   rotate        │   flush worker             │
//! │        └─────────►       └────────► SstableWriter ───►│
//! └──────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//!                          [HEADER][BLOCKS][INDEX][BLOOM][FOOTER]
//!                                  │
//!                                  ▼
//!                            SstableReader
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`encoding`] | Fixed-layout big-endian binary codecs shared by every on-disk format |
//! | [`bloom`] | Deterministic, serializable bloom filter over byte-string keys |
//! | [`wal`] | Append-only, checksummed write-ahead log: writer and crash-tolerant reader |
//! | [`sstable`] | Immutable on-disk sorted tables: header/blocks/index/bloom/footer, writer and reader |
//! | [`memtable`] | Mutable sorted write buffer, rotation, and the background flush worker |
//! | [`flush`] | Collaborator interfaces the flush worker uses to place SSTables and checkpoint the WAL |
//!
//! ## Key features
//!
//! - **Write-ahead logging** — every mutation is durably appended before
//!   being applied to the memtable, guaranteeing crash recovery.
//! - **Most-recent-wins reads** — a caller-assigned sequence number
//!   resolves ordering across the active memtable, queued immutable
//!   generations, and on-disk SSTables.
//! - **Point tombstones** — deletions are recorded, not erased, and
//!   shadow any earlier value for the same key until a later write
//!   supersedes them.
//! - **Bloom filter lookups** — every SSTable carries a filter checked
//!   before the sparse index or any block, so absent keys rarely touch
//!   disk.
//! - **Block-level integrity** — every on-disk block (WAL entries,
//!   SSTable data blocks, headers, footers) is checksummed and a
//!   mismatch is always surfaced, never silently tolerated.
//! - **Atomic publication** — an SSTable is either fully written with a
//!   valid footer at its final path, or not there at all.
//!
//! ## Out of scope
//!
//! This crate is the write path and persistence core of an LSM engine:
//! it does not provide compaction across levels, a manifest, range
//! scans, transactions, or a network surface. Those are the concern of
//! a surrounding façade that drives [`memtable::Memtable`] and opens
//! [`sstable::reader::SstableReader`]s in level/newest-first order; this
//! crate exposes the seams ([`flush::SstableDestination`],
//! [`flush::FlushCheckpoint`]) such a façade needs and nothing more.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use segmentkv::flush::{DirectoryDestination, WatermarkCheckpoint};
//! use segmentkv::memtable::{Memtable, MemtableGetResult, DEFAULT_ROTATION_THRESHOLD_BYTES};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let memtable = Memtable::new(
//!     dir.path().join("wal.log"),
//!     DEFAULT_ROTATION_THRESHOLD_BYTES,
//!     Arc::new(DirectoryDestination::new(dir.path())),
//!     Arc::new(WatermarkCheckpoint::new()),
//! )
//! .unwrap();
//!
//! memtable.put(1, b"hello".to_vec(), b"world".to_vec()).unwrap();
//! assert_eq!(
//!     memtable.get(b"hello").unwrap(),
//!     MemtableGetResult::Put(b"world".to_vec())
//! );
//!
//! memtable.delete(2, b"hello".to_vec()).unwrap();
//! assert_eq!(memtable.get(b"hello").unwrap(), MemtableGetResult::Delete);
//!
//! memtable.close().unwrap();
//! ```

#![allow(dead_code)]

pub mod bloom;
pub mod encoding;
pub mod flush;
pub mod memtable;
pub mod sstable;
pub mod wal;

/// Largest key length accepted at the public API boundary (§3 of the
/// data model: keys are length-prefixed with a `u16`).
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// Largest value length representable on disk (WAL payloads and
/// SSTable entries both carry a `u32` value-length field).
pub const MAX_VALUE_LEN: usize = u32::MAX as usize;
