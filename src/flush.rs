//! Collaborator interfaces the memtable's background flush worker uses
//! to place finished SSTables and to report a flushed watermark back to
//! whatever owns WAL retention.
//!
//! A full engine would implement these against its manifest and
//! directory layout; this crate defines only the seams and a pair of
//! minimal, directly usable implementations so a [`Memtable`](crate::memtable::Memtable)
//! can be exercised on its own.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

/// Errors a [`FlushCheckpoint`] implementation may report. The flush
/// worker logs these rather than treating them as fatal: a missed
/// checkpoint only delays WAL trimming, it never loses data.
#[derive(Debug, Error)]
pub enum FlushError {
    #[error("checkpoint persistence failed: {0}")]
    Persistence(String),
}

/// Decides where a newly flushed SSTable should live and is notified
/// once it has been durably published.
pub trait SstableDestination: Send + Sync {
    /// Return the path a new SSTable covering writes up to
    /// `checkpoint_seq_no` should be written to.
    fn next_path(&self, checkpoint_seq_no: u64) -> PathBuf;

    /// Called after the table at `path` has been atomically published.
    /// Implementations typically register the table with a manifest or
    /// level directory here.
    fn on_published(&self, path: &Path, checkpoint_seq_no: u64);
}

/// Notified once a flush has reached durable storage, so WAL entries up
/// to `seq_no` can be safely discarded.
pub trait FlushCheckpoint: Send + Sync {
    fn checkpoint(&self, seq_no: u64) -> Result<(), FlushError>;
}

/// A destination that writes sequentially numbered `NNNNNN.sst` files
/// into a single directory, ignoring `checkpoint_seq_no` for naming.
pub struct DirectoryDestination {
    dir: PathBuf,
    next_id: AtomicU64,
}

impl DirectoryDestination {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl SstableDestination for DirectoryDestination {
    fn next_path(&self, _checkpoint_seq_no: u64) -> PathBuf {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!("{id:06}.sst"))
    }

    fn on_published(&self, _path: &Path, _checkpoint_seq_no: u64) {}
}

/// A checkpoint sink that only tracks the highest watermark seen, for
/// tests and standalone use. Does not actually trim anything.
#[derive(Default)]
pub struct WatermarkCheckpoint {
    watermark: AtomicU64,
}

impl WatermarkCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::Acquire)
    }
}

impl FlushCheckpoint for WatermarkCheckpoint {
    fn checkpoint(&self, seq_no: u64) -> Result<(), FlushError> {
        self.watermark.fetch_max(seq_no, Ordering::AcqRel);
        Ok(())
    }
}
