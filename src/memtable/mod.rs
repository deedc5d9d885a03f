//! The mutable, in-memory write buffer of the storage engine.
//!
//! A [`Memtable`] accumulates writes in a sorted in-memory structure until
//! it reaches a configured size threshold, at which point it is rotated:
//! the full structure becomes immutable and is queued for a background
//! worker to flush to an SSTable, while a fresh, empty structure takes
//! its place for subsequent writes.
//!
//! ## Concurrency
//!
//! All mutable state — the active store, its accumulated size, and the
//! immutable flush queue — lives behind a single [`Mutex`] coupled to one
//! [`Condvar`]. Rotation happens inside the same critical section as the
//! mutating insert that triggered it: a writer that pushes the memtable
//! over the threshold atomically moves it onto the immutable queue and
//! installs a fresh store before releasing the lock, so no reader can
//! observe a store that is over threshold and not yet queued. The flush
//! worker acquires the lock only to wait on the "queue is non-empty or
//! shutdown" predicate, to clone a reference to the head task, and —
//! once that task's SSTable has been durably published — to pop it off;
//! all disk I/O happens after the lock is released, and the generation
//! stays on the queue (and visible to `get`) for the entire flush.
//!
//! ## Durability
//!
//! Every mutation is appended to the WAL before being applied in memory,
//! so a crash can always be recovered by replaying the WAL.


use std::{
    collections::{BTreeMap, VecDeque},
    path::Path,
    sync::{Arc, Condvar, Mutex},
    thread::JoinHandle,
};

use thiserror::Error;
use tracing::{error, info, trace, warn};

use crate::flush::{FlushCheckpoint, SstableDestination};
use crate::sstable::builder::SstableWriter;
use crate::sstable::SstableEntry;
use crate::wal::{WalEntry, WalError, WalReader, WalWriter};

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Memtable`] operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Underlying WAL I/O failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// A key or value supplied to `put`/`delete` violated the size
    /// limits of the on-disk formats.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal invariant violation or poisoned lock.
    #[error("internal memtable error: {0}")]
    Internal(String),
}

/// Reject keys and values that cannot be represented in the on-disk wire
/// formats: a zero-length key, a key longer than
/// [`crate::MAX_KEY_LEN`], or a value longer than
/// [`crate::MAX_VALUE_LEN`].
fn validate_key_value(key: &[u8], value: Option<&[u8]>) -> Result<(), MemtableError> {
    if key.is_empty() {
        return Err(MemtableError::InvalidArgument("key must not be empty".into()));
    }
    if key.len() > crate::MAX_KEY_LEN {
        return Err(MemtableError::InvalidArgument(format!(
            "key length {} exceeds MAX_KEY_LEN ({})",
            key.len(),
            crate::MAX_KEY_LEN
        )));
    }
    if let Some(value) = value {
        if value.len() > crate::MAX_VALUE_LEN {
            return Err(MemtableError::InvalidArgument(format!(
                "value length {} exceeds MAX_VALUE_LEN ({})",
                value.len(),
                crate::MAX_VALUE_LEN
            )));
        }
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Entry and read result
// ------------------------------------------------------------------------------------------------

/// A single entry stored in the memtable: either a live value or a
/// tombstone, tagged with the sequence number that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemtableEntry {
    /// Caller-assigned sequence number. The highest `seq_no` for a key
    /// always wins, regardless of insertion order.
    pub seq_no: u64,
    /// `None` marks a tombstone.
    pub value: Option<Vec<u8>>,
}

impl MemtableEntry {
    fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Accounted size: an 8-byte sequence number plus the value length,
    /// or zero for a tombstone.
    fn size_bytes(&self) -> usize {
        8 + self.value.as_ref().map_or(0, Vec::len)
    }
}

/// The outcome of [`Memtable::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemtableGetResult {
    /// A live value was found.
    Put(Vec<u8>),
    /// The key was found but shadowed by a tombstone.
    Delete,
    /// The key is not present anywhere in the memtable (active or
    /// immutable generations).
    NotFound,
}

// ------------------------------------------------------------------------------------------------
// Shared state
// ------------------------------------------------------------------------------------------------

type Store = BTreeMap<Vec<u8>, MemtableEntry>;

/// A rotated, immutable generation of the memtable queued for flushing.
///
/// `store` is reference-counted rather than owned outright: the queue
/// keeps it resident for `get` to scan for the entire duration of the
/// flush, while the worker flushes from its own clone of the handle, per
/// §9's "shared immutable ownership" note. It is removed from the queue
/// only after the flush has durably succeeded.
#[derive(Clone)]
struct FlushTask {
    store: Arc<Store>,
    /// Highest sequence number present in `store`; becomes the WAL
    /// checkpoint watermark once this task is durably flushed.
    checkpoint_seq_no: u64,
}

struct SharedState {
    active: Store,
    active_size_bytes: usize,
    immutable: VecDeque<FlushTask>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<SharedState>,
    condvar: Condvar,
    rotation_threshold_bytes: usize,
    destination: Arc<dyn SstableDestination>,
    checkpoint: Arc<dyn FlushCheckpoint>,
}

// ------------------------------------------------------------------------------------------------
// Memtable
// ------------------------------------------------------------------------------------------------

/// Default rotation threshold: 4 MiB of accounted entry size.
pub const DEFAULT_ROTATION_THRESHOLD_BYTES: usize = 4 * 1024 * 1024;

/// The mutable write buffer, backed by a WAL and a background flush
/// worker.
pub struct Memtable {
    shared: Arc<Shared>,
    wal: WalWriter,
    worker: Option<JoinHandle<()>>,
}

impl Memtable {
    /// Create a memtable backed by a fresh WAL file at `wal_path`.
    ///
    /// `destination` supplies the filename and placement policy for
    /// SSTables produced by flushes; `checkpoint` is notified once a
    /// flush has been durably published, so the WAL can be trimmed up to
    /// the flushed watermark.
    pub fn new<P: AsRef<Path>>(
        wal_path: P,
        rotation_threshold_bytes: usize,
        destination: Arc<dyn SstableDestination>,
        checkpoint: Arc<dyn FlushCheckpoint>,
    ) -> Result<Self, MemtableError> {
        let wal = WalWriter::create(wal_path)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(SharedState {
                active: BTreeMap::new(),
                active_size_bytes: 0,
                immutable: VecDeque::new(),
                shutdown: false,
            }),
            condvar: Condvar::new(),
            rotation_threshold_bytes,
            destination,
            checkpoint,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("memtable-flush".into())
            .spawn(move || flush_worker(worker_shared))
            .map_err(|e| MemtableError::Internal(format!("failed to spawn flush worker: {e}")))?;

        Ok(Self {
            shared,
            wal,
            worker: Some(worker),
        })
    }

    /// Reconstruct a memtable from an existing WAL file by replaying it
    /// in full before accepting new writes. Used during engine recovery.
    ///
    /// The old WAL is truncated and rewritten with exactly the replayed
    /// entries, so recovery is idempotent and the on-disk log stays a
    /// faithful record of the memtable's current contents.
    pub fn recover<P: AsRef<Path>>(
        wal_path: P,
        rotation_threshold_bytes: usize,
        destination: Arc<dyn SstableDestination>,
        checkpoint: Arc<dyn FlushCheckpoint>,
    ) -> Result<(Self, u64), MemtableError> {
        let mut max_seq_no = 0u64;
        let mut replayed: BTreeMap<Vec<u8>, MemtableEntry> = BTreeMap::new();
        {
            let (_header, iter) = WalReader::open(wal_path.as_ref())?;
            for record in iter {
                let entry = record?;
                max_seq_no = max_seq_no.max(entry.seq_no);
                replayed.insert(
                    entry.key,
                    MemtableEntry {
                        seq_no: entry.seq_no,
                        value: entry.value,
                    },
                );
            }
        }

        let memtable = Self::new(wal_path, rotation_threshold_bytes, destination, checkpoint)?;
        for (key, entry) in replayed {
            match entry.value {
                Some(value) => memtable.put(entry.seq_no, key, value)?,
                None => memtable.delete(entry.seq_no, key)?,
            }
        }
        Ok((memtable, max_seq_no))
    }

    /// Insert or overwrite `key` with `value` at `seq_no`.
    ///
    /// Rejects a zero-length or oversized key, or an oversized value,
    /// before touching the WAL or the active store.
    pub fn put(&self, seq_no: u64, key: Vec<u8>, value: Vec<u8>) -> Result<(), MemtableError> {
        validate_key_value(&key, Some(&value))?;
        self.wal.append(&WalEntry::put(seq_no, key.clone(), value.clone()))?;
        self.set(
            key,
            MemtableEntry {
                seq_no,
                value: Some(value),
            },
        )
    }

    /// Tombstone `key` at `seq_no`.
    ///
    /// Rejects a zero-length or oversized key before touching the WAL
    /// or the active store.
    pub fn delete(&self, seq_no: u64, key: Vec<u8>) -> Result<(), MemtableError> {
        validate_key_value(&key, None)?;
        self.wal.append(&WalEntry::delete(seq_no, key.clone()))?;
        self.set(key, MemtableEntry { seq_no, value: None })
    }

    /// Read the most recent entry for `key`, checking the active store
    /// and then each immutable generation newest-first.
    pub fn get(&self, key: &[u8]) -> Result<MemtableGetResult, MemtableError> {
        let guard = self.lock()?;
        if let Some(entry) = guard.active.get(key) {
            return Ok(resolve(entry));
        }
        for task in guard.immutable.iter().rev() {
            if let Some(entry) = task.store.get(key) {
                return Ok(resolve(entry));
            }
        }
        Ok(MemtableGetResult::NotFound)
    }

    /// Number of generations currently queued for flush (for tests and
    /// diagnostics).
    pub fn pending_flush_count(&self) -> Result<usize, MemtableError> {
        Ok(self.lock()?.immutable.len())
    }

    fn set(&self, key: Vec<u8>, entry: MemtableEntry) -> Result<(), MemtableError> {
        let mut guard = self.lock()?;

        if let Some(old) = guard.active.get(&key) {
            guard.active_size_bytes -= key.len() + old.size_bytes();
        }
        guard.active_size_bytes += key.len() + entry.size_bytes();
        guard.active.insert(key, entry);

        if guard.active_size_bytes >= self.shared.rotation_threshold_bytes {
            let rotated = std::mem::take(&mut guard.active);
            let checkpoint_seq_no = rotated.values().map(|e| e.seq_no).max().unwrap_or(0);
            guard.active_size_bytes = 0;
            trace!(entries = rotated.len(), checkpoint_seq_no, "rotating memtable");
            guard.immutable.push_back(FlushTask {
                store: Arc::new(rotated),
                checkpoint_seq_no,
            });
            self.shared.condvar.notify_one();
        }

        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SharedState>, MemtableError> {
        self.shared
            .state
            .lock()
            .map_err(|_| MemtableError::Internal("memtable state lock poisoned".into()))
    }

    /// Signal the flush worker to drain the immutable queue and stop,
    /// then wait for it to finish.
    ///
    /// Takes `self` by value: once a caller has called `close`, the
    /// value is gone and `put`/`delete`/`get` on it are a compile error,
    /// not a runtime `ShutdownError` — the strongest form of "operations
    /// after close are rejected" a type system can offer.
    pub fn close(mut self) -> Result<(), MemtableError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), MemtableError> {
        {
            let mut guard = self.lock()?;
            guard.shutdown = true;
            self.shared.condvar.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| MemtableError::Internal("flush worker thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for Memtable {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!(%err, "memtable shutdown failed during drop");
        }
    }
}

fn resolve(entry: &MemtableEntry) -> MemtableGetResult {
    if entry.is_tombstone() {
        MemtableGetResult::Delete
    } else {
        MemtableGetResult::Put(entry.value.clone().unwrap_or_default())
    }
}

// ------------------------------------------------------------------------------------------------
// Flush worker
// ------------------------------------------------------------------------------------------------

fn flush_worker(shared: Arc<Shared>) {
    loop {
        let task = match peek_next_task(&shared) {
            Some(task) => task,
            None => return,
        };

        match flush_one(&shared, &task) {
            Ok(()) => remove_flushed_task(&shared),
            Err(err) => {
                error!(%err, "memtable flush failed; generation stays queued for retry");
            }
        }
    }
}

/// Wait until the immutable queue is non-empty or shutdown has been
/// requested, then clone (not remove) the head task, releasing the lock
/// before returning. The task stays on the queue — and therefore visible
/// to `get` — until [`remove_flushed_task`] takes it off after a
/// successful flush. Returns `None` once shutdown has been requested and
/// the queue is fully drained.
fn peek_next_task(shared: &Shared) -> Option<FlushTask> {
    let mut guard = shared.state.lock().unwrap_or_else(|p| p.into_inner());
    loop {
        if let Some(task) = guard.immutable.front() {
            return Some(task.clone());
        }
        if guard.shutdown {
            return None;
        }
        guard = shared
            .condvar
            .wait(guard)
            .unwrap_or_else(|p| p.into_inner());
    }
}

/// Remove the head of the immutable queue after its flush has durably
/// succeeded. The head is always the task just flushed: only this worker
/// thread ever pops, and pushes only ever happen at the back.
fn remove_flushed_task(shared: &Shared) {
    let mut guard = shared.state.lock().unwrap_or_else(|p| p.into_inner());
    guard.immutable.pop_front();
}

fn flush_one(shared: &Shared, task: &FlushTask) -> Result<(), MemtableError> {
    if task.store.is_empty() {
        return Ok(());
    }

    let entries: Vec<SstableEntry> = task
        .store
        .iter()
        .map(|(key, entry)| SstableEntry {
            seq_no: entry.seq_no,
            key: key.clone(),
            value: entry.value.clone(),
        })
        .collect();

    let path = shared.destination.next_path(task.checkpoint_seq_no);
    SstableWriter::new()
        .write(&path, &entries)
        .map_err(|e| MemtableError::Internal(format!("SSTable flush failed: {e}")))?;

    shared.destination.on_published(&path, task.checkpoint_seq_no);

    if let Err(err) = shared.checkpoint.checkpoint(task.checkpoint_seq_no) {
        warn!(%err, "flush checkpoint notification failed");
    }

    info!(
        path = %path.display(),
        entries = entries.len(),
        checkpoint_seq_no = task.checkpoint_seq_no,
        "flushed memtable generation"
    );
    Ok(())
}
