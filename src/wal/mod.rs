//! Write-ahead log for the storage engine's mutation stream.
//!
//! Every `put` and `delete` is appended here before it becomes visible in
//! the memtable, so a crash can always be recovered from by replaying the
//! log. The file format is a fixed 32-byte header followed by a stream of
//! length-prefixed, CRC32-protected entries.
//!
//! # On-disk layout
//!
//! ```text
//! [MAGIC 4B][VERSION u32][TIMESTAMP u64][RESERVED 16B]   <- 32-byte header
//! [LEN u32][PAYLOAD][CRC32 u32]
//! [LEN u32][PAYLOAD][CRC32 u32]
//! ...
//! ```
//!
//! `PAYLOAD` is `seq_no(8) || op(1) || key_len(2) || val_len(4) || key || value`,
//! all integers big-endian. The CRC32 checksum covers `PAYLOAD` only, not
//! the length prefix.
//!
//! # Concurrency model
//!
//! [`WalWriter::append`] hands the encoded entry to a background thread
//! over a [`crossbeam::channel`]; the thread coalesces up to 256 queued
//! entries into a single write, followed by one `flush` and one `fsync`.
//! This amortizes the fsync cost across bursts of writes while keeping
//! every acknowledged entry durable before the next batch starts.
//!
//! # Recovery
//!
//! [`WalReader`] replays entries in order. A clean end-of-file — whether
//! it lands exactly on an entry boundary or mid-way through a length
//! prefix or payload — terminates iteration without error: a process
//! crash can leave a partially-written final entry, and that is an
//! expected, recoverable condition, not corruption. A complete entry
//! whose CRC32 does not match its payload **is** corruption and surfaces
//! as [`WalError::ChecksumMismatch`].


use std::{
    fs::{File, OpenOptions},
    io::{self, BufReader, BufWriter, Read, Write},
    path::Path,
    thread::JoinHandle,
    time::{SystemTime, UNIX_EPOCH},
};

use crc32fast::Hasher as Crc32;
use crossbeam::channel::{self, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

const MAGIC: [u8; 4] = *b"WALX";
const CURRENT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 32;
const RESERVED_SIZE: usize = 16;
const FIXED_PAYLOAD_PREFIX: usize = 8 + 1 + 2 + 4; // seq_no + op + key_len + val_len
const CRC32_SIZE: usize = 4;
const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum number of queued entries folded into a single batched write.
const WRITE_BATCH_LIMIT: usize = 256;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Payload encoding/decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Entry checksum did not match its payload.
    #[error("WAL entry checksum mismatch at seq_no {seq_no}")]
    ChecksumMismatch {
        /// Sequence number of the corrupted entry.
        seq_no: u64,
    },

    /// The file header failed validation (bad magic or unsupported version).
    #[error("invalid WAL header: {0}")]
    InvalidHeader(String),

    /// The operation byte in an entry was not a recognised [`OperationType`].
    #[error("invalid WAL operation byte: {0}")]
    InvalidOperation(u8),

    /// The background writer thread has already shut down.
    #[error("WAL writer is shut down")]
    WriterShutdown,

    /// Internal consistency error (poisoned lock, unexpected channel state).
    #[error("internal WAL error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

/// The 32-byte header written once at the start of every WAL file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    /// Format version. Currently always [`WalHeader::CURRENT_VERSION`].
    pub version: u32,
    /// Unix timestamp (seconds) at the time the WAL file was created.
    pub timestamp: u64,
}

impl WalHeader {
    /// The version written by this crate.
    pub const CURRENT_VERSION: u32 = CURRENT_VERSION;

    fn now() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            version: CURRENT_VERSION,
            timestamp,
        }
    }

    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&[0u8; RESERVED_SIZE]);
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    fn decode(buf: &[u8]) -> Result<Self, WalError> {
        if buf.len() != HEADER_SIZE {
            return Err(WalError::InvalidHeader(format!(
                "expected {HEADER_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        let magic = &buf[0..4];
        if magic != MAGIC {
            return Err(WalError::InvalidHeader(format!(
                "bad magic number {magic:?}"
            )));
        }
        let version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if version == 0 {
            return Err(WalError::InvalidHeader("version must be non-zero".into()));
        }
        let timestamp = u64::from_be_bytes([
            buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
        ]);
        Ok(Self { version, timestamp })
    }
}

// ------------------------------------------------------------------------------------------------
// Entries
// ------------------------------------------------------------------------------------------------

/// The kind of mutation a [`WalEntry`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    /// Insert or overwrite a key.
    Put = 1,
    /// Tombstone a key.
    Delete = 2,
}

impl OperationType {
    fn from_u8(byte: u8) -> Result<Self, WalError> {
        match byte {
            1 => Ok(Self::Put),
            2 => Ok(Self::Delete),
            other => Err(WalError::InvalidOperation(other)),
        }
    }
}

/// A single logged mutation.
///
/// `seq_no` is caller-assigned and monotonically increasing; the WAL
/// preserves it but never generates one of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    /// Caller-assigned sequence number.
    pub seq_no: u64,
    /// Whether this is an insert or a tombstone.
    pub op: OperationType,
    /// The mutated key.
    pub key: Vec<u8>,
    /// The new value. Always `None` for [`OperationType::Delete`].
    pub value: Option<Vec<u8>>,
}

impl WalEntry {
    /// Construct a `Put` entry.
    pub fn put(seq_no: u64, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            seq_no,
            op: OperationType::Put,
            key,
            value: Some(value),
        }
    }

    /// Construct a `Delete` (tombstone) entry.
    pub fn delete(seq_no: u64, key: Vec<u8>) -> Self {
        Self {
            seq_no,
            op: OperationType::Delete,
            key,
            value: None,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>, WalError> {
        if self.key.len() > u16::MAX as usize {
            return Err(WalError::Encoding(EncodingError::LengthOverflow(format!(
                "key length {} exceeds u16::MAX",
                self.key.len()
            ))));
        }
        let value = self.value.as_deref().unwrap_or(&[]);

        let mut payload = Vec::with_capacity(FIXED_PAYLOAD_PREFIX + self.key.len() + value.len());
        self.seq_no.encode_to(&mut payload)?;
        (self.op as u8).encode_to(&mut payload)?;
        (self.key.len() as u16).encode_to(&mut payload)?;
        (value.len() as u32).encode_to(&mut payload)?;
        payload.extend_from_slice(&self.key);
        payload.extend_from_slice(value);
        Ok(payload)
    }

    /// Serialize to `[len u32][payload][crc32 u32]`.
    fn encode_framed(&self) -> Result<Vec<u8>, WalError> {
        let payload = self.encode_payload()?;
        let mut crc = Crc32::new();
        crc.update(&payload);
        let checksum = crc.finalize();

        let mut framed = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len() + CRC32_SIZE);
        (payload.len() as u32).encode_to(&mut framed)?;
        framed.extend_from_slice(&payload);
        checksum.encode_to(&mut framed)?;
        Ok(framed)
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, WalError> {
        let (seq_no, mut offset) = u64::decode_from(payload)?;
        let (op_byte, n) = u8::decode_from(&payload[offset..])?;
        offset += n;
        let op = OperationType::from_u8(op_byte)?;
        let (key_len, n) = u16::decode_from(&payload[offset..])?;
        offset += n;
        let (val_len, n) = u32::decode_from(&payload[offset..])?;
        offset += n;

        let (key, n) = encoding::read_raw_bytes(&payload[offset..], key_len as usize)?;
        offset += n;
        let (value_bytes, n) = encoding::read_raw_bytes(&payload[offset..], val_len as usize)?;
        offset += n;
        let _ = offset;

        let value = if matches!(op, OperationType::Delete) || value_bytes.is_empty() {
            None
        } else {
            Some(value_bytes)
        };

        Ok(Self {
            seq_no,
            op,
            key,
            value,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

enum WriterMsg {
    Entry(Vec<u8>),
    Shutdown,
}

/// Appends entries to a WAL file via a background batching thread.
///
/// Every call to [`WalWriter::append`] is non-blocking from the caller's
/// perspective: the encoded entry is handed to the background thread,
/// which coalesces bursts of entries into a single write + flush + fsync.
pub struct WalWriter {
    sender: Sender<WriterMsg>,
    handle: Option<JoinHandle<Result<(), WalError>>>,
}

impl WalWriter {
    /// Create a new WAL file at `path`, writing its header, and start the
    /// background writer thread.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, WalError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path.as_ref())?;

        let header = WalHeader::now();
        file.write_all(&header.encode())?;
        file.flush()?;
        file.sync_all()?;

        let (sender, receiver) = channel::unbounded();
        let handle = std::thread::Builder::new()
            .name("wal-writer".into())
            .spawn(move || background_writer(file, receiver))
            .map_err(|e| WalError::Internal(format!("failed to spawn WAL writer thread: {e}")))?;

        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    /// Queue `entry` for durable persistence. Returns once the entry has
    /// been handed to the background thread, not once it is on disk.
    pub fn append(&self, entry: &WalEntry) -> Result<(), WalError> {
        let framed = entry.encode_framed()?;
        self.sender
            .send(WriterMsg::Entry(framed))
            .map_err(|_| WalError::WriterShutdown)?;
        trace!(seq_no = entry.seq_no, "queued WAL entry");
        Ok(())
    }

    /// Signal shutdown and wait for the background thread to flush and
    /// fsync every queued entry.
    pub fn close(mut self) -> Result<(), WalError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), WalError> {
        if let Some(handle) = self.handle.take() {
            let _ = self.sender.send(WriterMsg::Shutdown);
            match handle.join() {
                Ok(result) => result,
                Err(_) => Err(WalError::Internal("WAL writer thread panicked".into())),
            }
        } else {
            Ok(())
        }
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!(%err, "WAL writer shutdown failed during drop");
        }
    }
}

fn background_writer(mut file: File, receiver: Receiver<WriterMsg>) -> Result<(), WalError> {
    loop {
        let first = match receiver.recv() {
            Ok(msg) => msg,
            Err(_) => return Ok(()),
        };

        let mut batch = match first {
            WriterMsg::Shutdown => return Ok(()),
            WriterMsg::Entry(bytes) => vec![bytes],
        };

        let mut shutting_down = false;
        while batch.len() < WRITE_BATCH_LIMIT {
            match receiver.try_recv() {
                Ok(WriterMsg::Entry(bytes)) => batch.push(bytes),
                Ok(WriterMsg::Shutdown) => {
                    shutting_down = true;
                    break;
                }
                Err(_) => break,
            }
        }

        write_batch(&mut file, &batch)?;

        if shutting_down {
            return Ok(());
        }
    }
}

fn write_batch(file: &mut File, batch: &[Vec<u8>]) -> Result<(), WalError> {
    if batch.is_empty() {
        return Ok(());
    }
    let mut writer = BufWriter::new(&mut *file);
    for entry in batch {
        writer.write_all(entry)?;
    }
    writer.flush()?;
    file.sync_all()?;
    debug!(count = batch.len(), "fsynced WAL batch");
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// Opens a WAL file and exposes its header plus an iterator over entries.
pub struct WalReader;

impl WalReader {
    /// Open `path`, validate its header, and return the header alongside
    /// an iterator over the entries that follow it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<(WalHeader, WalIter), WalError> {
        let mut file = File::open(path.as_ref())?;
        let mut header_buf = [0u8; HEADER_SIZE];
        let read = read_best_effort(&mut file, &mut header_buf)?;
        if read < HEADER_SIZE {
            return Err(WalError::InvalidHeader(format!(
                "file shorter than header: {read} bytes"
            )));
        }
        let header = WalHeader::decode(&header_buf)?;
        Ok((
            header,
            WalIter {
                reader: BufReader::new(file),
                done: false,
            },
        ))
    }
}

/// An iterator over the entries of a WAL file, in append order.
///
/// Yields `Err` only for a fully-framed entry that fails its checksum or
/// for an unexpected I/O error. Any truncation at the tail of the file —
/// a partial length prefix or a partial payload — ends iteration cleanly.
pub struct WalIter {
    reader: BufReader<File>,
    done: bool,
}

impl Iterator for WalIter {
    type Item = Result<WalEntry, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        let read = match read_best_effort(&mut self.reader, &mut len_buf) {
            Ok(n) => n,
            Err(err) => {
                self.done = true;
                return Some(Err(err.into()));
            }
        };
        if read == 0 {
            self.done = true;
            return None;
        }
        if read < LENGTH_PREFIX_SIZE {
            warn!("WAL truncated mid length-prefix; stopping replay cleanly");
            self.done = true;
            return None;
        }

        let entry_len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; entry_len];
        let read = match read_best_effort(&mut self.reader, &mut body) {
            Ok(n) => n,
            Err(err) => {
                self.done = true;
                return Some(Err(err.into()));
            }
        };
        if read < entry_len {
            warn!("WAL truncated mid entry; stopping replay cleanly");
            self.done = true;
            return None;
        }

        if body.len() < CRC32_SIZE {
            warn!("WAL entry shorter than checksum field; stopping replay cleanly");
            self.done = true;
            return None;
        }
        let split = body.len() - CRC32_SIZE;
        let payload = &body[..split];
        let stored_crc = u32::from_be_bytes(body[split..].try_into().unwrap_or([0; 4]));

        let mut crc = Crc32::new();
        crc.update(payload);
        let computed_crc = crc.finalize();

        let entry = match WalEntry::decode_payload(payload) {
            Ok(entry) => entry,
            Err(err) => {
                error!(%err, "failed to decode WAL entry payload");
                self.done = true;
                return Some(Err(err));
            }
        };

        if stored_crc != computed_crc {
            error!(seq_no = entry.seq_no, "WAL entry checksum mismatch");
            self.done = true;
            return Some(Err(WalError::ChecksumMismatch {
                seq_no: entry.seq_no,
            }));
        }

        Some(Ok(entry))
    }
}

/// Read as many bytes as are available into `buf`, short of an error,
/// returning the number of bytes actually read (which may be less than
/// `buf.len()` on a clean EOF).
fn read_best_effort<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}
