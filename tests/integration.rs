//! End-to-end tests for the write path and persistence core: memtable
//! rotation and flush, WAL replay across a crash, SSTable roundtrips,
//! and atomic SSTable publication.
//!
//! These exercise the public surface of [`segmentkv::memtable`],
//! [`segmentkv::wal`], [`segmentkv::sstable`], and [`segmentkv::flush`]
//! together, the way a surrounding database façade would drive them; no
//! such façade exists in this crate.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use segmentkv::flush::{DirectoryDestination, FlushCheckpoint, WatermarkCheckpoint};
use segmentkv::memtable::{Memtable, MemtableGetResult};
use segmentkv::sstable::builder::SstableWriter;
use segmentkv::sstable::reader::{SstableLookup, SstableReader};
use segmentkv::sstable::SstableEntry;
use segmentkv::wal::{OperationType, WalEntry, WalReader, WalWriter};

fn wait_until<F: Fn() -> bool>(predicate: F) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition never became true within the test timeout");
}

// ================================================================================================
// Scenario 1/2: single put/get, delete shadows put
// ================================================================================================

#[test]
fn single_put_then_get_returns_the_written_value() {
    let tmp = TempDir::new().unwrap();
    let memtable = Memtable::new(
        tmp.path().join("wal.log"),
        segmentkv::memtable::DEFAULT_ROTATION_THRESHOLD_BYTES,
        Arc::new(DirectoryDestination::new(tmp.path())),
        Arc::new(WatermarkCheckpoint::new()),
    )
    .unwrap();

    memtable.put(1, b"k".to_vec(), b"v".to_vec()).unwrap();
    assert_eq!(memtable.get(b"k").unwrap(), MemtableGetResult::Put(b"v".to_vec()));
}

#[test]
fn delete_shadows_an_earlier_put_at_a_higher_seq_no() {
    let tmp = TempDir::new().unwrap();
    let memtable = Memtable::new(
        tmp.path().join("wal.log"),
        segmentkv::memtable::DEFAULT_ROTATION_THRESHOLD_BYTES,
        Arc::new(DirectoryDestination::new(tmp.path())),
        Arc::new(WatermarkCheckpoint::new()),
    )
    .unwrap();

    memtable.put(1, b"k".to_vec(), b"v".to_vec()).unwrap();
    memtable.delete(2, b"k".to_vec()).unwrap();
    assert_eq!(memtable.get(b"k").unwrap(), MemtableGetResult::Delete);
}

// ================================================================================================
// Scenario 3: memtable rotation produces one flush task with the right checkpoint
// ================================================================================================

#[test]
fn writing_past_the_rotation_threshold_triggers_exactly_one_flush() {
    const KEY_LEN: usize = 10; // "key-NNNNNN"
    const VALUE_LEN: usize = 4 * 1024;
    const ENTRY_COUNT: u64 = 1024;
    // ~4 MiB of accounted entry size (key bytes + 8-byte seq_no + value
    // bytes each), matching `Memtable::set`'s `key.len() + 8 + value_len`
    // accounting exactly so the threshold is crossed on the final entry.
    let rotation_threshold = (KEY_LEN + VALUE_LEN + 8) * ENTRY_COUNT as usize;

    let tmp = TempDir::new().unwrap();
    let checkpoint = Arc::new(WatermarkCheckpoint::new());
    let memtable = Memtable::new(
        tmp.path().join("wal.log"),
        rotation_threshold,
        Arc::new(DirectoryDestination::new(tmp.path())),
        Arc::clone(&checkpoint) as Arc<dyn FlushCheckpoint>,
    )
    .unwrap();

    for i in 0..ENTRY_COUNT {
        memtable
            .put(i + 1, format!("key-{i:06}").into_bytes(), vec![0xABu8; VALUE_LEN])
            .unwrap();
    }

    // The final put crosses the threshold and rotates exactly one
    // generation into the immutable queue. Every key written so far must
    // still be readable right away, regardless of whether the background
    // worker has started flushing that generation yet — it stays queued
    // (and visible to `get`) until its SSTable is durably published.
    assert_eq!(memtable.pending_flush_count().unwrap(), 1);
    for i in 0..ENTRY_COUNT {
        let key = format!("key-{i:06}");
        assert_eq!(
            memtable.get(key.as_bytes()).unwrap(),
            MemtableGetResult::Put(vec![0xABu8; VALUE_LEN]),
            "key {key} should be readable from the queued generation before its flush completes"
        );
    }

    // The checkpoint watermark should eventually reach the highest
    // written seq_no once that generation's flush is durably published.
    wait_until(|| checkpoint.watermark() == ENTRY_COUNT);
    assert_eq!(checkpoint.watermark(), ENTRY_COUNT);

    memtable.close().unwrap();
}

// ================================================================================================
// Scenario 4: SSTable roundtrip over a large sorted key set
// ================================================================================================

#[test]
fn sstable_roundtrip_over_ten_thousand_entries() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("table.sst");

    let mut entries = Vec::with_capacity(10_000);
    for i in 0..10_000u32 {
        let key = format!("key{i:05}").into_bytes();
        let mut value = key.clone();
        value.reverse();
        entries.push(SstableEntry {
            seq_no: i as u64,
            key,
            value: Some(value),
        });
    }
    entries.sort_by(|a, b| a.key.cmp(&b.key));

    SstableWriter::new().write(&path, &entries).unwrap();

    let reader = SstableReader::open(&path).unwrap();
    assert_eq!(reader.header.entry_count, 10_000);

    for entry in &entries {
        let expected = entry.value.clone().unwrap();
        assert_eq!(reader.get(&entry.key).unwrap(), SstableLookup::Found(expected));
    }

    assert_eq!(reader.get(b"zzz").unwrap(), SstableLookup::Absent);
    assert_eq!(reader.get(b"000").unwrap(), SstableLookup::Absent);
}

// ================================================================================================
// Scenario 5: WAL replay across a crash tolerates a truncated tail entry
// ================================================================================================

#[test]
fn wal_replay_stops_cleanly_at_a_truncated_tail_entry() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("wal.log");

    let writer = WalWriter::create(&path).unwrap();
    for seq_no in 1..=100u64 {
        writer
            .append(&WalEntry::put(seq_no, format!("k{seq_no}").into_bytes(), b"v".to_vec()))
            .unwrap();
    }
    writer.close().unwrap();

    // Simulate a crash mid-append on the very last entry.
    let mut bytes = std::fs::read(&path).unwrap();
    bytes.truncate(bytes.len() - 5);
    std::fs::write(&path, &bytes).unwrap();

    let (_header, iter) = WalReader::open(&path).unwrap();
    let replayed: Vec<WalEntry> = iter.map(|r| r.unwrap()).collect();

    assert_eq!(replayed.len(), 99);
    assert_eq!(replayed.last().unwrap().seq_no, 99);
    assert!(replayed.iter().all(|e| e.op == OperationType::Put));
}

// ================================================================================================
// Scenario 6: atomic SSTable publication never leaves a partial file
// ================================================================================================

#[test]
fn failed_write_leaves_no_file_and_a_retry_succeeds() {
    let tmp = TempDir::new().unwrap();
    let final_path = tmp.path().join("table.sst");

    let entries = vec![SstableEntry {
        seq_no: 1,
        key: b"k".to_vec(),
        value: Some(b"v".to_vec()),
    }];

    // Writing to a path whose parent directory does not exist fails
    // before rename, so the final path is never created and no temp
    // file is left behind.
    let missing_dir_path = tmp.path().join("does-not-exist").join("table.sst");
    let err = SstableWriter::new().write(&missing_dir_path, &entries).unwrap_err();
    assert!(matches!(err, segmentkv::sstable::SstableError::Io(_)));
    assert!(!missing_dir_path.exists());
    assert!(!missing_dir_path.with_extension("tmp").exists());

    // A retry at a valid path succeeds and produces a readable table.
    SstableWriter::new().write(&final_path, &entries).unwrap();
    assert!(final_path.exists());
    let reader = SstableReader::open(&final_path).unwrap();
    assert_eq!(reader.get(b"k").unwrap(), SstableLookup::Found(b"v".to_vec()));
}

// ================================================================================================
// Full-stack: memtable + flush worker + WAL recovery survive a restart
// ================================================================================================

#[test]
fn memtable_recovers_all_writes_from_its_wal_after_a_simulated_restart() {
    let tmp = TempDir::new().unwrap();
    let wal_path = tmp.path().join("wal.log");

    {
        let memtable = Memtable::new(
            &wal_path,
            segmentkv::memtable::DEFAULT_ROTATION_THRESHOLD_BYTES,
            Arc::new(DirectoryDestination::new(tmp.path())),
            Arc::new(WatermarkCheckpoint::new()),
        )
        .unwrap();

        for i in 0..50u64 {
            memtable
                .put(i + 1, format!("key-{i}").into_bytes(), format!("value-{i}").into_bytes())
                .unwrap();
        }
        memtable.delete(51, b"key-0".to_vec()).unwrap();

        // `Drop` performs the same join-the-flush-worker shutdown as an
        // explicit `close()`; recovery below only relies on the WAL,
        // not on any in-memory state surviving the drop.
        drop(memtable);
    }

    let (recovered, max_seq_no) = Memtable::recover(
        &wal_path,
        segmentkv::memtable::DEFAULT_ROTATION_THRESHOLD_BYTES,
        Arc::new(DirectoryDestination::new(tmp.path())),
        Arc::new(WatermarkCheckpoint::new()),
    )
    .unwrap();

    assert_eq!(max_seq_no, 51);
    assert_eq!(recovered.get(b"key-0").unwrap(), MemtableGetResult::Delete);
    for i in 1..50u64 {
        let key = format!("key-{i}");
        assert_eq!(
            recovered.get(key.as_bytes()).unwrap(),
            MemtableGetResult::Put(format!("value-{i}").into_bytes())
        );
    }

    recovered.close().unwrap();
}
