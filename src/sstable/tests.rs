//! End-to-end tests for the SSTable writer and reader: roundtripping,
//! multi-block layouts, bloom filter exclusion, and corruption handling.

use tempfile::TempDir;

use super::builder::SstableWriter;
use super::reader::{SstableLookup, SstableReader};
use super::SstableEntry;

fn entry(seq_no: u64, key: &str, value: Option<&str>) -> SstableEntry {
    SstableEntry {
        seq_no,
        key: key.as_bytes().to_vec(),
        value: value.map(|v| v.as_bytes().to_vec()),
    }
}

#[test]
fn put_and_get_roundtrip_single_block() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");

    let entries = vec![
        entry(1, "apple", Some("red")),
        entry(2, "banana", Some("yellow")),
        entry(3, "cherry", Some("dark-red")),
    ];
    SstableWriter::new().write(&path, &entries).unwrap();

    let reader = SstableReader::open(&path).unwrap();
    assert_eq!(reader.header.entry_count, 3);
    assert_eq!(reader.get(b"banana").unwrap(), SstableLookup::Found(b"yellow".to_vec()));
    assert_eq!(reader.get(b"kiwi").unwrap(), SstableLookup::Absent);
}

#[test]
fn tombstones_are_reported_distinctly_from_absence() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");

    let entries = vec![entry(1, "apple", Some("red")), entry(2, "banana", None)];
    SstableWriter::new().write(&path, &entries).unwrap();

    let reader = SstableReader::open(&path).unwrap();
    assert_eq!(reader.get(b"banana").unwrap(), SstableLookup::Tombstone);
    assert_eq!(reader.get(b"missing").unwrap(), SstableLookup::Absent);
}

#[test]
fn many_entries_span_multiple_blocks_and_all_are_found() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");

    let mut entries = Vec::new();
    for i in 0..2000u64 {
        entries.push(entry(i, &format!("key-{i:06}"), Some(&format!("value-{i}"))));
    }
    SstableWriter::new()
        .with_block_size_bytes(512)
        .write(&path, &entries)
        .unwrap();

    let reader = SstableReader::open(&path).unwrap();
    for i in (0..2000u64).step_by(137) {
        let key = format!("key-{i:06}");
        let expected = format!("value-{i}");
        assert_eq!(
            reader.get(key.as_bytes()).unwrap(),
            SstableLookup::Found(expected.into_bytes())
        );
    }
    assert_eq!(reader.get(b"key-999999").unwrap(), SstableLookup::Absent);
}

#[test]
fn empty_entry_set_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");
    let err = SstableWriter::new().write(&path, &[]).unwrap_err();
    assert!(matches!(err, super::SstableError::EmptyInput));
}

#[test]
fn corrupted_block_checksum_is_detected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");

    let entries = vec![entry(1, "apple", Some("red")), entry(2, "banana", Some("yellow"))];
    SstableWriter::new().write(&path, &entries).unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    // Flip a byte inside the first data block, just past the header.
    let flip_at = super::HEADER_SIZE + super::BLOCK_HEADER_SIZE + 2;
    bytes[flip_at] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let reader = SstableReader::open(&path).unwrap();
    let err = reader.get(b"apple").unwrap_err();
    assert!(matches!(err, super::SstableError::ChecksumMismatch { .. }));
}

#[test]
fn bad_magic_on_open_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");

    let entries = vec![entry(1, "apple", Some("red"))];
    SstableWriter::new().write(&path, &entries).unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    bytes[0] = b'X';
    std::fs::write(&path, &bytes).unwrap();

    let err = SstableReader::open(&path).unwrap_err();
    assert!(matches!(err, super::SstableError::BadMagic(_)));
}

#[test]
fn level_is_preserved_through_write_and_open() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");

    let entries = vec![entry(1, "apple", Some("red"))];
    SstableWriter::new().with_level(3).write(&path, &entries).unwrap();

    let reader = SstableReader::open(&path).unwrap();
    assert_eq!(reader.header.level, 3);
}

#[test]
fn temp_file_is_cleaned_up_on_failed_write() {
    let tmp = TempDir::new().unwrap();
    // A path inside a nonexistent directory makes the temp-file open fail.
    let path = tmp.path().join("missing-subdir").join("000001.sst");

    let entries = vec![entry(1, "apple", Some("red"))];
    let err = SstableWriter::new().write(&path, &entries).unwrap_err();
    assert!(matches!(err, super::SstableError::Io(_)));
    assert!(!path.with_extension("tmp").exists());
}
