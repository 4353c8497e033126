use tempfile::TempDir;

use crate::BLOCK_SIZE;
use crate::file_store::{FileStore, StoreHeader};

#[test]
fn test_read_write_roundtrip_on_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data");
    let fs = FileStore::open(&path, false).unwrap();
    fs.write_fully(BLOCK_SIZE as u64, b"payload").unwrap();
    assert_eq!(fs.read_fully(BLOCK_SIZE as u64, 7).unwrap(), b"payload");
    assert_eq!(fs.size().unwrap(), BLOCK_SIZE as u64 + 7);
}

#[test]
fn test_in_memory_backend() {
    let fs = FileStore::in_memory();
    assert_eq!(fs.size().unwrap(), 0);
    fs.write_fully(10, &[1, 2, 3]).unwrap();
    assert_eq!(fs.read_fully(10, 3).unwrap(), vec![1, 2, 3]);
    assert!(fs.read_fully(12, 5).is_err());
    fs.truncate(0).unwrap();
    assert_eq!(fs.size().unwrap(), 0);
}

#[test]
fn test_second_writer_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data");
    let _first = FileStore::open(&path, false).unwrap();
    let second = FileStore::open(&path, false);
    assert!(matches!(
        second,
        Err(crate::StoreError::FileLocked(_))
    ));
}

#[test]
fn test_store_header_dual_copies() {
    let fs = FileStore::in_memory();
    let mut header = StoreHeader::new(1000);
    header.chunk = 9;
    header.block = 77;
    header.version = 4;
    header.clean = true;
    header.other.insert("futureKey".into(), "abc".into());
    fs.write_store_header(&header).unwrap();

    let (read, agree) = fs.read_store_header().unwrap();
    assert!(agree);
    assert_eq!(read.chunk, 9);
    assert_eq!(read.block, 77);
    assert_eq!(read.version, 4);
    assert!(read.clean);
    // unknown keys survive a rewrite
    assert_eq!(read.other.get("futureKey").unwrap(), "abc");
    let rewritten = read.serialize();
    assert!(String::from_utf8_lossy(&rewritten).contains("futureKey:abc"));
}

#[test]
fn test_torn_header_copy_is_tolerated() {
    let fs = FileStore::in_memory();
    let mut header = StoreHeader::new(1000);
    header.version = 8;
    fs.write_store_header(&header).unwrap();
    // tear the first copy
    fs.write_fully(0, &[0u8; 16]).unwrap();
    let (read, agree) = fs.read_store_header().unwrap();
    assert!(!agree);
    assert_eq!(read.version, 8);
}

#[test]
fn test_unsupported_block_size_is_rejected() {
    let fs = FileStore::in_memory();
    let mut header = StoreHeader::new(0);
    header.block_size = 512;
    let bytes = header.serialize();
    assert!(StoreHeader::parse(&bytes).is_err());
}
