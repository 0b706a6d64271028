use burrow_db::storage::{FileStorage, FileStorageConfig};
use burrow_db::StoreError;
use tempfile::TempDir;

// Opening and closing the storage keeps the persisted config.
#[test]
fn file_storage_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");

    let storage = FileStorage::create(&path, FileStorageConfig { page_size_kb: 4 }, true).unwrap();
    storage.close().unwrap();

    let storage = FileStorage::open(&path).unwrap();
    assert_eq!(storage.config().page_size_kb, 4);
    storage.close().unwrap();
}

// Reserved page ids are consecutive and size() tracks them.
#[test]
fn file_storage_reserve() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");

    let storage = FileStorage::create(&path, FileStorageConfig { page_size_kb: 64 }, true).unwrap();
    storage.close().unwrap();

    let storage = FileStorage::open(&path).unwrap();
    assert_eq!(storage.reserve(1).unwrap(), 0);
    assert_eq!(storage.reserve(1).unwrap(), 1);
    assert_eq!(storage.reserve(4).unwrap(), 2);
    assert_eq!(storage.reserve(1).unwrap(), 6);
    assert_eq!(storage.size(), 7);
    storage.close().unwrap();
}

// Write 63 pages filled with round-robin characters, reopen, verify.
#[test]
fn file_storage_read_write() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");

    let storage = FileStorage::create(&path, FileStorageConfig { page_size_kb: 64 }, true).unwrap();
    let page_size = storage.page_size();
    let contents = b"0123456789";

    let first = storage.reserve(63).unwrap();
    let mut data = vec![0u8; page_size];
    for page in first..first + 63 {
        data.fill(contents[(page % contents.len() as u64) as usize]);
        storage.write(page, &data).unwrap();
    }
    storage.close().unwrap();

    let storage = FileStorage::open(&path).unwrap();
    for page in first..first + 63 {
        storage.read(page, &mut data).unwrap();
        let expected = contents[(page % contents.len() as u64) as usize];
        assert!(data.iter().all(|&b| b == expected), "page {page} corrupted");
    }
    storage.close().unwrap();
}

// Out-of-bounds accesses and double creates are reported, not executed.
#[test]
fn file_storage_errors() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");

    let storage = FileStorage::create(&path, FileStorageConfig { page_size_kb: 64 }, true).unwrap();
    let mut data = vec![0u8; storage.page_size()];
    assert!(matches!(
        storage.write(63, &data),
        Err(StoreError::OutOfBoundsPage(63))
    ));
    assert!(matches!(
        storage.read(32, &mut data),
        Err(StoreError::OutOfBoundsPage(32))
    ));
    storage.close().unwrap();

    assert!(matches!(
        FileStorage::create(&path, FileStorageConfig { page_size_kb: 64 }, false),
        Err(StoreError::PathAlreadyExists(_))
    ));
}

// Newly reserved pages read back as zeroes even after a reopen.
#[test]
fn file_storage_reserve_zero_fills() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");

    let storage = FileStorage::create(&path, FileStorageConfig { page_size_kb: 4 }, true).unwrap();
    storage.reserve(8).unwrap();
    storage.close().unwrap();

    let storage = FileStorage::open(&path).unwrap();
    assert_eq!(storage.size(), 8);
    let mut data = vec![0xaau8; storage.page_size()];
    for page in 0..8 {
        storage.read(page, &mut data).unwrap();
        assert!(data.iter().all(|&b| b == 0));
    }
    storage.close().unwrap();
}
