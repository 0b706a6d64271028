// Page-granular file storage.
//
// A `FileStorage` is a durable byte array chunked into fixed-size pages.
// Pages are reserved in zero-filled batches at the end of the file and
// addressed by `PageId`. The page size is fixed at create time and kept in a
// page-sized sidecar file next to the data file, which leaves page 0 of the
// data file free for the buffer pool's allocation bitmap.
//
// All operations on one instance are serialized behind a single mutex; the
// concurrency story lives one layer up, in the buffer pool.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;
use parking_lot::Mutex;

use crate::common::{PageId, KIB};
use crate::error::{Result, StoreError};

/// Suffix of the sidecar file holding the `FileStorageConfig`.
pub const CONFIG_FILE_SUFFIX: &str = ".config";

/// Storage configuration, persisted at create time and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStorageConfig {
    /// Size of a page in KiB.
    pub page_size_kb: u32,
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        Self { page_size_kb: 64 }
    }
}

struct Inner {
    file: Option<File>,
    /// Size of the file in pages.
    num_pages: u64,
    /// Zero page used to initialize newly reserved pages.
    filler: Vec<u8>,
}

pub struct FileStorage {
    path: PathBuf,
    config: FileStorageConfig,
    inner: Mutex<Inner>,
}

impl FileStorage {
    /// Creates a new storage at `path`. The sidecar config is written and
    /// synced before this returns; the data file itself starts empty, so the
    /// first `reserve` hands out page 0.
    pub fn create(
        path: impl AsRef<Path>,
        config: FileStorageConfig,
        overwrite: bool,
    ) -> Result<FileStorage> {
        let path = path.as_ref();
        if config.page_size_kb == 0 {
            return Err(StoreError::InvalidPath(format!(
                "{}: page size must be non-zero",
                path.display()
            )));
        }
        if !overwrite && path.exists() {
            return Err(StoreError::PathAlreadyExists(path.display().to_string()));
        }

        let page_size = config.page_size_kb as usize * KIB;
        write_config_file(&config_path(path), &config, page_size)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| StoreError::InvalidPath(format!("{}: {e}", path.display())))?;

        debug!(
            "created storage {} ({} KB pages)",
            path.display(),
            config.page_size_kb
        );
        Ok(FileStorage {
            path: path.to_path_buf(),
            config,
            inner: Mutex::new(Inner {
                file: Some(file),
                num_pages: 0,
                filler: vec![0u8; page_size],
            }),
        })
    }

    /// Opens an existing storage, reading the page size back from the
    /// sidecar config.
    pub fn open(path: impl AsRef<Path>) -> Result<FileStorage> {
        let path = path.as_ref();
        let config = read_config_file(&config_path(path))?;
        let page_size = config.page_size_kb as usize * KIB;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| StoreError::InvalidPath(format!("{}: {e}", path.display())))?;
        let len = file
            .metadata()
            .map_err(|e| StoreError::Critical(format!("stat of {} failed: {e}", path.display())))?
            .len();
        if len % page_size as u64 != 0 {
            return Err(StoreError::Critical(format!(
                "{} is not page aligned: {len} bytes with {page_size}-byte pages",
                path.display()
            )));
        }

        debug!("opened storage {} ({} pages)", path.display(), len / page_size as u64);
        Ok(FileStorage {
            path: path.to_path_buf(),
            config,
            inner: Mutex::new(Inner {
                file: Some(file),
                num_pages: len / page_size as u64,
                filler: vec![0u8; page_size],
            }),
        })
    }

    /// Appends `num_pages` zero-filled pages and returns the id of the first
    /// one.
    pub fn reserve(&self, num_pages: u32) -> Result<PageId> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let file = inner.file.as_mut().ok_or(StoreError::StorageNotOpen)?;
        let first = inner.num_pages;
        let offset = first * inner.filler.len() as u64;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StoreError::UnexpectedWrite { page: first, source: e })?;
        for i in 0..num_pages {
            file.write_all(&inner.filler).map_err(|e| StoreError::UnexpectedWrite {
                page: first + i as u64,
                source: e,
            })?;
            inner.num_pages += 1;
        }
        Ok(first)
    }

    /// Reads page `page_id` into `buf`. `buf` must be exactly one page.
    pub fn read(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        assert_eq!(buf.len(), self.page_size(), "read buffer is not page sized");
        let mut inner = self.inner.lock();
        if page_id >= inner.num_pages {
            return Err(StoreError::OutOfBoundsPage(page_id));
        }
        let offset = page_id * self.page_size() as u64;
        let file = inner.file.as_mut().ok_or(StoreError::StorageNotOpen)?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(buf))
            .map_err(|e| StoreError::UnexpectedRead { page: page_id, source: e })
    }

    /// Writes `buf` to page `page_id`. `buf` must be exactly one page.
    pub fn write(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        assert_eq!(buf.len(), self.page_size(), "write buffer is not page sized");
        let mut inner = self.inner.lock();
        if page_id >= inner.num_pages {
            return Err(StoreError::OutOfBoundsPage(page_id));
        }
        let offset = page_id * self.page_size() as u64;
        let file = inner.file.as_mut().ok_or(StoreError::StorageNotOpen)?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(buf))
            .map_err(|e| StoreError::UnexpectedWrite { page: page_id, source: e })
    }

    /// Flushes file contents and metadata to the device.
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.lock();
        let file = inner.file.as_ref().ok_or(StoreError::StorageNotOpen)?;
        file.sync_all()
            .map_err(|e| StoreError::Critical(format!("sync of {} failed: {e}", self.path.display())))
    }

    /// Syncs and releases the file handle. Closing twice is an error.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let file = inner.file.take().ok_or(StoreError::StorageNotOpen)?;
        file.sync_all()
            .map_err(|e| StoreError::Critical(format!("sync of {} failed: {e}", self.path.display())))?;
        debug!("closed storage {}", self.path.display());
        Ok(())
    }

    /// Size of the storage in pages.
    pub fn size(&self) -> u64 {
        self.inner.lock().num_pages
    }

    /// Size of a page in bytes.
    pub fn page_size(&self) -> usize {
        self.config.page_size_kb as usize * KIB
    }

    pub fn config(&self) -> FileStorageConfig {
        self.config
    }
}

fn config_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(CONFIG_FILE_SUFFIX);
    PathBuf::from(os)
}

// The sidecar is one page: the page size in KiB as a little-endian u32,
// the rest zero-filled.
fn write_config_file(path: &Path, config: &FileStorageConfig, page_size: usize) -> Result<()> {
    let mut bytes = vec![0u8; page_size];
    bytes[..4].copy_from_slice(&config.page_size_kb.to_le_bytes());
    let mut file = File::create(path)
        .map_err(|e| StoreError::InvalidPath(format!("{}: {e}", path.display())))?;
    file.write_all(&bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| StoreError::UnexpectedWrite { page: 0, source: e })
}

fn read_config_file(path: &Path) -> Result<FileStorageConfig> {
    let mut file = File::open(path)
        .map_err(|e| StoreError::InvalidPath(format!("{}: {e}", path.display())))?;
    let mut bytes = [0u8; 4];
    file.read_exact(&mut bytes)
        .map_err(|e| StoreError::UnexpectedRead { page: 0, source: e })?;
    let page_size_kb = u32::from_le_bytes(bytes);
    if page_size_kb == 0 {
        return Err(StoreError::Critical(format!(
            "{}: corrupted storage config",
            path.display()
        )));
    }
    Ok(FileStorageConfig { page_size_kb })
}
