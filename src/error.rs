use std::io;

use thiserror::Error;

use crate::common::{BufferId, PageId};

pub type Result<T> = std::result::Result<T, StoreError>;

/// Every fallible boundary operation of the storage core returns exactly one
/// of these. I/O failures keep their `std::io::Error` cause attached;
/// programming errors (pinning a page that was never reserved, touching a
/// protected page, unpinning without a pin) are asserts, not variants.
#[derive(Error, Debug)]
pub enum StoreError {
    // Storage
    #[error("invalid storage path: {0}")]
    InvalidPath(String),

    #[error("storage path already exists: {0}")]
    PathAlreadyExists(String),

    #[error("page {0} is out of bounds")]
    OutOfBoundsPage(PageId),

    #[error("unexpected error while reading page {page}")]
    UnexpectedRead {
        page: PageId,
        #[source]
        source: io::Error,
    },

    #[error("unexpected error while writing page {page}")]
    UnexpectedWrite {
        page: PageId,
        #[source]
        source: io::Error,
    },

    #[error("critical storage failure: {0}")]
    Critical(String),

    #[error("storage is not open")]
    StorageNotOpen,

    // Buffer pool
    #[error("buffer pool is out of memory: no evictable slot")]
    OutOfMemory,

    #[error("pool size {pool_size_kb} KB is not a multiple of the page size {page_size_kb} KB")]
    PoolSizeNotMultipleOfPageSize { pool_size_kb: u32, page_size_kb: u32 },

    #[error("{partitions} partitions do not evenly divide {slots} buffer slots")]
    InvalidPartitionCount { partitions: u32, slots: u32 },

    #[error("prefetching is enabled but the task runtime has no workers")]
    NoThreadsForPrefetching,

    #[error("NUMA-aware placement requested but the platform reports no NUMA nodes")]
    NumaUnsupported,

    // Buffer pool consistency violations
    #[error("allocated page {0} found in a free list")]
    AllocatedPageInFreeList(PageId),

    #[error("protected page {0} found in a free list")]
    ProtectedPageInFreeList(PageId),

    #[error("free page {0} missing from its partition's free list")]
    FreePageNotInFreeList(PageId),

    #[error("buffer {buffer} holds inconsistent descriptor data for page {page}")]
    BufferDescriptorIncorrectData { page: PageId, buffer: BufferId },

    #[error("free page {0} is mapped to a buffer slot")]
    FreePageMappedToBuffer(PageId),

    // Schema catalogue
    #[error("catalogue page {0} is corrupted")]
    SchemaPageCorrupted(PageId),

    #[error("schema element name `{0}` is too long")]
    SchemaNameTooLong(String),

    #[error("schema type `{0}` already exists")]
    SchemaTypeAlreadyExists(String),

    #[error("schema type `{0}` does not exist")]
    SchemaTypeNotFound(String),
}
