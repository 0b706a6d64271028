// Shared identifier types for the storage core.

/// Index of a page inside a page file.
pub type PageId = u64;

/// Index of a buffer slot inside the pool-wide slot array.
pub type BufferId = u32;

/// Sentinel page id, used to terminate on-disk page chains.
pub const INVALID_PAGE_ID: PageId = PageId::MAX;

/// Sentinel buffer id.
pub const INVALID_BUFFER_ID: BufferId = BufferId::MAX;

/// One kibibyte, the unit every size knob is expressed in.
pub const KIB: usize = 1024;
