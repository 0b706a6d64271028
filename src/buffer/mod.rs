// The buffer pool: an in-memory, page-granular cache over a `FileStorage`.

pub(crate) mod alloc_table;
pub(crate) mod arena;
pub(crate) mod frame;
pub(crate) mod partition;
pub mod pool;

pub use frame::BufferHandler;
pub use pool::{BufferPool, BufferPoolConfig, BufferPoolStatistics};
