// End-to-end walk through the storage core: create a pooled storage,
// write a few pages, checkpoint, reopen and read them back.
//
//     cargo run --example buffer_pool_demo

use burrow_db::buffer::{BufferPool, BufferPoolConfig};
use burrow_db::storage::FileStorageConfig;
use burrow_db::Result;

fn main() -> Result<()> {
    let dir = std::env::temp_dir().join("burrow-demo");
    std::fs::create_dir_all(&dir).expect("failed to create demo directory");
    let path = dir.join("demo.db");

    let config = BufferPoolConfig {
        pool_size_kb: 1024,
        prefetching_degree: 0,
        num_partitions: 4,
        numa_aware: false,
    };

    let mut pool = BufferPool::create(
        config.clone(),
        &path,
        FileStorageConfig { page_size_kb: 4 },
        true,
    )?;

    let mut pages = Vec::new();
    for i in 0..8u64 {
        let mut handler = pool.alloc()?;
        let message = format!("page {i} says hello");
        handler.data_mut()[..message.len()].copy_from_slice(message.as_bytes());
        pool.set_page_dirty(handler.page_id())?;
        pool.unpin(&handler)?;
        pages.push((handler.page_id(), message));
    }

    pool.checkpoint()?;
    let stats = pool.get_statistics()?;
    println!(
        "{} pages resident, {} reserved, {}-byte pages",
        stats.num_allocated_pages, stats.num_reserved_pages, stats.page_size
    );
    pool.close()?;

    let pool = BufferPool::open(config, &path)?;
    for (page_id, message) in &pages {
        let handler = pool.pin(*page_id, true)?;
        let read = std::str::from_utf8(&handler.data()[..message.len()]).unwrap();
        assert_eq!(read, message);
        println!("page {page_id}: {read}");
        pool.unpin(&handler)?;
    }
    pool.check_consistency()?;

    let (hits, misses, evictions) = pool.cache_counters();
    println!("cache: {hits} hits, {misses} misses, {evictions} evictions");
    Ok(())
}
