// The buffer pool.
//
// A fixed-capacity cache of file pages with partitioned bookkeeping, pin
// counting, dirty tracking, clock-sweep eviction and asynchronous prefetch
// dispatch. Clients obtain pages through `alloc`/`pin`, mutate them under a
// pin, mark them dirty, and rely on `checkpoint`/`close` for durability.
//
// Lock hierarchy (strict, acquisition order top to bottom):
//   1. partition locks, ascending partition index (all of them only in
//      multi-partition operations: alloc, checkpoint, statistics,
//      consistency check)
//   2. slot content locks, and the allocation bitmap lock
//   3. storage (leaf)
// No path acquires a partition lock while holding a content lock, and no
// path holds a content lock and the bitmap lock at once (the consistency
// checker, which holds the world anyway, excepted).

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard, RwLockWriteGuard};

use crate::buffer::alloc_table::{is_protected, AllocationTable};
use crate::buffer::arena::PoolArena;
use crate::buffer::frame::{BufferDescriptor, BufferHandler, FrameState};
use crate::buffer::partition::{partition_of_page, partition_of_slot, Partition};
use crate::common::{BufferId, PageId, KIB};
use crate::error::{Result, StoreError};
use crate::storage::{FileStorage, FileStorageConfig};
use crate::tasking::{self, Task};

#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Size of the pool in KiB. Must be a multiple of the page size.
    pub pool_size_kb: u32,
    /// How many pages past a pinned one to load in the background. 0
    /// disables prefetching.
    pub prefetching_degree: u32,
    /// Number of shards of the slot table. Must divide the slot count.
    pub num_partitions: u32,
    /// Segment the arena per NUMA node and bind slots to the node of their
    /// partition.
    pub numa_aware: bool,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            pool_size_kb: 1024 * 1024,
            prefetching_degree: 0,
            num_partitions: 1,
            numa_aware: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BufferPoolStatistics {
    /// Pages currently resident in the pool.
    pub num_allocated_pages: u64,
    /// Pages reserved in the storage, monotonically growing.
    pub num_reserved_pages: u64,
    /// Page size in bytes.
    pub page_size: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

pub struct BufferPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    storage: FileStorage,
    config: BufferPoolConfig,
    page_size: usize,
    num_slots: u32,
    num_partitions: u32,
    arena: PoolArena,
    descriptors: Vec<BufferDescriptor>,
    partitions: Vec<Mutex<Partition>>,
    alloc_table: Mutex<AllocationTable>,
    /// Clock-sweep cursor, shared by every partition. Advisory: racing
    /// increments just share sweep progress between workers.
    next_victim: AtomicU64,
    /// Round-robin cursor over the prefetch workers.
    next_worker: AtomicUsize,
    counters: PoolCounters,
    open: AtomicBool,
}

impl BufferPool {
    /// Opens a pool over an existing storage and loads the allocation
    /// bitmap from its protected pages.
    pub fn open(config: BufferPoolConfig, path: impl AsRef<Path>) -> Result<BufferPool> {
        let storage = FileStorage::open(path)?;
        validate_config(&config, storage.config().page_size_kb)?;
        Self::build(config, storage, true)
    }

    /// Creates a fresh storage and an empty pool over it.
    pub fn create(
        config: BufferPoolConfig,
        path: impl AsRef<Path>,
        storage_config: FileStorageConfig,
        overwrite: bool,
    ) -> Result<BufferPool> {
        validate_config(&config, storage_config.page_size_kb)?;
        let storage = FileStorage::create(path, storage_config, overwrite)?;
        Self::build(config, storage, false)
    }

    fn build(config: BufferPoolConfig, storage: FileStorage, load_bitmap: bool) -> Result<BufferPool> {
        let page_size = storage.page_size();
        let num_slots = (config.pool_size_kb as u64 * KIB as u64 / page_size as u64) as u32;
        let num_partitions = config.num_partitions;

        let arena = PoolArena::new(num_slots, page_size, num_partitions, config.numa_aware)?;
        let descriptors = (0..num_slots).map(|_| BufferDescriptor::new()).collect();

        let mut partitions: Vec<Partition> = (0..num_partitions).map(|_| Partition::new()).collect();
        for slot in 0..num_slots {
            partitions[partition_of_slot(slot, num_partitions) as usize]
                .free_buffers
                .push_back(slot);
        }

        let mut alloc_table = AllocationTable::new(page_size);
        if load_bitmap {
            alloc_table.load(&storage)?;
            for page in alloc_table.free_user_pages() {
                partitions[partition_of_page(page, num_partitions) as usize]
                    .free_pages
                    .push_back(page);
            }
        }

        debug!(
            "buffer pool up: {num_slots} slots of {page_size} bytes, {num_partitions} partitions, \
             {} NUMA nodes, prefetch degree {}",
            arena.num_nodes(),
            config.prefetching_degree
        );

        Ok(BufferPool {
            shared: Arc::new(PoolShared {
                storage,
                config,
                page_size,
                num_slots,
                num_partitions,
                arena,
                descriptors,
                partitions: partitions.into_iter().map(Mutex::new).collect(),
                alloc_table: Mutex::new(alloc_table),
                next_victim: AtomicU64::new(0),
                next_worker: AtomicUsize::new(0),
                counters: PoolCounters::default(),
                open: AtomicBool::new(true),
            }),
        })
    }

    /// Allocates a new page and pins it. The slot contents are whatever the
    /// slot last held; the on-disk page is zero until first written back.
    pub fn alloc(&self) -> Result<BufferHandler> {
        self.shared.alloc()
    }

    /// Frees a page: flushes it if dirty and resident, drops its residency,
    /// clears its allocation bit and returns it to the free list.
    /// Releasing an unallocated or protected page is a caller bug.
    pub fn release(&self, page_id: PageId) -> Result<()> {
        self.shared.release(page_id)
    }

    /// Pins `page_id`, loading it from disk if not resident.
    ///
    /// `prefetch` marks the caller as the real consumer: the pin then counts
    /// (reference and usage are bumped) and, with a non-zero prefetching
    /// degree, the following pages are scheduled for background loading.
    /// The prefetcher itself pins with `prefetch = false`, which populates
    /// the slot without retaining a reference, so prefetched pages never
    /// block eviction.
    pub fn pin(&self, page_id: PageId, prefetch: bool) -> Result<BufferHandler> {
        let handler = self.shared.pin_page(page_id, prefetch)?;
        if prefetch && self.shared.config.prefetching_degree > 0 {
            PoolShared::dispatch_prefetch(&self.shared, page_id);
        }
        Ok(handler)
    }

    /// Drops one pin of the page behind `handler`.
    pub fn unpin(&self, handler: &BufferHandler) -> Result<()> {
        self.shared.unpin(handler)
    }

    /// Marks a resident page dirty so eviction and checkpoints write it
    /// back.
    pub fn set_page_dirty(&self, page_id: PageId) -> Result<()> {
        self.shared.set_page_dirty(page_id)
    }

    /// Writes every dirty slot and the allocation bitmap durably to disk.
    pub fn checkpoint(&self) -> Result<()> {
        self.shared.flush_dirty_buffers()?;
        self.shared.store_allocation_table()?;
        self.shared.storage.sync()
    }

    pub fn get_statistics(&self) -> Result<BufferPoolStatistics> {
        self.shared.get_statistics()
    }

    /// Cache effectiveness counters: `(hits, misses, evictions)`.
    pub fn cache_counters(&self) -> (u64, u64, u64) {
        let c = &self.shared.counters;
        (
            c.hits.load(Ordering::Relaxed),
            c.misses.load(Ordering::Relaxed),
            c.evictions.load(Ordering::Relaxed),
        )
    }

    /// Verifies the invariants between bitmap, free lists, residency
    /// tables and descriptors. Intended for tests and debugging.
    pub fn check_consistency(&self) -> Result<()> {
        self.shared.check_consistency()
    }

    /// Flushes everything and closes the storage. Requires quiescence: no
    /// outstanding pins, no in-flight tasks touching this pool.
    pub fn close(&mut self) -> Result<()> {
        if !self.shared.open.swap(false, Ordering::AcqRel) {
            return Err(StoreError::StorageNotOpen);
        }
        self.shared.flush_dirty_buffers()?;
        self.shared.store_allocation_table()?;
        self.shared.storage.close()?;
        debug!("buffer pool closed");
        Ok(())
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if self.shared.open.load(Ordering::Acquire) {
            if let Err(e) = self.close() {
                warn!("buffer pool dropped without a clean close: {e}");
            }
        }
    }
}

impl PoolShared {
    fn make_handler(&self, page_id: PageId, slot: BufferId) -> BufferHandler {
        BufferHandler::new(self.arena.slot_ptr(slot), self.page_size, page_id, slot)
    }

    fn alloc(&self) -> Result<BufferHandler> {
        // Phase 1: pick a free page under every partition lock (ascending
        // index; the only multi-partition locking site) and mark it
        // allocated.
        let page_id = {
            let mut parts: Vec<MutexGuard<'_, Partition>> =
                self.partitions.iter().map(|p| p.lock()).collect();
            let chosen = match parts.iter().position(|p| !p.free_pages.is_empty()) {
                Some(idx) => idx,
                None => {
                    let first = self.reserve_pages(1, &mut parts)?;
                    partition_of_page(first, self.num_partitions) as usize
                }
            };
            let page_id = parts[chosen]
                .free_pages
                .pop_front()
                .expect("chosen partition lost its free page while locked");
            self.alloc_table.lock().set(page_id, true);
            page_id
        };

        // Phase 2: find a slot in the page's own partition and publish the
        // residency.
        let partition_idx = partition_of_page(page_id, self.num_partitions);
        let mut partition = self.partitions[partition_idx as usize].lock();
        let (slot, mut state) = match self.get_empty_slot(partition_idx, &mut partition) {
            Ok(found) => found,
            Err(e) => {
                // Undo phase 1 so bitmap and free lists stay consistent.
                partition.free_pages.push_front(page_id);
                self.alloc_table.lock().set(page_id, false);
                return Err(e);
            }
        };
        partition.page_table.insert(page_id, slot);
        drop(partition);

        state.page_id = page_id;
        state.reference_count = 1;
        state.usage_count = 1;
        state.dirty = false;
        drop(state);

        Ok(self.make_handler(page_id, slot))
    }

    /// Reserves storage pages until `count` usable (non-protected) ones
    /// exist, appending them to their partitions' free lists. Returns the
    /// first usable page. Caller holds every partition lock.
    fn reserve_pages(
        &self,
        count: u32,
        parts: &mut [MutexGuard<'_, Partition>],
    ) -> Result<PageId> {
        let mut table = self.alloc_table.lock();
        let mut first_usable = None;
        let mut usable = 0;
        while usable < count {
            let page = self.storage.reserve(1)?;
            table.push_unallocated();
            debug_assert_eq!(table.len(), self.storage.size());
            if table.is_protected(page) {
                // The bitmap claims this index for itself; reserve a
                // replacement and keep the protected page off every list.
                continue;
            }
            if first_usable.is_none() {
                first_usable = Some(page);
            }
            parts[partition_of_page(page, self.num_partitions) as usize]
                .free_pages
                .push_back(page);
            usable += 1;
        }
        Ok(first_usable.expect("reserve_pages with count == 0"))
    }

    /// Hands out an empty slot of `partition_idx` with its content lock
    /// already held: first from the free list, otherwise by clock sweep.
    ///
    /// The sweep walks the global cursor, considering only this partition's
    /// slots: pinned slots are skipped, a positive usage count is the
    /// second chance and gets decremented, and a victim with both counts at
    /// zero is written back when dirty and recycled. A whole cycle without
    /// one unpinned candidate means every slot is pinned.
    fn get_empty_slot<'a>(
        &'a self,
        partition_idx: u32,
        partition: &mut Partition,
    ) -> Result<(BufferId, RwLockWriteGuard<'a, FrameState>)> {
        if let Some(slot) = partition.free_buffers.pop_front() {
            let mut state = self.descriptors[slot as usize].state.write();
            debug_assert!(!state.in_use);
            state.in_use = true;
            return Ok((slot, state));
        }

        if self.num_slots == 0 {
            return Err(StoreError::OutOfMemory);
        }
        let num_slots = self.num_slots as u64;
        let mut probes = 0;
        let mut saw_unpinned = false;
        loop {
            let victim = (self.next_victim.fetch_add(1, Ordering::Relaxed) % num_slots) as BufferId;
            if partition_of_slot(victim, self.num_partitions) == partition_idx {
                let mut state = self.descriptors[victim as usize].state.write();
                // Slots outside `in_use` sit on a free list (or are mid
                // rollback); they are not the sweep's business.
                if state.in_use && state.reference_count == 0 {
                    saw_unpinned = true;
                    if state.usage_count == 0 {
                        debug_assert_eq!(
                            partition_of_page(state.page_id, self.num_partitions),
                            partition_idx
                        );
                        if state.dirty {
                            // SAFETY: content lock held exclusively.
                            let bytes = unsafe { self.arena.slot_bytes(victim) };
                            self.storage.write(state.page_id, bytes)?;
                            state.dirty = false;
                        }
                        partition.page_table.remove(&state.page_id);
                        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                        state.reset();
                        state.in_use = true;
                        return Ok((victim, state));
                    }
                    state.usage_count -= 1;
                }
            }
            probes += 1;
            if probes >= num_slots {
                // Cursor came full circle.
                if !saw_unpinned {
                    return Err(StoreError::OutOfMemory);
                }
                probes = 0;
                saw_unpinned = false;
            }
        }
    }

    fn pin_page(&self, page_id: PageId, touch: bool) -> Result<BufferHandler> {
        assert!(
            page_id < self.storage.size(),
            "pin of page {page_id}, which was never reserved"
        );
        assert!(
            !is_protected(page_id, self.page_size),
            "pin of protected page {page_id}"
        );

        let partition_idx = partition_of_page(page_id, self.num_partitions);
        loop {
            let mut partition = self.partitions[partition_idx as usize].lock();
            if let Some(&slot) = partition.page_table.get(&page_id) {
                drop(partition);
                let mut state = self.descriptors[slot as usize].state.write();
                if !state.in_use || state.page_id != page_id {
                    // Evicted between the lookup and the content lock; go
                    // again.
                    continue;
                }
                if touch {
                    state.reference_count += 1;
                    state.usage_count += 1;
                }
                state.page_id = page_id;
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(self.make_handler(page_id, slot));
            }

            // Miss: take a slot, publish the residency, then read the page
            // body while still holding the slot's content lock from the
            // sweep, so nobody observes the slot before the read finished.
            let (slot, mut state) = self.get_empty_slot(partition_idx, &mut partition)?;
            partition.page_table.insert(page_id, slot);
            drop(partition);

            // SAFETY: content lock held exclusively.
            let buffer = unsafe { self.arena.slot_bytes_mut(slot) };
            if let Err(e) = self.storage.read(page_id, buffer) {
                // Unpublish. Vacating the slot first keeps the lock order
                // intact: the sweep ignores slots outside `in_use`, and
                // concurrent pins of this page spin in the retry loop above
                // until the residency entry is gone.
                state.reset();
                drop(state);
                let mut partition = self.partitions[partition_idx as usize].lock();
                partition.page_table.remove(&page_id);
                partition.free_buffers.push_back(slot);
                return Err(e);
            }

            state.page_id = page_id;
            state.reference_count = u32::from(touch);
            state.usage_count = u32::from(touch);
            state.dirty = false;
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(self.make_handler(page_id, slot));
        }
    }

    fn unpin(&self, handler: &BufferHandler) -> Result<()> {
        let mut state = self.descriptors[handler.buffer_id() as usize].state.write();
        assert!(
            state.in_use && state.page_id == handler.page_id(),
            "unpin of page {} which is not resident in slot {}",
            handler.page_id(),
            handler.buffer_id()
        );
        assert!(
            state.reference_count > 0,
            "unpin of page {} without a matching pin",
            handler.page_id()
        );
        state.reference_count -= 1;
        Ok(())
    }

    fn set_page_dirty(&self, page_id: PageId) -> Result<()> {
        let partition_idx = partition_of_page(page_id, self.num_partitions);
        let partition = self.partitions[partition_idx as usize].lock();
        let slot = match partition.page_table.get(&page_id) {
            Some(&slot) => slot,
            None => panic!("set_page_dirty of page {page_id}, which is not resident"),
        };
        drop(partition);

        let mut state = self.descriptors[slot as usize].state.write();
        // The caller holds a pin, so the slot cannot have changed hands.
        assert!(
            state.in_use && state.page_id == page_id,
            "set_page_dirty raced with an eviction of page {page_id}; missing pin?"
        );
        state.dirty = true;
        Ok(())
    }

    fn release(&self, page_id: PageId) -> Result<()> {
        assert!(
            page_id < self.storage.size(),
            "release of page {page_id}, which was never reserved"
        );
        assert!(
            !is_protected(page_id, self.page_size),
            "release of protected page {page_id}"
        );

        let partition_idx = partition_of_page(page_id, self.num_partitions);
        let mut partition = self.partitions[partition_idx as usize].lock();
        assert!(
            self.alloc_table.lock().is_allocated(page_id),
            "release of page {page_id}, which is not allocated"
        );

        // Evict the resident copy first, flushing it if dirty.
        if let Some(&slot) = partition.page_table.get(&page_id) {
            let mut state = self.descriptors[slot as usize].state.write();
            debug_assert!(state.in_use && state.page_id == page_id);
            if state.dirty {
                // SAFETY: content lock held exclusively.
                let bytes = unsafe { self.arena.slot_bytes(slot) };
                self.storage.write(page_id, bytes)?;
            }
            state.reset();
            drop(state);
            partition.page_table.remove(&page_id);
            partition.free_buffers.push_back(slot);
        }

        self.alloc_table.lock().set(page_id, false);
        partition.free_pages.push_back(page_id);
        Ok(())
    }

    fn flush_dirty_buffers(&self) -> Result<()> {
        for slot in 0..self.num_slots {
            let mut state = self.descriptors[slot as usize].state.write();
            if state.in_use && state.dirty {
                // SAFETY: content lock held exclusively.
                let bytes = unsafe { self.arena.slot_bytes(slot) };
                self.storage.write(state.page_id, bytes)?;
                state.dirty = false;
            }
        }
        Ok(())
    }

    fn store_allocation_table(&self) -> Result<()> {
        // All partition locks pin the bitmap contents in place while it is
        // written out.
        let _parts: Vec<MutexGuard<'_, Partition>> =
            self.partitions.iter().map(|p| p.lock()).collect();
        self.alloc_table.lock().store(&self.storage)
    }

    fn get_statistics(&self) -> Result<BufferPoolStatistics> {
        // Taking and releasing every partition lock is a barrier against
        // in-flight multi-structure updates.
        drop(
            self.partitions
                .iter()
                .map(|p| p.lock())
                .collect::<Vec<_>>(),
        );
        let mut resident = 0;
        for descriptor in &self.descriptors {
            if descriptor.state.read().in_use {
                resident += 1;
            }
        }
        Ok(BufferPoolStatistics {
            num_allocated_pages: resident,
            num_reserved_pages: self.storage.size(),
            page_size: self.page_size as u64,
        })
    }

    fn check_consistency(&self) -> Result<()> {
        let parts: Vec<MutexGuard<'_, Partition>> =
            self.partitions.iter().map(|p| p.lock()).collect();
        let table = self.alloc_table.lock();

        for page in 0..table.len() {
            let protected = table.is_protected(page);
            let in_free_list = parts.iter().any(|p| p.free_pages.contains(&page));
            let mapped = parts
                .iter()
                .find_map(|p| p.page_table.get(&page).copied());

            if table.is_allocated(page) {
                if in_free_list {
                    return Err(if protected {
                        StoreError::ProtectedPageInFreeList(page)
                    } else {
                        StoreError::AllocatedPageInFreeList(page)
                    });
                }
                if let Some(slot) = mapped {
                    let state = self.descriptors[slot as usize].state.read();
                    if !state.in_use || state.page_id != page {
                        return Err(StoreError::BufferDescriptorIncorrectData {
                            page,
                            buffer: slot,
                        });
                    }
                }
            } else {
                if protected {
                    if in_free_list {
                        return Err(StoreError::ProtectedPageInFreeList(page));
                    }
                } else if !in_free_list {
                    return Err(StoreError::FreePageNotInFreeList(page));
                }
                if mapped.is_some() {
                    return Err(StoreError::FreePageMappedToBuffer(page));
                }
            }
        }

        // Slot-side invariants: resident slots map back to themselves in
        // their own partition, vacant slots sit on their free list with no
        // references.
        for slot in 0..self.num_slots {
            let state = self.descriptors[slot as usize].state.read();
            if state.in_use {
                let home = &parts[partition_of_page(state.page_id, self.num_partitions) as usize];
                if home.page_table.get(&state.page_id) != Some(&slot) {
                    return Err(StoreError::BufferDescriptorIncorrectData {
                        page: state.page_id,
                        buffer: slot,
                    });
                }
            } else {
                let home = &parts[partition_of_slot(slot, self.num_partitions) as usize];
                if state.reference_count != 0 || !home.free_buffers.contains(&slot) {
                    return Err(StoreError::BufferDescriptorIncorrectData {
                        page: state.page_id,
                        buffer: slot,
                    });
                }
            }
        }
        Ok(())
    }

    /// Queues a background task that walks the pages after `origin` and
    /// pins each with `prefetch = false`. Workers are picked round-robin.
    fn dispatch_prefetch(shared: &Arc<PoolShared>, origin: PageId) {
        let workers = tasking::num_threads();
        if workers == 0 {
            // Validated at open, but the runtime may have stopped since.
            return;
        }
        let worker = (shared.next_worker.fetch_add(1, Ordering::Relaxed) % workers) as u32;
        let pool = Arc::clone(shared);
        let degree = shared.config.prefetching_degree as u64;
        tasking::execute_task_async(
            worker,
            Task::new(move || pool.prefetch_range(origin, degree)),
            None,
        );
    }

    fn prefetch_range(&self, origin: PageId, degree: u64) {
        let size = self.storage.size();
        for offset in 1..=degree {
            let page = origin + offset;
            if page >= size {
                break;
            }
            if is_protected(page, self.page_size) {
                continue;
            }
            if !self.alloc_table.lock().is_allocated(page) {
                continue;
            }
            match self.pin_page(page, false) {
                Ok(_) => {}
                Err(StoreError::OutOfMemory) => break,
                Err(e) => {
                    debug!("prefetch of page {page} failed: {e}");
                    break;
                }
            }
        }
    }
}

fn validate_config(config: &BufferPoolConfig, page_size_kb: u32) -> Result<()> {
    if page_size_kb == 0
        || config.pool_size_kb == 0
        || config.pool_size_kb % page_size_kb != 0
    {
        return Err(StoreError::PoolSizeNotMultipleOfPageSize {
            pool_size_kb: config.pool_size_kb,
            page_size_kb,
        });
    }
    let slots = config.pool_size_kb / page_size_kb;
    if config.num_partitions == 0 || slots % config.num_partitions != 0 {
        return Err(StoreError::InvalidPartitionCount {
            partitions: config.num_partitions,
            slots,
        });
    }
    if config.prefetching_degree > 0 && tasking::num_threads() == 0 {
        return Err(StoreError::NoThreadsForPrefetching);
    }
    Ok(())
}
