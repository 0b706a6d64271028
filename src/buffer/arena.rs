// Pool arena.
//
// The backing memory for every buffer slot. Slots are grouped by NUMA node:
// slot `s` of a pool with `P` partitions lives on node `(s % P) % num_nodes`,
// and each node gets one contiguous anonymous mapping, so a partition-bound
// worker touches memory local to its node. Without NUMA (or with
// `numa_aware` off) there is a single mapping.

use std::ptr::NonNull;

#[cfg(target_os = "linux")]
use log::warn;

use crate::common::BufferId;
use crate::error::{Result, StoreError};

pub struct PoolArena {
    segments: Vec<Segment>,
    slot_ptrs: Vec<NonNull<u8>>,
    page_size: usize,
}

// SAFETY: the arena itself is immutable after construction; the bytes behind
// the slot pointers are only touched through `slot_bytes{,_mut}`, whose
// exclusivity is guaranteed by the caller (the pool's per-slot content
// locks).
unsafe impl Send for PoolArena {}
unsafe impl Sync for PoolArena {}

impl PoolArena {
    pub fn new(
        num_slots: u32,
        page_size: usize,
        num_partitions: u32,
        numa_aware: bool,
    ) -> Result<PoolArena> {
        assert!(num_partitions > 0, "arena needs at least one partition");
        let num_nodes = if numa_aware {
            detect_numa_nodes().ok_or(StoreError::NumaUnsupported)?
        } else {
            1
        };

        let mut slots_per_node = vec![0usize; num_nodes];
        for slot in 0..num_slots {
            slots_per_node[node_of_slot(slot, num_partitions, num_nodes)] += 1;
        }

        let mut segments = Vec::with_capacity(num_nodes);
        for (node, &count) in slots_per_node.iter().enumerate() {
            let segment = Segment::map(count.max(1) * page_size)?;
            #[cfg(target_os = "linux")]
            if numa_aware && num_nodes > 1 {
                bind_to_node(segment.ptr.as_ptr(), segment.len, node);
            }
            #[cfg(not(target_os = "linux"))]
            let _ = node;
            segments.push(segment);
        }

        // Lay the slots out per node in ascending slot order.
        let mut offsets = vec![0usize; num_nodes];
        let mut slot_ptrs = Vec::with_capacity(num_slots as usize);
        for slot in 0..num_slots {
            let node = node_of_slot(slot, num_partitions, num_nodes);
            // SAFETY: offsets stay within the segment, sized above.
            let ptr = unsafe { segments[node].ptr.as_ptr().add(offsets[node]) };
            offsets[node] += page_size;
            slot_ptrs.push(NonNull::new(ptr).expect("arena pointer is null"));
        }

        Ok(PoolArena {
            segments,
            slot_ptrs,
            page_size,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    pub fn slot_ptr(&self, slot: BufferId) -> *mut u8 {
        self.slot_ptrs[slot as usize].as_ptr()
    }

    /// # Safety
    ///
    /// The caller must hold the slot's content lock (shared or exclusive)
    /// and must not hold a `slot_bytes_mut` slice for the same slot.
    #[inline]
    pub unsafe fn slot_bytes(&self, slot: BufferId) -> &[u8] {
        std::slice::from_raw_parts(self.slot_ptr(slot), self.page_size)
    }

    /// # Safety
    ///
    /// The caller must hold the slot's content lock exclusively.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot_bytes_mut(&self, slot: BufferId) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.slot_ptr(slot), self.page_size)
    }
}

#[inline]
fn node_of_slot(slot: u32, num_partitions: u32, num_nodes: usize) -> usize {
    (slot % num_partitions) as usize % num_nodes
}

struct Segment {
    ptr: NonNull<u8>,
    len: usize,
}

#[cfg(unix)]
impl Segment {
    fn map(len: usize) -> Result<Segment> {
        // SAFETY: a fresh private anonymous mapping, unwound in Drop.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(StoreError::Critical(format!(
                "mmap of {len} byte arena segment failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Segment {
            ptr: NonNull::new(ptr as *mut u8).expect("mmap returned null"),
            len,
        })
    }
}

#[cfg(unix)]
impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` are exactly what mmap handed out.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(not(unix))]
impl Segment {
    fn map(len: usize) -> Result<Segment> {
        let layout = std::alloc::Layout::from_size_align(len, 4096)
            .map_err(|e| StoreError::Critical(format!("bad arena layout: {e}")))?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| StoreError::Critical(format!("allocation of {len} bytes failed")))?;
        Ok(Segment { ptr, len })
    }
}

#[cfg(not(unix))]
impl Drop for Segment {
    fn drop(&mut self) {
        let layout = std::alloc::Layout::from_size_align(self.len, 4096).unwrap();
        // SAFETY: allocated with the identical layout in `map`.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
    }
}

/// Number of NUMA nodes, or `None` when the platform exposes none.
#[cfg(target_os = "linux")]
fn detect_numa_nodes() -> Option<usize> {
    let entries = std::fs::read_dir("/sys/devices/system/node").ok()?;
    let count = entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.strip_prefix("node")
                .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        })
        .count();
    (count > 0).then_some(count)
}

#[cfg(not(target_os = "linux"))]
fn detect_numa_nodes() -> Option<usize> {
    None
}

/// Best-effort `mbind` of a segment onto one node. Placement is a
/// performance hint; failure only costs locality.
#[cfg(target_os = "linux")]
fn bind_to_node(ptr: *mut u8, len: usize, node: usize) {
    if node >= 64 {
        warn!("NUMA node {node} exceeds the supported node mask");
        return;
    }
    let mask: libc::c_ulong = 1 << node;
    // SAFETY: the mask outlives the call; mbind only touches the given range.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            ptr as *mut libc::c_void,
            len,
            libc::MPOL_BIND,
            &mask as *const libc::c_ulong,
            64usize,
            0usize,
        )
    };
    if rc != 0 {
        warn!(
            "mbind of arena segment to node {node} failed: {}",
            std::io::Error::last_os_error()
        );
    }
}
