// Buffer slot descriptors and the client-facing handler.

use parking_lot::RwLock;

use crate::common::{BufferId, PageId};

/// Mutable per-slot state, guarded by the slot's content lock together with
/// the page body itself. Residency (which page maps to which slot) lives in
/// the partition tables, not here.
#[derive(Debug)]
pub(crate) struct FrameState {
    /// Slot currently holds a resident page.
    pub in_use: bool,
    /// Identity of the resident page; only meaningful while `in_use`.
    pub page_id: PageId,
    /// Live pins.
    pub reference_count: u32,
    /// Clock-sweep second-chance counter.
    pub usage_count: u32,
    /// Page body modified since the last write-back.
    pub dirty: bool,
}

impl FrameState {
    fn vacant() -> Self {
        Self {
            in_use: false,
            page_id: 0,
            reference_count: 0,
            usage_count: 0,
            dirty: false,
        }
    }

    /// Returns the slot to its vacant state.
    pub fn reset(&mut self) {
        *self = Self::vacant();
    }
}

/// One descriptor per pool slot, alive for the pool's whole lifetime.
pub(crate) struct BufferDescriptor {
    pub state: RwLock<FrameState>,
}

impl BufferDescriptor {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(FrameState::vacant()),
        }
    }
}

/// Access to a pinned page.
///
/// The handler stays valid while its pin is live: the slot cannot be evicted
/// until the matching `unpin`. Two live pins of the same page see the same
/// bytes; writers coordinate through the pin discipline, exactly as with the
/// raw buffer pointers this type stands in for.
pub struct BufferHandler {
    buffer: *mut u8,
    page_size: usize,
    page_id: PageId,
    buffer_id: BufferId,
}

// SAFETY: the pointer targets the pool arena, which outlives every handler
// obtainable through the public API; moving a handler between threads moves
// the pin with it.
unsafe impl Send for BufferHandler {}

impl BufferHandler {
    pub(crate) fn new(buffer: *mut u8, page_size: usize, page_id: PageId, buffer_id: BufferId) -> Self {
        Self {
            buffer,
            page_size,
            page_id,
            buffer_id,
        }
    }

    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    #[inline]
    pub fn buffer_id(&self) -> BufferId {
        self.buffer_id
    }

    /// The resident page body.
    #[inline]
    pub fn data(&self) -> &[u8] {
        // SAFETY: the pin keeps the slot resident and the arena alive.
        unsafe { std::slice::from_raw_parts(self.buffer, self.page_size) }
    }

    /// The resident page body, writable. Dirty tracking is explicit: call
    /// `BufferPool::set_page_dirty` to make the change survive eviction.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `data`; exclusivity among writers is the caller's
        // pin-discipline contract.
        unsafe { std::slice::from_raw_parts_mut(self.buffer, self.page_size) }
    }
}
