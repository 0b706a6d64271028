// Page allocation bitmap.
//
// One bit per reserved page: set means the page holds user data. The bitmap
// itself is persisted inside the data file on the "protected" pages, whose
// indices are the multiples of `bits_per_page`; a protected page stores the
// bits of the `bits_per_page` pages that follow it (itself included).
// Protected pages are never handed out and never have their bit set.

use bit_vec::BitVec;

use crate::common::PageId;
use crate::error::Result;
use crate::storage::FileStorage;

/// Whether `page_id` is reserved for the on-disk bitmap.
#[inline]
pub fn is_protected(page_id: PageId, page_size: usize) -> bool {
    page_id % (8 * page_size as u64) == 0
}

pub struct AllocationTable {
    bits: BitVec,
    bits_per_page: u64,
    page_size: usize,
}

impl AllocationTable {
    pub fn new(page_size: usize) -> Self {
        Self {
            bits: BitVec::new(),
            bits_per_page: 8 * page_size as u64,
            page_size,
        }
    }

    #[inline]
    pub fn is_protected(&self, page_id: PageId) -> bool {
        page_id % self.bits_per_page == 0
    }

    /// Number of tracked pages.
    pub fn len(&self) -> u64 {
        self.bits.len() as u64
    }

    /// Appends a cleared bit for a freshly reserved page.
    pub fn push_unallocated(&mut self) {
        self.bits.push(false);
    }

    pub fn set(&mut self, page_id: PageId, allocated: bool) {
        assert!(page_id < self.len(), "bitmap has no bit for page {page_id}");
        self.bits.set(page_id as usize, allocated);
    }

    pub fn is_allocated(&self, page_id: PageId) -> bool {
        self.bits.get(page_id as usize).unwrap_or(false)
    }

    /// Pages that are reserved, unallocated and not protected, in ascending
    /// order. These seed the partitioned free-page lists.
    pub fn free_user_pages(&self) -> Vec<PageId> {
        (0..self.len())
            .filter(|&p| !self.is_protected(p) && !self.is_allocated(p))
            .collect()
    }

    /// Rebuilds the bitmap from the protected pages of `storage`. Bits
    /// beyond `storage.size()` are ignored.
    pub fn load(&mut self, storage: &FileStorage) -> Result<()> {
        let num_pages = storage.size();
        self.bits = BitVec::new();
        if num_pages == 0 {
            return Ok(());
        }

        let mut raw = Vec::new();
        let mut buf = vec![0u8; self.page_size];
        let mut page = 0;
        while page < num_pages {
            storage.read(page, &mut buf)?;
            raw.extend_from_slice(&buf);
            page += self.bits_per_page;
        }

        let mut bits = BitVec::from_bytes(&raw);
        bits.truncate(num_pages as usize);
        self.bits = bits;
        Ok(())
    }

    /// Writes the bitmap back to the protected pages of `storage`.
    pub fn store(&self, storage: &FileStorage) -> Result<()> {
        if self.bits.is_empty() {
            return Ok(());
        }
        let mut raw = self.bits.to_bytes();
        let padded = raw.len().div_ceil(self.page_size) * self.page_size;
        raw.resize(padded, 0);
        for (chunk_idx, chunk) in raw.chunks(self.page_size).enumerate() {
            storage.write(chunk_idx as u64 * self.bits_per_page, chunk)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStorageConfig;
    use tempfile::TempDir;

    #[test]
    fn protected_pages_are_bitmap_multiples() {
        let table = AllocationTable::new(4096);
        assert!(table.is_protected(0));
        assert!(!table.is_protected(1));
        assert!(!table.is_protected(32767));
        assert!(table.is_protected(32768));
        assert!(table.is_protected(65536));
    }

    #[test]
    fn free_pages_skip_protected_and_allocated() {
        let mut table = AllocationTable::new(4096);
        for _ in 0..6 {
            table.push_unallocated();
        }
        table.set(2, true);
        table.set(4, true);
        assert_eq!(table.free_user_pages(), vec![1, 3, 5]);
    }

    #[test]
    fn store_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::create(
            dir.path().join("bitmap.db"),
            FileStorageConfig { page_size_kb: 4 },
            false,
        )
        .unwrap();
        storage.reserve(16).unwrap();

        let mut table = AllocationTable::new(storage.page_size());
        for _ in 0..16 {
            table.push_unallocated();
        }
        table.set(1, true);
        table.set(7, true);
        table.set(15, true);
        table.store(&storage).unwrap();

        let mut reloaded = AllocationTable::new(storage.page_size());
        reloaded.load(&storage).unwrap();
        assert_eq!(reloaded.len(), 16);
        for page in 0..16 {
            assert_eq!(reloaded.is_allocated(page), table.is_allocated(page));
        }
        assert_eq!(reloaded.free_user_pages(), table.free_user_pages());
    }
}
