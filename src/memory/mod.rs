//! Page-based memory manager (spec §4.1). Owns one contiguous byte region,
//! carved into fixed [`PAGE_SIZE`] pages, with a free-page list and a
//! per-page refcount. Every store, queue, and index draws its pages from a
//! shared `MemoryManager` instance.

use std::collections::VecDeque;

use tracing::warn;

use crate::error::{EngineError, Result};
use crate::tuple::{PageId, TupleHandle, PAGE_SIZE};

pub struct MemoryManager {
    region: Vec<u8>,
    num_pages: u32,
    free_list: VecDeque<PageId>,
    refcounts: Vec<u32>,
}

impl MemoryManager {
    pub fn new(memory_bytes: usize) -> Self {
        let num_pages = (memory_bytes / PAGE_SIZE as usize).max(1) as u32;
        let region = vec![0u8; num_pages as usize * PAGE_SIZE as usize];
        let free_list = (0..num_pages).map(PageId).collect();
        Self {
            region,
            num_pages,
            free_list,
            refcounts: vec![0; num_pages as usize],
        }
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    pub fn free_page_count(&self) -> usize {
        self.free_list.len()
    }

    /// Unlinks the head of the free list. Fails with `OutOfMemory` when empty.
    pub fn allocate_page(&mut self) -> Result<PageId> {
        let page = self.free_list.pop_front().ok_or_else(|| {
            warn!(num_pages = self.num_pages, "memory manager exhausted: no free pages remain");
            EngineError::OutOfMemory("no free pages remain".into())
        })?;
        self.refcounts[page.0 as usize] = 0;
        let start = page.0 as usize * PAGE_SIZE as usize;
        self.region[start..start + PAGE_SIZE as usize].fill(0);
        Ok(page)
    }

    /// Pushes a page back onto the free list unconditionally. Callers
    /// normally reach this indirectly via [`Self::decr_ref`] returning
    /// `true`; this is exposed for stores that manage their own refcounts
    /// and need to release a page without going through the generic path.
    pub fn deallocate_page(&mut self, page: PageId) {
        self.refcounts[page.0 as usize] = 0;
        self.free_list.push_back(page);
    }

    pub fn add_ref(&mut self, page: PageId, n: u32) {
        self.refcounts[page.0 as usize] += n;
    }

    /// Returns `true` if the refcount reached zero and the page was
    /// reclaimed onto the free list.
    pub fn decr_ref(&mut self, page: PageId) -> bool {
        let rc = &mut self.refcounts[page.0 as usize];
        debug_assert!(*rc > 0, "decr_ref on a page with zero refcount");
        *rc = rc.saturating_sub(1);
        if *rc == 0 {
            self.free_list.push_back(page);
            true
        } else {
            false
        }
    }

    pub fn refcount(&self, page: PageId) -> u32 {
        self.refcounts[page.0 as usize]
    }

    /// Computes the owning page from any tuple handle (spec §4.1).
    pub fn page_of(&self, handle: TupleHandle) -> PageId {
        handle.page()
    }

    /// Computes the dense 32-bit id used by lineage stores (spec §4.1).
    pub fn id_of(&self, handle: TupleHandle) -> u32 {
        handle.dense_id()
    }

    pub fn page_slice(&self, page: PageId) -> &[u8] {
        let start = page.0 as usize * PAGE_SIZE as usize;
        &self.region[start..start + PAGE_SIZE as usize]
    }

    pub fn page_slice_mut(&mut self, page: PageId) -> &mut [u8] {
        let start = page.0 as usize * PAGE_SIZE as usize;
        &mut self.region[start..start + PAGE_SIZE as usize]
    }

    pub fn tuple_bytes(&self, handle: TupleHandle, len: usize) -> &[u8] {
        let off = handle.offset_in_page() as usize;
        &self.page_slice(handle.page())[off..off + len]
    }

    pub fn tuple_bytes_mut(&mut self, handle: TupleHandle, len: usize) -> &mut [u8] {
        let off = handle.offset_in_page() as usize;
        &mut self.page_slice_mut(handle.page())[off..off + len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_exhausts_then_fails() {
        let mut mm = MemoryManager::new(2 * PAGE_SIZE as usize);
        assert_eq!(mm.num_pages(), 2);
        let p0 = mm.allocate_page().unwrap();
        let _p1 = mm.allocate_page().unwrap();
        assert!(mm.allocate_page().is_err());
        mm.deallocate_page(p0);
        assert_eq!(mm.free_page_count(), 1);
        assert!(mm.allocate_page().is_ok());
    }

    #[test]
    fn refcount_reaches_zero_reclaims_page() {
        let mut mm = MemoryManager::new(PAGE_SIZE as usize);
        let p = mm.allocate_page().unwrap();
        mm.add_ref(p, 2);
        assert!(!mm.decr_ref(p));
        assert!(mm.decr_ref(p));
        assert_eq!(mm.free_page_count(), 1);
    }

    #[test]
    fn tuple_bytes_roundtrip_across_page_boundary() {
        let mut mm = MemoryManager::new(2 * PAGE_SIZE as usize);
        let p1 = mm.allocate_page().unwrap();
        assert_eq!(p1, PageId(0));
        let handle = TupleHandle(PAGE_SIZE + 10);
        mm.tuple_bytes_mut(handle, 4).copy_from_slice(&42i32.to_le_bytes());
        assert_eq!(
            i32::from_le_bytes(mm.tuple_bytes(handle, 4).try_into().unwrap()),
            42
        );
    }
}
