use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use super::{initial_usage, is_unused, is_visible, mark_delete, mark_insert, StorageAlloc, MAX_STUBS};
use crate::error::{EngineError, Result};
use crate::memory::MemoryManager;
use crate::tuple::{read_u32, write_u32, PageId, TupleHandle, PAGE_SIZE};

const META_LEN: usize = 16; // usage(4) + next(4) + prev(4) + refcount(4)
const NIL: u32 = u32::MAX;

/// Two-tier storage for one partitioned window plus any number of ordinary
/// relation-style views over the same data (spec §4.3). Grounded on
/// `original_source/dsms/.../stores/pwin_store_impl.{h,cc}`.
///
/// The header tier is `partitions: HashMap<partition key, VecDeque<handle>>`
/// — a per-partition insertion-order FIFO a partition-window operator pops
/// from the front to enforce its per-partition bound. The data tier is the
/// same doubly-linked used/free list as [`super::RelationStore`], addressed
/// through the usual usage bitmap: a tuple evicted from its partition's
/// `VecDeque` by [`Self::delete_oldest_tuple_p`] stays in the global used
/// list — and so remains scannable by any relation-style stub that hasn't
/// deleted it yet — which plays the role of the reference's separate
/// "expired tuple" chain without a second intrusive linked list (see
/// DESIGN.md). The reference's header index over partitioning attributes is
/// likewise folded into the `HashMap`'s own hashing of the partition key
/// bytes rather than a standalone `HEval`/`BEval` index.
pub struct PartitionWindowStore {
    mem: Rc<RefCell<MemoryManager>>,
    data_len: usize,
    tuple_len: usize,
    num_stubs: usize,
    tuples_per_page: usize,
    live_in_page: HashMap<PageId, u32>,
    bump_page: Option<PageId>,
    bump_offset: usize,
    free_head: Option<TupleHandle>,
    used_head: Option<TupleHandle>,
    partitions: HashMap<Vec<u8>, VecDeque<TupleHandle>>,
    partition_key_of: HashMap<TupleHandle, Vec<u8>>,
}

impl PartitionWindowStore {
    pub fn new(mem: Rc<RefCell<MemoryManager>>, data_len: usize, num_stubs: usize) -> Result<Self> {
        if num_stubs > MAX_STUBS {
            return Err(EngineError::PlanViolation(format!(
                "partition window store requested {num_stubs} stubs, max is {MAX_STUBS}"
            )));
        }
        let tuple_len = data_len + META_LEN;
        let tuples_per_page = ((PAGE_SIZE as usize) / tuple_len.max(1)).max(1);
        Ok(Self {
            mem,
            data_len,
            tuple_len,
            num_stubs,
            tuples_per_page,
            live_in_page: HashMap::new(),
            bump_page: None,
            bump_offset: 0,
            free_head: None,
            used_head: None,
            partitions: HashMap::new(),
            partition_key_of: HashMap::new(),
        })
    }

    fn usage_off(&self) -> usize {
        self.data_len
    }
    fn next_off(&self) -> usize {
        self.data_len + 4
    }
    fn prev_off(&self) -> usize {
        self.data_len + 8
    }
    fn refcount_off(&self) -> usize {
        self.data_len + 12
    }

    fn raw(&self, t: TupleHandle) -> Vec<u8> {
        self.mem.borrow().tuple_bytes(t, self.tuple_len).to_vec()
    }

    fn usage(&self, t: TupleHandle) -> u32 {
        read_u32(&self.raw(t), self.usage_off())
    }

    fn set_usage(&mut self, t: TupleHandle, v: u32) {
        let off = self.usage_off();
        write_u32(self.mem.borrow_mut().tuple_bytes_mut(t, self.tuple_len), off, v);
    }

    fn next(&self, t: TupleHandle) -> Option<TupleHandle> {
        let v = read_u32(&self.raw(t), self.next_off());
        (v != NIL).then_some(TupleHandle(v))
    }

    fn set_next(&mut self, t: TupleHandle, v: Option<TupleHandle>) {
        let off = self.next_off();
        let raw = v.map_or(NIL, |h| h.0);
        write_u32(self.mem.borrow_mut().tuple_bytes_mut(t, self.tuple_len), off, raw);
    }

    fn prev(&self, t: TupleHandle) -> Option<TupleHandle> {
        let v = read_u32(&self.raw(t), self.prev_off());
        (v != NIL).then_some(TupleHandle(v))
    }

    fn set_prev(&mut self, t: TupleHandle, v: Option<TupleHandle>) {
        let off = self.prev_off();
        let raw = v.map_or(NIL, |h| h.0);
        write_u32(self.mem.borrow_mut().tuple_bytes_mut(t, self.tuple_len), off, raw);
    }

    fn refcount(&self, t: TupleHandle) -> u32 {
        read_u32(&self.raw(t), self.refcount_off())
    }

    fn set_refcount(&mut self, t: TupleHandle, v: u32) {
        let off = self.refcount_off();
        write_u32(self.mem.borrow_mut().tuple_bytes_mut(t, self.tuple_len), off, v);
    }

    fn unlink_used(&mut self, t: TupleHandle) {
        let (p, n) = (self.prev(t), self.next(t));
        match p {
            Some(p) => self.set_next(p, n),
            None => self.used_head = n,
        }
        if let Some(n) = n {
            self.set_prev(n, p);
        }
    }

    fn push_used_front(&mut self, t: TupleHandle) {
        self.set_prev(t, None);
        self.set_next(t, self.used_head);
        if let Some(h) = self.used_head {
            self.set_prev(h, Some(t));
        }
        self.used_head = Some(t);
    }

    fn release_page_share(&mut self, page: PageId) {
        let live = self.live_in_page.entry(page).or_insert(0);
        *live -= 1;
        if *live == 0 {
            self.live_in_page.remove(&page);
            self.mem.borrow_mut().decr_ref(page);
        }
    }

    fn maybe_reclaim(&mut self, t: TupleHandle) {
        if is_unused(self.usage(t)) && self.refcount(t) == 0 {
            self.unlink_used(t);
            self.set_next(t, self.free_head);
            self.free_head = Some(t);
            self.release_page_share(t.page());
        }
    }

    /// Appends `t` to partition `key`'s FIFO and marks it inserted for
    /// `stub` (spec §4.3's `insertTuple_p`).
    pub fn insert_tuple_p(&mut self, t: TupleHandle, key: &[u8], stub: usize) {
        let mut u = self.usage(t);
        mark_insert(&mut u, stub);
        self.set_usage(t, u);
        self.partitions.entry(key.to_vec()).or_default().push_back(t);
        self.partition_key_of.insert(t, key.to_vec());
    }

    /// Pops and returns partition `key`'s oldest tuple, marking it deleted
    /// for `stub` (spec §4.3's `deleteOldestTuple_p`; typically the
    /// partition-window operator's own stub).
    pub fn delete_oldest_tuple_p(&mut self, key: &[u8], stub: usize) -> Result<TupleHandle> {
        let t = self
            .partitions
            .get_mut(key)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| EngineError::PlanViolation("deleteOldestTuple_p on an empty or unknown partition".into()))?;
        if self.partitions.get(key).is_some_and(VecDeque::is_empty) {
            self.partitions.remove(key);
        }
        self.partition_key_of.remove(&t);
        let mut u = self.usage(t);
        mark_delete(&mut u, stub);
        self.set_usage(t, u);
        self.maybe_reclaim(t);
        Ok(t)
    }

    /// Current number of tuples live in partition `key` (spec §4.3's
    /// `getPartnSize_p`).
    pub fn get_partn_size_p(&self, key: &[u8]) -> u32 {
        self.partitions.get(key).map_or(0, |q| q.len() as u32)
    }

    pub fn insert_tuple_r(&mut self, t: TupleHandle, stub: usize) {
        let mut u = self.usage(t);
        mark_insert(&mut u, stub);
        self.set_usage(t, u);
    }

    pub fn delete_tuple_r(&mut self, t: TupleHandle, stub: usize) {
        let mut u = self.usage(t);
        mark_delete(&mut u, stub);
        self.set_usage(t, u);
        self.maybe_reclaim(t);
    }

    pub fn get_scan_r(&self, stub: usize) -> Vec<TupleHandle> {
        let mut out = Vec::new();
        let mut cur = self.used_head;
        while let Some(t) = cur {
            if is_visible(self.usage(t), stub) {
                out.push(t);
            }
            cur = self.next(t);
        }
        out
    }

    pub fn release_scan_r(&self, _scan: Vec<TupleHandle>) {}

    pub fn is_visible(&self, t: TupleHandle, stub: usize) -> bool {
        is_visible(self.usage(t), stub)
    }
}

impl StorageAlloc for PartitionWindowStore {
    fn new_tuple(&mut self) -> Result<TupleHandle> {
        let t = if let Some(h) = self.free_head {
            self.free_head = self.next(h);
            h
        } else {
            if self.bump_page.is_none() || self.bump_offset == self.tuples_per_page {
                let page = self.mem.borrow_mut().allocate_page()?;
                self.mem.borrow_mut().add_ref(page, 1);
                self.bump_page = Some(page);
                self.bump_offset = 0;
            }
            let page = self.bump_page.unwrap();
            let offset = self.bump_offset * self.tuple_len;
            self.bump_offset += 1;
            TupleHandle(page.0 * PAGE_SIZE + offset as u32)
        };
        *self.live_in_page.entry(t.page()).or_insert(0) += 1;
        self.set_usage(t, initial_usage(self.num_stubs));
        self.set_refcount(t, 0);
        self.push_used_front(t);
        Ok(t)
    }

    fn add_ref(&mut self, t: TupleHandle) {
        let rc = self.refcount(t) + 1;
        self.set_refcount(t, rc);
    }

    fn add_ref_n(&mut self, t: TupleHandle, n: u32) {
        let rc = self.refcount(t) + n;
        self.set_refcount(t, rc);
    }

    fn decr_ref(&mut self, t: TupleHandle) {
        let rc = self.refcount(t).saturating_sub(1);
        self.set_refcount(t, rc);
        self.maybe_reclaim(t);
    }

    fn tuple_len(&self) -> usize {
        self.data_len
    }

    fn read_tuple(&self, t: TupleHandle) -> Vec<u8> {
        self.mem.borrow().tuple_bytes(t, self.data_len).to_vec()
    }

    fn write_tuple(&mut self, t: TupleHandle, bytes: &[u8]) {
        self.mem
            .borrow_mut()
            .tuple_bytes_mut(t, self.data_len)
            .copy_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(num_stubs: usize) -> PartitionWindowStore {
        let mem = Rc::new(RefCell::new(MemoryManager::new(4 * PAGE_SIZE as usize)));
        PartitionWindowStore::new(mem, 4, num_stubs).unwrap()
    }

    #[test]
    fn fifo_eviction_within_a_partition() {
        let mut s = store(1);
        let a = s.new_tuple().unwrap();
        s.insert_tuple_p(a, b"p1", 0);
        let b = s.new_tuple().unwrap();
        s.insert_tuple_p(b, b"p1", 0);
        assert_eq!(s.get_partn_size_p(b"p1"), 2);
        assert_eq!(s.delete_oldest_tuple_p(b"p1", 0).unwrap(), a);
        assert_eq!(s.get_partn_size_p(b"p1"), 1);
    }

    #[test]
    fn partitions_are_independent() {
        let mut s = store(1);
        let a = s.new_tuple().unwrap();
        s.insert_tuple_p(a, b"p1", 0);
        let b = s.new_tuple().unwrap();
        s.insert_tuple_p(b, b"p2", 0);
        assert_eq!(s.get_partn_size_p(b"p1"), 1);
        assert_eq!(s.get_partn_size_p(b"p2"), 1);
        assert!(s.delete_oldest_tuple_p(b"p1", 0).is_ok());
        assert_eq!(s.get_partn_size_p(b"p2"), 1);
    }

    #[test]
    fn tuple_evicted_from_partition_stays_visible_to_other_stub() {
        let mut s = store(2);
        let a = s.new_tuple().unwrap();
        s.insert_tuple_p(a, b"p1", 0);
        s.insert_tuple_r(a, 1);
        s.delete_oldest_tuple_p(b"p1", 0).unwrap();
        assert!(s.is_visible(a, 1));
        assert_eq!(s.get_scan_r(1), vec![a]);
        s.delete_tuple_r(a, 1);
        assert!(!s.is_visible(a, 1));
    }

    #[test]
    fn empty_partition_errors_on_eviction() {
        let mut s = store(1);
        assert!(s.delete_oldest_tuple_p(b"missing", 0).is_err());
    }
}
