use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::{initial_usage, is_unused, is_visible, mark_delete, mark_insert, StorageAlloc, MAX_STUBS};
use crate::error::{EngineError, Result};
use crate::memory::MemoryManager;
use crate::tuple::{read_int, read_u32, write_int, write_u32, PageId, TupleHandle, PAGE_SIZE};

/// Maximum lineage columns a single store tracks (spec §4.3; the reference's
/// `LinStoreImpl::MAX_LINEAGE`).
pub const MAX_LINEAGE: usize = 2;

const META_LEN: usize = 24; // usage(4) + next(4) + prev(4) + refcount(4) + lin0(4) + lin1(4)
const NIL: u32 = u32::MAX;
const NO_LINEAGE: i32 = i32::MIN;

/// A [`super::RelationStore`]-shaped slot allocator that additionally records
/// up to [`MAX_LINEAGE`] producer ids per tuple and offers reverse lookup by
/// that lineage (spec §4.3, §9: "producer ids, not pointers"). Grounded on
/// `original_source/dsms/.../stores/lin_store_impl.{h,cc}`.
///
/// The reference keeps a `Index *linIndex` (a full hash index) for the
/// reverse lookup; since lineage keys here are small fixed tuples of
/// integers rather than arbitrary tuple byte ranges, a plain `HashMap` gives
/// the same O(1) lookup without routing through `HEval`/`BEval` for a
/// same-process hash of two integers (see DESIGN.md).
pub struct LineageStore {
    mem: Rc<RefCell<MemoryManager>>,
    data_len: usize,
    tuple_len: usize,
    num_stubs: usize,
    num_lineage: usize,
    tuples_per_page: usize,
    live_in_page: HashMap<PageId, u32>,
    bump_page: Option<PageId>,
    bump_offset: usize,
    free_head: Option<TupleHandle>,
    used_head: Option<TupleHandle>,
    lineage_index: HashMap<(i32, i32), TupleHandle>,
}

impl LineageStore {
    pub fn new(mem: Rc<RefCell<MemoryManager>>, data_len: usize, num_stubs: usize, num_lineage: usize) -> Result<Self> {
        if num_stubs > MAX_STUBS {
            return Err(EngineError::PlanViolation(format!(
                "lineage store requested {num_stubs} stubs, max is {MAX_STUBS}"
            )));
        }
        if num_lineage > MAX_LINEAGE {
            return Err(EngineError::PlanViolation(format!(
                "lineage store requested {num_lineage} lineage columns, max is {MAX_LINEAGE}"
            )));
        }
        let tuple_len = data_len + META_LEN;
        let tuples_per_page = ((PAGE_SIZE as usize) / tuple_len.max(1)).max(1);
        Ok(Self {
            mem,
            data_len,
            tuple_len,
            num_stubs,
            num_lineage,
            tuples_per_page,
            live_in_page: HashMap::new(),
            bump_page: None,
            bump_offset: 0,
            free_head: None,
            used_head: None,
            lineage_index: HashMap::new(),
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
    fn lin_off(&self, i: usize) -> usize {
        self.data_len + 16 + 4 * i
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

    fn lineage_key(&self, t: TupleHandle) -> (i32, i32) {
        let raw = self.raw(t);
        let lin0 = read_int(&raw, self.lin_off(0));
        let lin1 = if self.num_lineage > 1 { read_int(&raw, self.lin_off(1)) } else { NO_LINEAGE };
        (lin0, lin1)
    }

    fn set_lineage(&mut self, t: TupleHandle, lineage: &[i32]) {
        debug_assert_eq!(lineage.len(), self.num_lineage);
        for i in 0..MAX_LINEAGE {
            let v = lineage.get(i).copied().unwrap_or(NO_LINEAGE);
            let off = self.lin_off(i);
            write_int(self.mem.borrow_mut().tuple_bytes_mut(t, self.tuple_len), off, v);
        }
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
            self.lineage_index.remove(&self.lineage_key(t));
            self.unlink_used(t);
            self.set_next(t, self.free_head);
            self.free_head = Some(t);
            self.release_page_share(t.page());
        }
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

    /// Records `lineage` against `t` and makes it visible to `stub` (spec
    /// §4.3's `insertTuple_l`).
    pub fn insert_tuple_l(&mut self, t: TupleHandle, lineage: &[i32], stub: usize) {
        self.set_lineage(t, lineage);
        self.lineage_index.insert(self.lineage_key(t), t);
        self.insert_tuple_r(t, stub);
    }

    /// Looks up the tuple originally inserted under `lineage`, if any is
    /// still live (spec §4.3's `getTuple_l`; used by MINUS processing to
    /// recover the tuple identity a negative signal refers to).
    pub fn get_tuple_l(&self, lineage: &[i32]) -> Option<TupleHandle> {
        let key = (
            lineage.first().copied().unwrap_or(NO_LINEAGE),
            lineage.get(1).copied().unwrap_or(NO_LINEAGE),
        );
        self.lineage_index.get(&key).copied()
    }
}

impl StorageAlloc for LineageStore {
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
        self.set_lineage(t, &[]);
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

    fn store(num_stubs: usize, num_lineage: usize) -> LineageStore {
        let mem = Rc::new(RefCell::new(MemoryManager::new(4 * PAGE_SIZE as usize)));
        LineageStore::new(mem, 4, num_stubs, num_lineage).unwrap()
    }

    #[test]
    fn get_tuple_l_recovers_handle_by_lineage() {
        let mut s = store(1, 1);
        let t = s.new_tuple().unwrap();
        s.insert_tuple_l(t, &[42], 0);
        assert_eq!(s.get_tuple_l(&[42]), Some(t));
        assert_eq!(s.get_tuple_l(&[43]), None);
    }

    #[test]
    fn two_column_lineage_disambiguates() {
        let mut s = store(1, 2);
        let a = s.new_tuple().unwrap();
        let b = s.new_tuple().unwrap();
        s.insert_tuple_l(a, &[1, 1], 0);
        s.insert_tuple_l(b, &[1, 2], 0);
        assert_eq!(s.get_tuple_l(&[1, 1]), Some(a));
        assert_eq!(s.get_tuple_l(&[1, 2]), Some(b));
    }

    #[test]
    fn reclaiming_a_tuple_drops_its_lineage_entry() {
        let mut s = store(1, 1);
        let t = s.new_tuple().unwrap();
        s.insert_tuple_l(t, &[7], 0);
        s.delete_tuple_r(t, 0);
        assert_eq!(s.get_tuple_l(&[7]), None);
    }
}
