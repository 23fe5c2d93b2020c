use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use super::StorageAlloc;
use crate::error::{EngineError, Result};
use crate::memory::MemoryManager;
use crate::tuple::{PageId, TupleHandle, PAGE_SIZE};

/// Per-stub oldest/newest cursors on a shared per-page ring (spec §3, §4.3).
/// Grounded on `original_source/dsms/.../stores/win_store_impl.{h,cc}`.
///
/// Tuple content is a bump-allocated ring exactly like [`super::SimpleStore`];
/// what's specific to a window store is the bookkeeping of which tuples are
/// still visible to which stub, expressed here as absolute sequence-number
/// cursors rather than literal pointer-chasing (see DESIGN.md).
pub struct WindowStore {
    mem: Rc<RefCell<MemoryManager>>,
    tuple_len: usize,
    tuples_per_page: usize,
    num_stubs: usize,
    cur_page: PageId,
    num_alloc_in_cur_page: usize,
    order: VecDeque<TupleHandle>,
    order_ts: VecDeque<u64>,
    base_seq: u64,
    next_seq: u64,
    stub_oldest_seq: Vec<u64>,
    stub_newest_seq: Vec<u64>,
}

impl WindowStore {
    pub fn new(mem: Rc<RefCell<MemoryManager>>, tuple_len: usize, num_stubs: usize) -> Result<Self> {
        let tuples_per_page = ((PAGE_SIZE as usize) / tuple_len.max(1)).max(1);
        let cur_page = mem.borrow_mut().allocate_page()?;
        Ok(Self {
            mem,
            tuple_len,
            tuples_per_page,
            num_stubs,
            cur_page,
            num_alloc_in_cur_page: 0,
            order: VecDeque::new(),
            order_ts: VecDeque::new(),
            base_seq: 0,
            next_seq: 0,
            stub_oldest_seq: vec![0; num_stubs],
            stub_newest_seq: vec![0; num_stubs],
        })
    }

    fn idx_of(&self, seq: u64) -> usize {
        (seq - self.base_seq) as usize
    }

    /// Marks the freshly created tuple as inserted into `stub`'s view at
    /// `ts`, taking that stub's page reference.
    pub fn insert_tuple_w(&mut self, t: TupleHandle, ts: u64, stub: usize) {
        let idx = self.idx_of(self.stub_newest_seq[stub]);
        self.order_ts[idx] = ts;
        self.stub_newest_seq[stub] += 1;
        self.mem.borrow_mut().add_ref(t.page(), 1);
    }

    pub fn is_empty_w(&self, stub: usize) -> bool {
        self.stub_oldest_seq[stub] == self.stub_newest_seq[stub]
    }

    /// The stub's oldest tuple still present, with its timestamp.
    pub fn oldest_tuple_w(&self, stub: usize) -> Option<(TupleHandle, u64)> {
        if self.is_empty_w(stub) {
            return None;
        }
        let idx = self.idx_of(self.stub_oldest_seq[stub]);
        Some((self.order[idx], self.order_ts[idx]))
    }

    /// The stub's newest tuple (most recently inserted), with its timestamp.
    pub fn newest_tuple_w(&self, stub: usize) -> Option<(TupleHandle, u64)> {
        if self.is_empty_w(stub) {
            return None;
        }
        let idx = self.idx_of(self.stub_newest_seq[stub] - 1);
        Some((self.order[idx], self.order_ts[idx]))
    }

    /// Deletes the stub's current oldest tuple. Per spec §9's resolved open
    /// question, deleting anything but the current oldest is a precondition
    /// violation rather than a silent no-op or panic.
    pub fn delete_oldest_tuple_w(&mut self, stub: usize) -> Result<()> {
        if self.is_empty_w(stub) {
            return Err(EngineError::PlanViolation(
                "delete_oldest_tuple_w on an empty window stub".into(),
            ));
        }
        let seq = self.stub_oldest_seq[stub];
        let idx = self.idx_of(seq);
        let t = self.order[idx];
        self.stub_oldest_seq[stub] += 1;
        self.mem.borrow_mut().decr_ref(t.page());

        let min_oldest = self.stub_oldest_seq.iter().copied().min().unwrap_or(seq + 1);
        while self.base_seq < min_oldest && !self.order.is_empty() {
            self.order.pop_front();
            self.order_ts.pop_front();
            self.base_seq += 1;
        }
        Ok(())
    }

    /// Requires that `delete_tuple_r`-style deletion target the oldest
    /// tuple for the stub (spec §9). Returns an error otherwise.
    pub fn delete_tuple_r(&mut self, t: TupleHandle, stub: usize) -> Result<()> {
        match self.oldest_tuple_w(stub) {
            Some((oldest, _)) if oldest == t => self.delete_oldest_tuple_w(stub),
            _ => Err(EngineError::PlanViolation(
                "window store delete_tuple_r on a non-oldest tuple".into(),
            )),
        }
    }

    /// Materialises the stub's current window, oldest-first (spec §4.5:
    /// "a window-store iterator positioned between the stub's oldest and
    /// newest tuple").
    pub fn get_scan_w(&self, stub: usize) -> Vec<TupleHandle> {
        let (from, to) = (self.stub_oldest_seq[stub], self.stub_newest_seq[stub]);
        (from..to).map(|seq| self.order[self.idx_of(seq)]).collect()
    }
}

impl StorageAlloc for WindowStore {
    fn new_tuple(&mut self) -> Result<TupleHandle> {
        if self.num_alloc_in_cur_page == self.tuples_per_page {
            self.cur_page = self.mem.borrow_mut().allocate_page()?;
            self.num_alloc_in_cur_page = 0;
        }
        let offset = self.num_alloc_in_cur_page * self.tuple_len;
        self.num_alloc_in_cur_page += 1;
        let t = TupleHandle(self.cur_page.0 * PAGE_SIZE + offset as u32);
        self.order.push_back(t);
        self.order_ts.push_back(0);
        self.next_seq += 1;
        Ok(t)
    }

    fn add_ref(&mut self, t: TupleHandle) {
        self.mem.borrow_mut().add_ref(t.page(), 1);
    }

    fn add_ref_n(&mut self, t: TupleHandle, n: u32) {
        self.mem.borrow_mut().add_ref(t.page(), n);
    }

    fn decr_ref(&mut self, t: TupleHandle) {
        self.mem.borrow_mut().decr_ref(t.page());
    }

    fn tuple_len(&self) -> usize {
        self.tuple_len
    }

    fn read_tuple(&self, t: TupleHandle) -> Vec<u8> {
        self.mem.borrow().tuple_bytes(t, self.tuple_len).to_vec()
    }

    fn write_tuple(&mut self, t: TupleHandle, bytes: &[u8]) {
        self.mem
            .borrow_mut()
            .tuple_bytes_mut(t, self.tuple_len)
            .copy_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_first_eviction() {
        let mem = Rc::new(RefCell::new(MemoryManager::new(4 * PAGE_SIZE as usize)));
        let mut s = WindowStore::new(mem, 4, 1).unwrap();
        let t1 = s.new_tuple().unwrap();
        s.insert_tuple_w(t1, 1, 0);
        let t2 = s.new_tuple().unwrap();
        s.insert_tuple_w(t2, 2, 0);
        assert_eq!(s.oldest_tuple_w(0).unwrap().0, t1);
        s.delete_oldest_tuple_w(0).unwrap();
        assert_eq!(s.oldest_tuple_w(0).unwrap().0, t2);
    }

    #[test]
    fn deleting_non_oldest_is_a_plan_violation() {
        let mem = Rc::new(RefCell::new(MemoryManager::new(4 * PAGE_SIZE as usize)));
        let mut s = WindowStore::new(mem, 4, 1).unwrap();
        let _t1 = s.new_tuple().unwrap();
        s.insert_tuple_w(_t1, 1, 0);
        let t2 = s.new_tuple().unwrap();
        s.insert_tuple_w(t2, 2, 0);
        assert!(s.delete_tuple_r(t2, 0).is_err());
    }

    #[test]
    fn two_stubs_share_physical_ring_independently() {
        let mem = Rc::new(RefCell::new(MemoryManager::new(4 * PAGE_SIZE as usize)));
        let mut s = WindowStore::new(mem, 4, 2).unwrap();
        let t1 = s.new_tuple().unwrap();
        s.insert_tuple_w(t1, 1, 0);
        s.insert_tuple_w(t1, 1, 1);
        s.delete_oldest_tuple_w(0).unwrap();
        // stub 1 still sees t1; physical tuple isn't dropped from `order`.
        assert_eq!(s.oldest_tuple_w(1).unwrap().0, t1);
        s.delete_oldest_tuple_w(1).unwrap();
        assert!(s.is_empty_w(1));
    }
}
