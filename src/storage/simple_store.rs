use std::cell::RefCell;
use std::rc::Rc;

use super::StorageAlloc;
use crate::error::Result;
use crate::memory::MemoryManager;
use crate::tuple::{PageId, TupleHandle, PAGE_SIZE};

/// Append-only bump allocator, refcounted at the page level (spec §3:
/// "used for streams that need no synopsis view"). Grounded on
/// `original_source/dsms/.../stores/simple_store.h`.
pub struct SimpleStore {
    mem: Rc<RefCell<MemoryManager>>,
    tuple_len: usize,
    tuples_per_page: usize,
    cur_page: PageId,
    num_alloc_in_cur_page: usize,
}

impl SimpleStore {
    pub fn new(mem: Rc<RefCell<MemoryManager>>, tuple_len: usize) -> Result<Self> {
        let tuples_per_page = ((PAGE_SIZE as usize) / tuple_len.max(1)).max(1);
        let cur_page = mem.borrow_mut().allocate_page()?;
        Ok(Self {
            mem,
            tuple_len,
            tuples_per_page,
            cur_page,
            num_alloc_in_cur_page: 0,
        })
    }
}

impl StorageAlloc for SimpleStore {
    fn new_tuple(&mut self) -> Result<TupleHandle> {
        if self.num_alloc_in_cur_page == self.tuples_per_page {
            self.cur_page = self.mem.borrow_mut().allocate_page()?;
            self.num_alloc_in_cur_page = 0;
        }
        let offset = self.num_alloc_in_cur_page * self.tuple_len;
        self.num_alloc_in_cur_page += 1;
        self.mem.borrow_mut().add_ref(self.cur_page, 1);
        Ok(TupleHandle(self.cur_page.0 * PAGE_SIZE + offset as u32))
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
    use crate::tuple::PAGE_SIZE;

    #[test]
    fn new_tuples_fill_a_page_then_roll_over() {
        let mem = Rc::new(RefCell::new(MemoryManager::new(2 * PAGE_SIZE as usize)));
        let mut store = SimpleStore::new(mem.clone(), 16).unwrap();
        let per_page = PAGE_SIZE as usize / 16;
        let mut handles = Vec::new();
        for _ in 0..per_page + 1 {
            handles.push(store.new_tuple().unwrap());
        }
        assert_eq!(handles[0].page(), handles[per_page - 1].page());
        assert_ne!(handles[0].page(), handles[per_page].page());
    }

    #[test]
    fn read_write_tuple_roundtrips() {
        let mem = Rc::new(RefCell::new(MemoryManager::new(PAGE_SIZE as usize)));
        let mut store = SimpleStore::new(mem, 4).unwrap();
        let h = store.new_tuple().unwrap();
        store.write_tuple(h, &99i32.to_le_bytes());
        assert_eq!(i32::from_le_bytes(store.read_tuple(h).try_into().unwrap()), 99);
    }

    #[test]
    fn decr_ref_frees_page_when_all_tuples_released() {
        let mem = Rc::new(RefCell::new(MemoryManager::new(PAGE_SIZE as usize)));
        let mut store = SimpleStore::new(mem.clone(), PAGE_SIZE as usize).unwrap();
        let h = store.new_tuple().unwrap();
        assert_eq!(mem.borrow().free_page_count(), 0);
        store.decr_ref(h);
        assert_eq!(mem.borrow().free_page_count(), 1);
    }
}
