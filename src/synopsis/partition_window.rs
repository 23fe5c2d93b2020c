use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Result;
use crate::storage::{PartitionWindowStore, StorageAlloc};
use crate::tuple::TupleHandle;

/// A logical bag over a [`PartitionWindowStore`] stub (spec §4.5), adding
/// per-partition FIFO insertion/eviction on top of the ordinary relation-style
/// surface the store also exposes (used by non-owning stubs that merely want
/// a relation view of the same tuples, e.g. a downstream aggregate).
pub struct PartitionWindowSynopsis {
    store: Rc<RefCell<PartitionWindowStore>>,
    stub: usize,
}

impl PartitionWindowSynopsis {
    pub fn new(store: Rc<RefCell<PartitionWindowStore>>, stub: usize) -> Self {
        Self { store, stub }
    }

    pub fn new_tuple(&mut self) -> Result<TupleHandle> {
        self.store.borrow_mut().new_tuple()
    }

    pub fn read_tuple(&self, t: TupleHandle) -> Vec<u8> {
        self.store.borrow().read_tuple(t)
    }

    pub fn write_tuple(&mut self, t: TupleHandle, bytes: &[u8]) {
        self.store.borrow_mut().write_tuple(t, bytes)
    }

    pub fn insert_tuple_p(&mut self, t: TupleHandle, key: &[u8]) {
        self.store.borrow_mut().insert_tuple_p(t, key, self.stub);
    }

    pub fn delete_oldest_tuple_p(&mut self, key: &[u8]) -> Result<TupleHandle> {
        self.store.borrow_mut().delete_oldest_tuple_p(key, self.stub)
    }

    pub fn partition_size(&self, key: &[u8]) -> u32 {
        self.store.borrow().get_partn_size_p(key)
    }

    pub fn get_scan(&self) -> Vec<TupleHandle> {
        self.store.borrow().get_scan_r(self.stub)
    }
}
