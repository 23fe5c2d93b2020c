use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Result;
use crate::storage::{LineageStore, StorageAlloc};
use crate::tuple::TupleHandle;

/// A logical bag over a [`LineageStore`] stub, adding lookup of a
/// previously-produced output by the ids of the tuples that produced it
/// (spec §4.5, §9: "producer ids, not pointers").
pub struct LineageSynopsis {
    store: Rc<RefCell<LineageStore>>,
    stub: usize,
}

impl LineageSynopsis {
    pub fn new(store: Rc<RefCell<LineageStore>>, stub: usize) -> Self {
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

    pub fn add_ref(&mut self, t: TupleHandle) {
        self.store.borrow_mut().add_ref(t)
    }

    pub fn decr_ref(&mut self, t: TupleHandle) {
        self.store.borrow_mut().decr_ref(t)
    }

    /// Records `t` as the output derived from `lineage`'s producer ids and
    /// makes it visible to this stub (spec §4.5's `insertTuple(tuple,
    /// lineage)`).
    pub fn insert_tuple(&mut self, t: TupleHandle, lineage: &[i32]) {
        self.store.borrow_mut().insert_tuple_l(t, lineage, self.stub);
    }

    pub fn delete_tuple(&mut self, t: TupleHandle) {
        self.store.borrow_mut().delete_tuple_r(t, self.stub);
    }

    /// Recovers the previously-produced output tuple for `lineage`, if any
    /// is still live (spec §4.5's `getTuple(lineage)`).
    pub fn get_tuple(&self, lineage: &[i32]) -> Option<TupleHandle> {
        self.store.borrow().get_tuple_l(lineage)
    }
}
