use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Result;
use crate::storage::{StorageAlloc, WindowStore};
use crate::tuple::TupleHandle;

/// A logical bag over a [`WindowStore`] stub (spec §4.5). `get_scan` is
/// specialised to return the stub's current window, oldest-first, rather
/// than consulting a scan-spec list: window synopses have exactly one shape
/// of scan by construction (spec §4.5: "returns a window-store iterator
/// positioned between the stub's oldest and newest tuple").
pub struct WindowSynopsis {
    store: Rc<RefCell<WindowStore>>,
    stub: usize,
}

impl WindowSynopsis {
    pub fn new(store: Rc<RefCell<WindowStore>>, stub: usize) -> Self {
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

    pub fn insert_tuple_w(&mut self, t: TupleHandle, ts: u64) {
        self.store.borrow_mut().insert_tuple_w(t, ts, self.stub);
    }

    pub fn oldest_tuple(&self) -> Option<(TupleHandle, u64)> {
        self.store.borrow().oldest_tuple_w(self.stub)
    }

    pub fn newest_tuple(&self) -> Option<(TupleHandle, u64)> {
        self.store.borrow().newest_tuple_w(self.stub)
    }

    pub fn delete_oldest_tuple(&mut self) -> Result<()> {
        self.store.borrow_mut().delete_oldest_tuple_w(self.stub)
    }

    pub fn is_empty(&self) -> bool {
        self.store.borrow().is_empty_w(self.stub)
    }

    pub fn get_scan(&self) -> Vec<TupleHandle> {
        self.store.borrow().get_scan_w(self.stub)
    }
}
