use std::cell::RefCell;
use std::rc::Rc;

use super::ScanSpec;
use crate::error::Result;
use crate::eval::{role, EvalContext};
use crate::index::HashIndex;
use crate::storage::{RelationStore, StorageAlloc};
use crate::tuple::TupleHandle;

/// A logical bag over a [`RelationStore`] stub (spec §4.5). `insert_tuple`
/// fans out to every attached index before marking the tuple visible in the
/// store; `delete_tuple` does the reverse.
pub struct RelationSynopsis {
    store: Rc<RefCell<RelationStore>>,
    stub: usize,
    indexes: Vec<HashIndex>,
    scans: Vec<ScanSpec>,
}

impl RelationSynopsis {
    pub fn new(store: Rc<RefCell<RelationStore>>, stub: usize) -> Self {
        Self { store, stub, indexes: Vec::new(), scans: Vec::new() }
    }

    /// Registers an index, returning the handle later scan specs reference.
    pub fn attach_index(&mut self, index: HashIndex) -> usize {
        self.indexes.push(index);
        self.indexes.len() - 1
    }

    /// Registers a scan, returning its opaque id.
    pub fn declare_scan(&mut self, spec: ScanSpec) -> usize {
        self.scans.push(spec);
        self.scans.len() - 1
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

    /// Inserts `t` into every attached index, then into the store's view for
    /// this stub (spec §4.5: "inserts into every attached index and calls
    /// the store's `insert_r`").
    pub fn insert_tuple(&mut self, t: TupleHandle) {
        if !self.indexes.is_empty() {
            let bytes = self.store.borrow().read_tuple(t);
            let mut ctx = EvalContext::new();
            ctx.bind(role::UPDATE, bytes);
            for index in &mut self.indexes {
                index.insert(&ctx, t);
            }
        }
        self.store.borrow_mut().insert_tuple_r(t, self.stub);
    }

    pub fn delete_tuple(&mut self, t: TupleHandle) {
        if !self.indexes.is_empty() {
            let bytes = self.store.borrow().read_tuple(t);
            let mut ctx = EvalContext::new();
            ctx.bind(role::UPDATE, bytes);
            for index in &mut self.indexes {
                index.delete(&ctx, t);
            }
        }
        self.store.borrow_mut().delete_tuple_r(t, self.stub);
    }

    /// Runs scan `scan_id`: an indexed probe (the caller must have bound the
    /// probe tuple under [`role::SCAN`] in `ctx`) or a full store scan, then
    /// applies the scan's residual predicate if any, binding each candidate
    /// under [`role::SYN`] for the predicate to read (spec §4.5).
    pub fn get_scan(&self, scan_id: usize, ctx: &mut EvalContext) -> Vec<TupleHandle> {
        let spec = &self.scans[scan_id];
        let store = self.store.borrow();
        let candidates = match spec.index {
            Some(idx) => self.indexes[idx].scan(ctx, role::KEY, |t| store.read_tuple(t)),
            None => store.get_scan_r(self.stub),
        };
        match &spec.residual {
            None => candidates,
            Some(residual) => candidates
                .into_iter()
                .filter(|&t| {
                    ctx.bind(role::SYN, store.read_tuple(t));
                    residual.eval(ctx)
                })
                .collect(),
        }
    }

    pub fn is_visible(&self, t: TupleHandle) -> bool {
        self.store.borrow().is_visible(t, self.stub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{BInstr, BOp, HInstr};
    use crate::memory::MemoryManager;
    use crate::tuple::{write_int, AttrType, PAGE_SIZE};

    #[test]
    fn indexed_scan_round_trips() {
        let mem = Rc::new(RefCell::new(MemoryManager::new(4 * PAGE_SIZE as usize)));
        let store = Rc::new(RefCell::new(RelationStore::new(mem, 4, 1).unwrap()));
        let mut syn = RelationSynopsis::new(store, 0);

        let mut update_h = crate::eval::HEval::new();
        update_h.push(HInstr { ty: AttrType::Int, role: role::UPDATE, col: 0 }).unwrap();
        let mut scan_h = crate::eval::HEval::new();
        scan_h.push(HInstr { ty: AttrType::Int, role: role::SCAN, col: 0 }).unwrap();
        let mut key_eq = crate::eval::BEval::new();
        key_eq.push(BInstr::cmp(BOp::IntEq, role::SCAN, 0, role::KEY, 0)).unwrap();
        let index = HashIndex::new(update_h, scan_h, key_eq, 0.85);
        let idx = syn.attach_index(index);
        let scan_id = syn.declare_scan(ScanSpec::indexed(idx));

        let t = syn.new_tuple().unwrap();
        let mut buf = vec![0u8; 4];
        write_int(&mut buf, 0, 7);
        syn.write_tuple(t, &buf);
        syn.insert_tuple(t);

        let mut probe = EvalContext::new();
        probe.bind(role::SCAN, buf);
        assert_eq!(syn.get_scan(scan_id, &mut probe), vec![t]);
    }
}
