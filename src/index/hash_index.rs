use crate::eval::{BEval, EvalContext, HEval};
use crate::tuple::TupleHandle;

/// A linearised multi-layer bucket directory (spec §4.4). Buckets double
/// dynamically as the load factor crosses `threshold`.
///
/// Internally this is a flat `Vec<Bucket>` indexed by the low `num_bits` bits
/// of a tuple's hash, rather than the layered pointer directory the
/// reference implementation walks page by page — see
/// [`super::hash_helpers::num_layers`] for why the two are observably
/// equivalent here. Each bucket entry caches the hash it was inserted under,
/// so doubling only has to re-slot existing entries, not recompute anything
/// through `update_heval`.
pub struct HashIndex {
    num_bits: u32,
    buckets: Vec<Vec<(u32, TupleHandle)>>,
    num_non_empty: usize,
    threshold: f64,
    update_heval: HEval,
    scan_heval: HEval,
    key_equal: BEval,
}

impl HashIndex {
    const INITIAL_BITS: u32 = 4;

    /// `update_heval` hashes a tuple being inserted or deleted (bound under
    /// whatever role the caller used, typically [`crate::eval::role::UPDATE`]).
    /// `scan_heval` hashes a probe key (typically bound under
    /// [`crate::eval::role::SCAN`]). `key_equal` disambiguates bucket
    /// collisions caused by hash-prefix aliasing (spec §4.4: "BEval eliminates
    /// false positives within a bucket chain").
    pub fn new(update_heval: HEval, scan_heval: HEval, key_equal: BEval, threshold: f64) -> Self {
        let num_bits = Self::INITIAL_BITS;
        Self {
            num_bits,
            buckets: vec![Vec::new(); 1usize << num_bits],
            num_non_empty: 0,
            threshold,
            update_heval,
            scan_heval,
            key_equal,
        }
    }

    fn bucket_idx(&self, hash: u32) -> usize {
        (hash as usize) & ((1usize << self.num_bits) - 1)
    }

    /// Inserts `handle` after binding its tuple bytes under the role
    /// `update_heval` expects (spec §4.4's insertion path).
    pub fn insert(&mut self, ctx: &EvalContext, handle: TupleHandle) {
        let hash = self.update_heval.eval(ctx);
        let idx = self.bucket_idx(hash);
        if self.buckets[idx].is_empty() {
            self.num_non_empty += 1;
        }
        self.buckets[idx].push((hash, handle));
        self.maybe_double();
    }

    /// Removes `handle` from its bucket. `ctx` must carry the same binding
    /// used at insert time, since the hash is recomputed rather than stored
    /// against a handle-keyed side table.
    pub fn delete(&mut self, ctx: &EvalContext, handle: TupleHandle) {
        let hash = self.update_heval.eval(ctx);
        let idx = self.bucket_idx(hash);
        if let Some(pos) = self.buckets[idx].iter().position(|&(_, h)| h == handle) {
            self.buckets[idx].remove(pos);
            if self.buckets[idx].is_empty() {
                self.num_non_empty -= 1;
            }
        }
    }

    /// Returns every handle whose bucket matches the probe's hash and whose
    /// tuple passes `key_equal` against the probe (spec §4.4's scan path).
    /// `fetch` reads a candidate's tuple bytes from the owning store so they
    /// can be bound under `key_role` for the `key_equal` check; the index
    /// itself holds no tuple bytes, only handles.
    pub fn scan(
        &self,
        ctx: &mut EvalContext,
        key_role: usize,
        fetch: impl Fn(TupleHandle) -> Vec<u8>,
    ) -> Vec<TupleHandle> {
        let hash = self.scan_heval.eval(ctx);
        let idx = self.bucket_idx(hash);
        self.buckets[idx]
            .iter()
            .filter_map(|&(_, handle)| {
                ctx.bind(key_role, fetch(handle));
                self.key_equal.eval(ctx).then_some(handle)
            })
            .collect()
    }

    fn maybe_double(&mut self) {
        let load = self.num_non_empty as f64 / self.buckets.len() as f64;
        if load <= self.threshold {
            return;
        }
        self.num_bits += 1;
        let mut next = vec![Vec::new(); 1usize << self.num_bits];
        let mut next_non_empty = 0;
        for bucket in self.buckets.drain(..) {
            for (hash, handle) in bucket {
                let idx = (hash as usize) & ((1usize << self.num_bits) - 1);
                if next[idx].is_empty() {
                    next_non_empty += 1;
                }
                next[idx].push((hash, handle));
            }
        }
        self.buckets = next;
        self.num_non_empty = next_non_empty;
        tracing::debug!(num_bits = self.num_bits, "hash index doubled");
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn load_factor(&self) -> f64 {
        self.num_non_empty as f64 / self.buckets.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::role;
    use crate::eval::{BInstr, BOp, HInstr};
    use crate::tuple::{write_int, AttrType, PageId, PAGE_SIZE};

    fn int_heval(role: usize) -> HEval {
        let mut h = HEval::new();
        h.push(HInstr { ty: AttrType::Int, role, col: 0 }).unwrap();
        h
    }

    fn int_key_equal() -> BEval {
        let mut b = BEval::new();
        b.push(BInstr::cmp(BOp::IntEq, role::SCAN, 0, role::KEY, 0)).unwrap();
        b
    }

    fn handle(i: u32) -> TupleHandle {
        TupleHandle(PageId(0).0 * PAGE_SIZE + i * 4)
    }

    #[test]
    fn scan_finds_inserted_handle() {
        let h = handle(0);
        let mut buf = vec![0u8; 4];
        write_int(&mut buf, 0, 7);

        let mut ctx = EvalContext::new();
        ctx.bind(role::UPDATE, buf.clone());

        let mut index = HashIndex::new(int_heval(role::UPDATE), int_heval(role::SCAN), int_key_equal(), 0.85);
        index.insert(&ctx, h);

        let mut probe = EvalContext::new();
        probe.bind(role::SCAN, buf.clone());
        let found = index.scan(&mut probe, role::KEY, |_| buf.clone());
        assert_eq!(found, vec![h]);
    }

    #[test]
    fn delete_removes_handle() {
        let h = handle(1);
        let mut buf = vec![0u8; 4];
        write_int(&mut buf, 0, 3);

        let mut ctx = EvalContext::new();
        ctx.bind(role::UPDATE, buf.clone());

        let mut index = HashIndex::new(int_heval(role::UPDATE), int_heval(role::SCAN), int_key_equal(), 0.85);
        index.insert(&ctx, h);
        index.delete(&ctx, h);

        let mut probe = EvalContext::new();
        probe.bind(role::SCAN, buf.clone());
        let found = index.scan(&mut probe, role::KEY, |_| buf.clone());
        assert!(found.is_empty());
    }

    #[test]
    fn doubling_preserves_all_entries() {
        let mut index = HashIndex::new(int_heval(role::UPDATE), int_heval(role::SCAN), int_key_equal(), 0.85);

        let mut entries = Vec::new();
        for i in 0..200u32 {
            let h = handle(i);
            let mut buf = vec![0u8; 4];
            write_int(&mut buf, 0, i as i32);
            let mut ctx = EvalContext::new();
            ctx.bind(role::UPDATE, buf.clone());
            index.insert(&ctx, h);
            entries.push((buf, h));
        }

        assert!(index.num_buckets() > 16);
        for (buf, h) in entries {
            let mut probe = EvalContext::new();
            probe.bind(role::SCAN, buf.clone());
            let found = index.scan(&mut probe, role::KEY, |_| buf.clone());
            assert_eq!(found, vec![h]);
        }
    }
}
