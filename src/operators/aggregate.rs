use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use super::{InputPort, Operator, OutputPort, TimeTracker};
use crate::eval::{role, AEval, BEval, EvalContext};
use crate::memory::MemoryManager;
use crate::queues::{Element, Kind};
use crate::storage::StorageAlloc;
use crate::synopsis::RelationSynopsis;
use crate::tuple::TupleHandle;
use crate::Result;

fn extract_key(bytes: &[u8], cols: &[(usize, usize)]) -> Vec<u8> {
    let mut key = Vec::new();
    for &(off, len) in cols {
        key.extend_from_slice(&bytes[off..off + len]);
    }
    key
}

/// Incremental group-by aggregation (spec §4.7.5). Keeps one current
/// aggregate tuple per group in `output_syn`, indexed by the grouping
/// columns. Five evaluators drive the incremental maintenance:
/// - `init`: builds the first aggregate tuple for a brand-new group.
/// - `plus`: folds one more input tuple into an existing aggregate tuple.
/// - `minus`: folds the retraction of one input tuple out of an aggregate
///   tuple, when that can be done without rescanning the group (e.g. SUM,
///   COUNT, AVG).
/// - `rescan_needed`: tells whether `minus` is unsafe for this retraction
///   (e.g. MAX/MIN losing their extremum) and a full group rescan is needed
///   instead.
/// - `empty_group`: tells whether the post-retraction aggregate represents
///   an empty group, in which case the group is dropped rather than
///   updated.
///
/// A PLUS that replaces an existing group's aggregate emits `PLUS(new)` then
/// `MINUS(old)`; a MINUS that does likewise emits the same pair. Only a
/// single pending element is ever in flight between the two emits of such a
/// pair, so the stall state is one `Option<Element>`-deep per pending pair,
/// modeled here as a small queue to keep the two call sites identical.
pub struct GroupByAggregation {
    input: InputPort,
    output: OutputPort,
    mem: Rc<RefCell<MemoryManager>>,
    input_len: usize,
    output_len: usize,
    key_cols: Vec<(usize, usize)>,
    output_syn: RelationSynopsis,
    group_scan: usize,
    input_syn: Option<RelationSynopsis>,
    group_scan_on_input: Option<usize>,
    init: AEval,
    plus: AEval,
    minus: AEval,
    rescan_needed: BEval,
    empty_group: BEval,
    /// Bound under [`role::CONST`] for every evaluator call, so a plan's
    /// programs can fold in literals (e.g. the `1` a COUNT increments by)
    /// without the operator knowing what they mean (spec §4.6's CONST role).
    consts: Vec<u8>,
    time: TimeTracker,
    pending: VecDeque<Element>,
}

impl GroupByAggregation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input: InputPort,
        output: OutputPort,
        mem: Rc<RefCell<MemoryManager>>,
        input_len: usize,
        output_len: usize,
        key_cols: Vec<(usize, usize)>,
        output_syn: RelationSynopsis,
        group_scan: usize,
        input_syn: Option<RelationSynopsis>,
        group_scan_on_input: Option<usize>,
        init: AEval,
        plus: AEval,
        minus: AEval,
        rescan_needed: BEval,
        empty_group: BEval,
        consts: Vec<u8>,
    ) -> Self {
        Self {
            input,
            output,
            mem,
            input_len,
            output_len,
            key_cols,
            output_syn,
            group_scan,
            input_syn,
            group_scan_on_input,
            init,
            plus,
            minus,
            rescan_needed,
            empty_group,
            consts,
            time: TimeTracker::default(),
            pending: VecDeque::new(),
        }
    }

    fn find_group(&self, key: &[u8]) -> Option<TupleHandle> {
        let mut ctx = EvalContext::new();
        ctx.bind(role::SCAN, key.to_vec());
        self.output_syn.get_scan(self.group_scan, &mut ctx).into_iter().next()
    }

    fn try_drain_pending(&mut self) -> bool {
        while let Some(&e) = self.pending.front() {
            let mut mem = self.mem.borrow_mut();
            if !self.output.enqueue(e, &mut mem) {
                return false;
            }
            self.time.note_output(e.timestamp);
            self.pending.pop_front();
        }
        true
    }

    fn write_new_group(&mut self, bytes: &[u8]) -> Result<TupleHandle> {
        let handle = self.output_syn.new_tuple()?;
        self.output_syn.write_tuple(handle, bytes);
        self.output_syn.insert_tuple(handle);
        Ok(handle)
    }

    fn rescan_group(&self, key: &[u8], excluding: TupleHandle) -> Vec<u8> {
        let input_syn = self.input_syn.as_ref().expect("rescan requested without an input synopsis");
        let scan_id = self.group_scan_on_input.expect("rescan requested without a group scan on the input synopsis");
        let mut ctx = EvalContext::new();
        ctx.bind(role::SCAN, key.to_vec());
        let members = input_syn.get_scan(scan_id, &mut ctx);

        let mut acc: Option<Vec<u8>> = None;
        for m in members {
            if m == excluding {
                continue;
            }
            let m_bytes = input_syn.read_tuple(m);
            let mut ctx = EvalContext::new();
            ctx.bind(role::INPUT, m_bytes);
            ctx.bind(role::CONST, self.consts.clone());
            match &acc {
                None => {
                    ctx.bind(role::OUTPUT, vec![0u8; self.output_len]);
                    self.init.eval(&mut ctx);
                    acc = Some(ctx.role(role::OUTPUT).to_vec());
                }
                Some(prev) => {
                    ctx.bind(role::SYN, prev.clone());
                    ctx.bind(role::OUTPUT, vec![0u8; self.output_len]);
                    self.plus.eval(&mut ctx);
                    acc = Some(ctx.role(role::OUTPUT).to_vec());
                }
            }
        }
        acc.unwrap_or_default()
    }

    fn handle_plus(&mut self, t: TupleHandle, ts: u64) -> Result<()> {
        let in_bytes = self.mem.borrow().tuple_bytes(t, self.input_len).to_vec();
        let key = extract_key(&in_bytes, &self.key_cols);

        if let Some(old) = self.find_group(&key) {
            let old_bytes = self.output_syn.read_tuple(old);
            let mut ctx = EvalContext::new();
            ctx.bind(role::INPUT, in_bytes);
            ctx.bind(role::SYN, old_bytes);
            ctx.bind(role::OUTPUT, vec![0u8; self.output_len]);
            ctx.bind(role::CONST, self.consts.clone());
            self.plus.eval(&mut ctx);
            let new_bytes = ctx.role(role::OUTPUT).to_vec();

            let new_handle = self.write_new_group(&new_bytes)?;
            self.output_syn.delete_tuple(old);
            self.pending.push_back(Element::plus(new_handle, ts));
            self.pending.push_back(Element::minus(old, ts));
        } else {
            let mut ctx = EvalContext::new();
            ctx.bind(role::INPUT, in_bytes);
            ctx.bind(role::OUTPUT, vec![0u8; self.output_len]);
            ctx.bind(role::CONST, self.consts.clone());
            self.init.eval(&mut ctx);
            let new_bytes = ctx.role(role::OUTPUT).to_vec();

            let new_handle = self.write_new_group(&new_bytes)?;
            self.pending.push_back(Element::plus(new_handle, ts));
        }

        if let Some(syn) = &mut self.input_syn {
            syn.insert_tuple(t);
        }
        Ok(())
    }

    fn handle_minus(&mut self, t: TupleHandle, ts: u64) -> Result<()> {
        let in_bytes = self.mem.borrow().tuple_bytes(t, self.input_len).to_vec();
        let key = extract_key(&in_bytes, &self.key_cols);
        let Some(old) = self.find_group(&key) else { return Ok(()) };
        let old_bytes = self.output_syn.read_tuple(old);

        if let Some(syn) = &mut self.input_syn {
            syn.delete_tuple(t);
        }

        let mut check_ctx = EvalContext::new();
        check_ctx.bind(role::INPUT, in_bytes.clone());
        check_ctx.bind(role::SYN, old_bytes.clone());
        let needs_rescan = self.input_syn.is_some() && self.rescan_needed.eval(&mut check_ctx);

        let new_bytes = if needs_rescan {
            self.rescan_group(&key, t)
        } else {
            let mut ctx = EvalContext::new();
            ctx.bind(role::INPUT, in_bytes);
            ctx.bind(role::SYN, old_bytes);
            ctx.bind(role::OUTPUT, vec![0u8; self.output_len]);
            self.minus.eval(&mut ctx);
            ctx.role(role::OUTPUT).to_vec()
        };

        let mut empty_ctx = EvalContext::new();
        empty_ctx.bind(role::SYN, new_bytes.clone());
        if new_bytes.is_empty() || self.empty_group.eval(&mut empty_ctx) {
            self.output_syn.delete_tuple(old);
            self.pending.push_back(Element::minus(old, ts));
        } else {
            let new_handle = self.write_new_group(&new_bytes)?;
            self.output_syn.delete_tuple(old);
            self.pending.push_back(Element::plus(new_handle, ts));
            self.pending.push_back(Element::minus(old, ts));
        }
        Ok(())
    }
}

impl Operator for GroupByAggregation {
    fn run(&mut self, time_slice: usize) -> Result<()> {
        if !self.try_drain_pending() {
            return Ok(());
        }

        let mut consumed = 0;
        while consumed < time_slice {
            let Some(e) = self.input.dequeue() else { break };
            consumed += 1;
            self.time.note_input(e.timestamp);

            match e.kind {
                Kind::Heartbeat => {}
                Kind::Plus => {
                    if let Some(t) = e.tuple {
                        self.handle_plus(t, e.timestamp)?;
                    }
                }
                Kind::Minus => {
                    if let Some(t) = e.tuple {
                        self.handle_minus(t, e.timestamp)?;
                    }
                }
            }

            if !self.try_drain_pending() {
                return Ok(());
            }
        }

        self.time.maybe_heartbeat(&self.output, &mut self.mem.borrow_mut());
        Ok(())
    }
}

/// `Distinct` over all attributes: a group-by specialization whose only
/// aggregate is a presence count (spec §4.7.5's "Distinct"). A PLUS emits an
/// output PLUS only the first time a value is seen; a MINUS (only possible
/// when the input is itself relation-valued) emits an output MINUS only when
/// the count returns to zero. The count and the currently-emitted output
/// identity live together so a later MINUS can reproduce the exact tuple
/// pointer the matching PLUS produced.
pub struct Distinct {
    input: InputPort,
    output: OutputPort,
    mem: Rc<RefCell<MemoryManager>>,
    data_len: usize,
    counts: HashMap<Vec<u8>, (u32, TupleHandle)>,
    time: TimeTracker,
    pending: Option<Element>,
}

impl Distinct {
    pub fn new(input: InputPort, output: OutputPort, mem: Rc<RefCell<MemoryManager>>, data_len: usize) -> Self {
        Self { input, output, mem, data_len, counts: HashMap::new(), time: TimeTracker::default(), pending: None }
    }

    fn try_emit(&mut self, e: Element) -> bool {
        let mut mem = self.mem.borrow_mut();
        if self.output.enqueue(e, &mut mem) {
            self.time.note_output(e.timestamp);
            true
        } else {
            false
        }
    }
}

impl Operator for Distinct {
    fn run(&mut self, time_slice: usize) -> Result<()> {
        if let Some(e) = self.pending {
            if !self.try_emit(e) {
                return Ok(());
            }
            self.pending = None;
        }

        let mut consumed = 0;
        while consumed < time_slice {
            let Some(e) = self.input.dequeue() else { break };
            consumed += 1;
            self.time.note_input(e.timestamp);

            let Some(t) = e.tuple else { continue };
            let out_elem = match e.kind {
                Kind::Heartbeat => continue,
                Kind::Plus => {
                    let key = self.mem.borrow().tuple_bytes(t, self.data_len).to_vec();
                    let entry = self.counts.entry(key).or_insert((0, t));
                    entry.0 += 1;
                    if entry.0 == 1 {
                        entry.1 = t;
                        let page = self.mem.borrow().page_of(t);
                        self.mem.borrow_mut().add_ref(page, 1);
                        Element::plus(t, e.timestamp)
                    } else {
                        continue;
                    }
                }
                Kind::Minus => {
                    let key = self.mem.borrow().tuple_bytes(t, self.data_len).to_vec();
                    let Some(entry) = self.counts.get_mut(&key) else { continue };
                    entry.0 -= 1;
                    if entry.0 == 0 {
                        let identity = entry.1;
                        self.counts.remove(&key);
                        let page = self.mem.borrow().page_of(identity);
                        self.mem.borrow_mut().decr_ref(page);
                        Element::minus(identity, e.timestamp)
                    } else {
                        continue;
                    }
                }
            };

            if !self.try_emit(out_elem) {
                self.pending = Some(out_elem);
                return Ok(());
            }
        }

        self.time.maybe_heartbeat(&self.output, &mut self.mem.borrow_mut());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{AInstr, AOp, BInstr, BOp, HEval, HInstr};
    use crate::index::HashIndex;
    use crate::queues::SimpleQueue;
    use crate::storage::RelationStore;
    use crate::synopsis::ScanSpec;
    use crate::tuple::{write_int, AttrType, PAGE_SIZE};

    fn push(mem: &Rc<RefCell<MemoryManager>>, q: &Rc<RefCell<SimpleQueue>>, group: i32, value: i32, ts: u64) {
        let page = mem.borrow_mut().allocate_page().unwrap();
        let t = TupleHandle(page.0 * PAGE_SIZE);
        let mut buf = vec![0u8; 8];
        write_int(&mut buf, 0, group);
        write_int(&mut buf, 4, value);
        mem.borrow_mut().tuple_bytes_mut(t, 8).copy_from_slice(&buf);
        q.borrow_mut().enqueue(Element::plus(t, ts));
    }

    /// Spec §8 scenario C (AVG per group): output columns are `(group, sum,
    /// count)`; AVG itself is left to a downstream projection, matching how
    /// `IntAvg` expects a running sum and count as separate operands rather
    /// than folding the division into the aggregate state.
    #[test]
    fn group_by_accumulates_sum_and_count() {
        let mem = Rc::new(RefCell::new(MemoryManager::new(16 * PAGE_SIZE as usize)));
        let in_q = Rc::new(RefCell::new(SimpleQueue::new(1)));
        let out_q = Rc::new(RefCell::new(SimpleQueue::new(1)));

        let out_store = Rc::new(RefCell::new(RelationStore::new(mem.clone(), 12, 1).unwrap()));
        let mut out_syn = RelationSynopsis::new(out_store, 0);

        let mut update_h = HEval::new();
        update_h.push(HInstr { ty: AttrType::Int, role: role::UPDATE, col: 0 }).unwrap();
        let mut scan_h = HEval::new();
        scan_h.push(HInstr { ty: AttrType::Int, role: role::SCAN, col: 0 }).unwrap();
        let mut key_eq = BEval::new();
        key_eq.push(BInstr::cmp(BOp::IntEq, role::SCAN, 0, role::KEY, 0)).unwrap();
        let idx = out_syn.attach_index(HashIndex::new(update_h, scan_h, key_eq, 0.85));
        let group_scan = out_syn.declare_scan(ScanSpec::indexed(idx));

        let mut init = AEval::new();
        init.push(AInstr::unary(AOp::IntCopy, role::INPUT, 0, role::OUTPUT, 0)).unwrap();
        init.push(AInstr::unary(AOp::IntCopy, role::INPUT, 4, role::OUTPUT, 4)).unwrap();
        init.push(AInstr {
            op: AOp::IntCopy,
            r1: role::CONST,
            c1: 0,
            r2: 0,
            c2: 0,
            dr: role::OUTPUT,
            dc: 8,
            len: 0,
        });

        let mut plus = AEval::new();
        plus.push(AInstr::unary(AOp::IntCopy, role::INPUT, 0, role::OUTPUT, 0)).unwrap();
        plus.push(AInstr::binary(AOp::IntAdd, role::SYN, 4, role::INPUT, 4, role::OUTPUT, 4)).unwrap();
        plus.push(AInstr::binary(AOp::IntAdd, role::SYN, 8, role::CONST, 0, role::OUTPUT, 8)).unwrap();

        let minus = AEval::new();
        let mut rescan_needed = BEval::new();
        rescan_needed.push(BInstr::cmp(BOp::IntNe, role::SCAN, 0, role::SCAN, 0)).unwrap();
        let mut empty_group = BEval::new();
        empty_group.push(BInstr::cmp(BOp::IntLe, role::SYN, 8, role::CONST, 0)).unwrap();

        let mut agg = GroupByAggregation::new(
            InputPort::Simple(in_q.clone()),
            OutputPort::Simple(out_q.clone()),
            mem.clone(),
            8,
            12,
            vec![(0, 4)],
            out_syn,
            group_scan,
            None,
            None,
            init,
            plus,
            minus,
            rescan_needed,
            empty_group,
            1i32.to_le_bytes().to_vec(),
        );

        push(&mem, &in_q, 1, 10, 1);
        push(&mem, &in_q, 1, 20, 2);
        agg.run(10).unwrap();

        let e1 = out_q.borrow_mut().dequeue().unwrap();
        assert_eq!(e1.kind, Kind::Plus);
        let e2 = out_q.borrow_mut().dequeue().unwrap();
        assert_eq!(e2.kind, Kind::Plus);
        let e3 = out_q.borrow_mut().dequeue().unwrap();
        assert_eq!(e3.kind, Kind::Minus);

        let bytes = mem.borrow().tuple_bytes(e2.tuple.unwrap(), 12).to_vec();
        assert_eq!(crate::tuple::read_int(&bytes, 4), 30);
        assert_eq!(crate::tuple::read_int(&bytes, 8), 2);
    }
}
