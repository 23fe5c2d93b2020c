use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use super::{DualTimeTracker, InputPort, Operator, OutputPort};
use crate::eval::{role, AEval, EvalContext};
use crate::memory::MemoryManager;
use crate::queues::{Element, Kind};
use crate::storage::{SimpleStore, StorageAlloc};
use crate::synopsis::{LineageSynopsis, RelationSynopsis};
use crate::tuple::TupleHandle;
use crate::Result;

/// Whether a join's output feeds a stream or relation consumer, mirroring
/// [`super::project::ProjectOutput`] (spec §4.7.2, §4.7.3).
pub enum JoinOutput {
    Stream(SimpleStore),
    Relation(LineageSynopsis),
}

/// Which input side produced the element currently driving a join's stall
/// (spec §4.7.3's `stallType`).
#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Outer,
    Inner,
}

/// Captured mid-emission state for a binary join (spec §4.7.3): the input
/// element that triggered a scan of the opposite relation, the remaining
/// opposite-side matches not yet turned into output, and a single
/// already-constructed output element waiting on a full output queue. The
/// own-side synopsis is updated as soon as the opposite side has been
/// scanned (scanning happens against the synopsis state *before* this
/// tuple's own effect), so it never needs to be redone on resume.
struct JoinStall {
    side: Side,
    kind: Kind,
    ts: u64,
    own_handle: TupleHandle,
    matches: VecDeque<TupleHandle>,
    pending_out: Option<Element>,
    extra_ref_held: bool,
}

fn extract_key(bytes: &[u8], cols: &[(usize, usize)]) -> Vec<u8> {
    let mut key = Vec::new();
    for &(off, len) in cols {
        key.extend_from_slice(&bytes[off..off + len]);
    }
    key
}

/// Stream-stream (or relation-relation) equi-join (spec §4.7.3). Each side
/// keeps its own [`RelationSynopsis`]; a change on one side probes the other
/// side's synopsis through a pre-declared indexed [`crate::synopsis::ScanSpec`]
/// and emits one joined element per match, with a stall checkpoint so a full
/// output queue never loses or duplicates a match mid-emission.
pub struct BinaryJoin {
    outer_in: InputPort,
    inner_in: InputPort,
    output: OutputPort,
    mem: Rc<RefCell<MemoryManager>>,
    outer_syn: RelationSynopsis,
    inner_syn: RelationSynopsis,
    scan_inner_by_outer: usize,
    scan_outer_by_inner: usize,
    outer_key_cols: Vec<(usize, usize)>,
    inner_key_cols: Vec<(usize, usize)>,
    outer_len: usize,
    inner_len: usize,
    output_len: usize,
    constructor: AEval,
    store: JoinOutput,
    time: DualTimeTracker,
    stall: Option<JoinStall>,
}

impl BinaryJoin {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        outer_in: InputPort,
        inner_in: InputPort,
        output: OutputPort,
        mem: Rc<RefCell<MemoryManager>>,
        outer_syn: RelationSynopsis,
        inner_syn: RelationSynopsis,
        scan_inner_by_outer: usize,
        scan_outer_by_inner: usize,
        outer_key_cols: Vec<(usize, usize)>,
        inner_key_cols: Vec<(usize, usize)>,
        outer_len: usize,
        inner_len: usize,
        output_len: usize,
        constructor: AEval,
        store: JoinOutput,
    ) -> Self {
        Self {
            outer_in,
            inner_in,
            output,
            mem,
            outer_syn,
            inner_syn,
            scan_inner_by_outer,
            scan_outer_by_inner,
            outer_key_cols,
            inner_key_cols,
            outer_len,
            inner_len,
            output_len,
            constructor,
            store,
            time: DualTimeTracker::default(),
            stall: None,
        }
    }

    fn scan_opposite(&self, side: Side, t: TupleHandle) -> Vec<TupleHandle> {
        let mut ctx = EvalContext::new();
        match side {
            Side::Outer => {
                let bytes = self.mem.borrow().tuple_bytes(t, self.outer_len).to_vec();
                ctx.bind(role::SCAN, extract_key(&bytes, &self.outer_key_cols));
                self.inner_syn.get_scan(self.scan_inner_by_outer, &mut ctx)
            }
            Side::Inner => {
                let bytes = self.mem.borrow().tuple_bytes(t, self.inner_len).to_vec();
                ctx.bind(role::SCAN, extract_key(&bytes, &self.inner_key_cols));
                self.outer_syn.get_scan(self.scan_outer_by_inner, &mut ctx)
            }
        }
    }

    fn construct_join(&mut self, side: Side, kind: Kind, own: TupleHandle, other: TupleHandle, ts: u64) -> Result<Element> {
        let (outer_t, inner_t) = match side {
            Side::Outer => (own, other),
            Side::Inner => (other, own),
        };
        let outer_bytes = self.mem.borrow().tuple_bytes(outer_t, self.outer_len).to_vec();
        let inner_bytes = self.mem.borrow().tuple_bytes(inner_t, self.inner_len).to_vec();
        let mut ctx = EvalContext::new();
        ctx.bind(role::OUTER, outer_bytes);
        ctx.bind(role::INNER, inner_bytes);
        ctx.bind(role::OUTPUT, vec![0u8; self.output_len]);
        self.constructor.eval(&mut ctx);
        let out_bytes = ctx.role(role::OUTPUT).to_vec();
        let lineage = [outer_t.dense_id() as i32, inner_t.dense_id() as i32];

        match kind {
            Kind::Plus => {
                let handle = match &mut self.store {
                    JoinOutput::Stream(s) => s.new_tuple()?,
                    JoinOutput::Relation(syn) => syn.new_tuple()?,
                };
                match &mut self.store {
                    JoinOutput::Stream(s) => s.write_tuple(handle, &out_bytes),
                    JoinOutput::Relation(syn) => {
                        syn.write_tuple(handle, &out_bytes);
                        syn.insert_tuple(handle, &lineage);
                    }
                }
                Ok(Element::plus(handle, ts))
            }
            Kind::Minus => {
                let handle = match &mut self.store {
                    JoinOutput::Stream(s) => {
                        let h = s.new_tuple()?;
                        s.write_tuple(h, &out_bytes);
                        h
                    }
                    JoinOutput::Relation(syn) => {
                        let h = syn.get_tuple(&lineage).unwrap_or(other);
                        syn.delete_tuple(h);
                        h
                    }
                };
                Ok(Element::minus(handle, ts))
            }
            Kind::Heartbeat => unreachable!("heartbeats never enter the matching path"),
        }
    }

    /// Drains the current stall's remaining matches and pending emit.
    /// Returns `false` if still blocked on a full output queue.
    fn resume_stall(&mut self) -> Result<bool> {
        let mut stall = self.stall.take().expect("resume_stall called without a stall");
        loop {
            if let Some(e) = stall.pending_out {
                let mut mem = self.mem.borrow_mut();
                if !self.output.enqueue(e, &mut mem) {
                    drop(mem);
                    self.stall = Some(stall);
                    return Ok(false);
                }
                self.time.note_output(e.timestamp);
                stall.pending_out = None;
            }
            let Some(m) = stall.matches.pop_front() else { break };
            stall.pending_out = Some(self.construct_join(stall.side, stall.kind, stall.own_handle, m, stall.ts)?);
        }

        if stall.extra_ref_held {
            let page = self.mem.borrow().page_of(stall.own_handle);
            self.mem.borrow_mut().decr_ref(page);
        }
        Ok(true)
    }
}

impl Operator for BinaryJoin {
    fn run(&mut self, time_slice: usize) -> Result<()> {
        if self.stall.is_some() && !self.resume_stall()? {
            return Ok(());
        }

        let mut consumed = 0;
        while consumed < time_slice {
            let outer_ts = self.outer_in.peek().map(|e| e.timestamp);
            let inner_ts = self.inner_in.peek().map(|e| e.timestamp);
            let (side, e) = match (outer_ts, inner_ts) {
                (None, None) => break,
                (Some(_), None) => (Side::Outer, self.outer_in.dequeue().unwrap()),
                (None, Some(_)) => (Side::Inner, self.inner_in.dequeue().unwrap()),
                (Some(o), Some(i)) if o <= i => (Side::Outer, self.outer_in.dequeue().unwrap()),
                (Some(_), Some(_)) => (Side::Inner, self.inner_in.dequeue().unwrap()),
            };
            consumed += 1;
            match side {
                Side::Outer => self.time.note_left(e.timestamp),
                Side::Inner => self.time.note_right(e.timestamp),
            }

            if e.kind == Kind::Heartbeat {
                continue;
            }
            let Some(t) = e.tuple else { continue };

            let extra_ref_held = e.kind == Kind::Minus;
            if extra_ref_held {
                let page = self.mem.borrow().page_of(t);
                self.mem.borrow_mut().add_ref(page, 1);
            }

            let matches = self.scan_opposite(side, t);
            match (side, e.kind) {
                (Side::Outer, Kind::Plus) => self.outer_syn.insert_tuple(t),
                (Side::Outer, Kind::Minus) => self.outer_syn.delete_tuple(t),
                (Side::Inner, Kind::Plus) => self.inner_syn.insert_tuple(t),
                (Side::Inner, Kind::Minus) => self.inner_syn.delete_tuple(t),
                (_, Kind::Heartbeat) => unreachable!(),
            }

            self.stall = Some(JoinStall {
                side,
                kind: e.kind,
                ts: e.timestamp,
                own_handle: t,
                matches: matches.into(),
                pending_out: None,
                extra_ref_held,
            });
            if !self.resume_stall()? {
                return Ok(());
            }
        }

        self.time.maybe_heartbeat(&self.output, &mut self.mem.borrow_mut());
        Ok(())
    }
}

/// Stream-relation join (spec §4.7.3): the outer side is a stream and keeps
/// no synopsis of its own, so only outer elements drive output; inner
/// changes merely update the inner [`RelationSynopsis`] and never themselves
/// produce a match.
pub struct StreamRelationJoin {
    outer_in: InputPort,
    inner_in: InputPort,
    output: OutputPort,
    mem: Rc<RefCell<MemoryManager>>,
    inner_syn: RelationSynopsis,
    scan_inner_by_outer: usize,
    outer_key_cols: Vec<(usize, usize)>,
    outer_len: usize,
    inner_len: usize,
    output_len: usize,
    constructor: AEval,
    store: JoinOutput,
    time: DualTimeTracker,
    stall: Option<JoinStall>,
}

impl StreamRelationJoin {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        outer_in: InputPort,
        inner_in: InputPort,
        output: OutputPort,
        mem: Rc<RefCell<MemoryManager>>,
        inner_syn: RelationSynopsis,
        scan_inner_by_outer: usize,
        outer_key_cols: Vec<(usize, usize)>,
        outer_len: usize,
        inner_len: usize,
        output_len: usize,
        constructor: AEval,
        store: JoinOutput,
    ) -> Self {
        Self {
            outer_in,
            inner_in,
            output,
            mem,
            inner_syn,
            scan_inner_by_outer,
            outer_key_cols,
            outer_len,
            inner_len,
            output_len,
            constructor,
            store,
            time: DualTimeTracker::default(),
            stall: None,
        }
    }

    fn scan_inner(&self, t: TupleHandle) -> Vec<TupleHandle> {
        let bytes = self.mem.borrow().tuple_bytes(t, self.outer_len).to_vec();
        let mut ctx = EvalContext::new();
        ctx.bind(role::SCAN, extract_key(&bytes, &self.outer_key_cols));
        self.inner_syn.get_scan(self.scan_inner_by_outer, &mut ctx)
    }

    fn construct_join(&mut self, kind: Kind, outer_t: TupleHandle, inner_t: TupleHandle, ts: u64) -> Result<Element> {
        let outer_bytes = self.mem.borrow().tuple_bytes(outer_t, self.outer_len).to_vec();
        let inner_bytes = self.mem.borrow().tuple_bytes(inner_t, self.inner_len).to_vec();
        let mut ctx = EvalContext::new();
        ctx.bind(role::OUTER, outer_bytes);
        ctx.bind(role::INNER, inner_bytes);
        ctx.bind(role::OUTPUT, vec![0u8; self.output_len]);
        self.constructor.eval(&mut ctx);
        let out_bytes = ctx.role(role::OUTPUT).to_vec();

        let handle = match &mut self.store {
            JoinOutput::Stream(s) => s.new_tuple()?,
            JoinOutput::Relation(syn) => syn.new_tuple()?,
        };
        match &mut self.store {
            JoinOutput::Stream(s) => s.write_tuple(handle, &out_bytes),
            JoinOutput::Relation(syn) => syn.write_tuple(handle, &out_bytes),
        }
        if let (Kind::Plus, JoinOutput::Relation(syn)) = (kind, &mut self.store) {
            syn.insert_tuple(handle, &[outer_t.dense_id() as i32, inner_t.dense_id() as i32]);
        }
        Ok(match kind {
            Kind::Plus => Element::plus(handle, ts),
            Kind::Minus => Element::minus(handle, ts),
            Kind::Heartbeat => unreachable!("heartbeats never enter the matching path"),
        })
    }

    fn resume_stall(&mut self) -> Result<bool> {
        let mut stall = self.stall.take().expect("resume_stall called without a stall");
        loop {
            if let Some(e) = stall.pending_out {
                let mut mem = self.mem.borrow_mut();
                if !self.output.enqueue(e, &mut mem) {
                    drop(mem);
                    self.stall = Some(stall);
                    return Ok(false);
                }
                self.time.note_output(e.timestamp);
                stall.pending_out = None;
            }
            let Some(m) = stall.matches.pop_front() else { break };
            stall.pending_out = Some(self.construct_join(stall.kind, stall.own_handle, m, stall.ts)?);
        }
        if stall.extra_ref_held {
            let page = self.mem.borrow().page_of(stall.own_handle);
            self.mem.borrow_mut().decr_ref(page);
        }
        Ok(true)
    }
}

impl Operator for StreamRelationJoin {
    fn run(&mut self, time_slice: usize) -> Result<()> {
        if self.stall.is_some() && !self.resume_stall()? {
            return Ok(());
        }

        let mut consumed = 0;
        while consumed < time_slice {
            // Inner changes never themselves emit; drain any waiting ones
            // first so the relation state stays current for the next probe.
            if let Some(e) = self.inner_in.peek() {
                if self.outer_in.peek().map(|o| o.timestamp > e.timestamp).unwrap_or(true) {
                    let e = self.inner_in.dequeue().unwrap();
                    consumed += 1;
                    self.time.note_right(e.timestamp);
                    if let Some(t) = e.tuple {
                        match e.kind {
                            Kind::Plus => self.inner_syn.insert_tuple(t),
                            Kind::Minus => self.inner_syn.delete_tuple(t),
                            Kind::Heartbeat => {}
                        }
                    }
                    continue;
                }
            }

            let Some(e) = self.outer_in.dequeue() else { break };
            consumed += 1;
            self.time.note_left(e.timestamp);

            if e.kind == Kind::Heartbeat {
                continue;
            }
            let Some(t) = e.tuple else { continue };

            let extra_ref_held = e.kind == Kind::Minus;
            if extra_ref_held {
                let page = self.mem.borrow().page_of(t);
                self.mem.borrow_mut().add_ref(page, 1);
            }

            let matches = self.scan_inner(t);
            self.stall = Some(JoinStall {
                side: Side::Outer,
                kind: e.kind,
                ts: e.timestamp,
                own_handle: t,
                matches: matches.into(),
                pending_out: None,
                extra_ref_held,
            });
            if !self.resume_stall()? {
                return Ok(());
            }
        }

        self.time.maybe_heartbeat(&self.output, &mut self.mem.borrow_mut());
        Ok(())
    }
}
