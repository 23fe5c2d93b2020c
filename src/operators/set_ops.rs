use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use super::{DualTimeTracker, InputPort, Operator, OutputPort};
use crate::memory::MemoryManager;
use crate::queues::{Element, Kind};
use crate::synopsis::LineageSynopsis;
use crate::tuple::TupleHandle;
use crate::Result;

/// Whether a set operator's output feeds a stream or relation consumer
/// (spec §4.7.9). Relation mode attaches a lineage synopsis so a later
/// MINUS on either side resolves back to the output tuple a matching PLUS
/// produced; since neither operator transforms the tuple (same schema on
/// both sides), the "output tuple" is always the input tuple itself.
pub enum SetOutput {
    Stream,
    Relation(LineageSynopsis),
}

/// Bag union of two same-schema inputs (spec §4.7.9). Forwards both sides'
/// PLUS/MINUS unchanged; in relation mode additionally records, per side, a
/// lineage key so a MINUS can be looked up even if a plan ever needs to
/// resolve it indirectly rather than by the already-equal tuple pointer.
pub struct Union {
    left: InputPort,
    right: InputPort,
    output: OutputPort,
    mem: Rc<RefCell<MemoryManager>>,
    store: SetOutput,
    time: DualTimeTracker,
    pending: Option<Element>,
}

impl Union {
    pub fn new(left: InputPort, right: InputPort, output: OutputPort, mem: Rc<RefCell<MemoryManager>>, store: SetOutput) -> Self {
        Self { left, right, output, mem, store, time: DualTimeTracker::default(), pending: None }
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

    fn record(&mut self, side: i32, e: Element) {
        let (SetOutput::Relation(syn), Some(t)) = (&mut self.store, e.tuple) else { return };
        let lineage = [side, t.dense_id() as i32];
        match e.kind {
            Kind::Plus => syn.insert_tuple(t, &lineage),
            Kind::Minus => syn.delete_tuple(t),
            Kind::Heartbeat => {}
        }
    }
}

impl Operator for Union {
    fn run(&mut self, time_slice: usize) -> Result<()> {
        if let Some(e) = self.pending {
            if !self.try_emit(e) {
                return Ok(());
            }
            self.pending = None;
        }

        let mut consumed = 0;
        while consumed < time_slice {
            let left_ts = self.left.peek().map(|e| e.timestamp);
            let right_ts = self.right.peek().map(|e| e.timestamp);
            let (side, e) = match (left_ts, right_ts) {
                (None, None) => break,
                (Some(_), None) => (0, self.left.dequeue().unwrap()),
                (None, Some(_)) => (1, self.right.dequeue().unwrap()),
                (Some(l), Some(r)) if l <= r => (0, self.left.dequeue().unwrap()),
                (Some(_), Some(_)) => (1, self.right.dequeue().unwrap()),
            };
            consumed += 1;
            match side {
                0 => self.time.note_left(e.timestamp),
                _ => self.time.note_right(e.timestamp),
            }

            if e.kind == Kind::Heartbeat {
                continue;
            }
            self.record(side, e);
            if !self.try_emit(e) {
                self.pending = Some(e);
                return Ok(());
            }
        }

        self.time.maybe_heartbeat(&self.output, &mut self.mem.borrow_mut());
        Ok(())
    }
}

struct ExceptEntry {
    count: i32,
    identity: Option<TupleHandle>,
}

/// Signed-count multiset difference (spec §4.7.9): left PLUS/right MINUS add
/// to a distinct-key's count, right PLUS/left MINUS subtract. An output
/// PLUS fires on the non-positive-to-positive transition, an output MINUS
/// on the reverse, each carrying the tuple that caused the transition.
pub struct Except {
    left: InputPort,
    right: InputPort,
    output: OutputPort,
    mem: Rc<RefCell<MemoryManager>>,
    data_len: usize,
    counts: HashMap<Vec<u8>, ExceptEntry>,
    time: DualTimeTracker,
    pending: VecDeque<Element>,
}

impl Except {
    pub fn new(left: InputPort, right: InputPort, output: OutputPort, mem: Rc<RefCell<MemoryManager>>, data_len: usize) -> Self {
        Self { left, right, output, mem, data_len, counts: HashMap::new(), time: DualTimeTracker::default(), pending: VecDeque::new() }
    }

    fn key_of(&self, t: TupleHandle) -> Vec<u8> {
        self.mem.borrow().tuple_bytes(t, self.data_len).to_vec()
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

    fn apply(&mut self, side: i32, e: Element) {
        let Some(t) = e.tuple else { return };
        let delta = match (side, e.kind) {
            (0, Kind::Plus) | (1, Kind::Minus) => 1,
            (1, Kind::Plus) | (0, Kind::Minus) => -1,
            _ => return,
        };
        let key = self.key_of(t);
        let entry = self.counts.entry(key).or_insert(ExceptEntry { count: 0, identity: None });
        let old = entry.count;
        entry.count += delta;
        let new = entry.count;

        if old <= 0 && new > 0 {
            self.mem.borrow_mut().add_ref(self.mem.borrow().page_of(t), 1);
            entry.identity = Some(t);
            self.pending.push_back(Element::plus(t, e.timestamp));
        } else if old > 0 && new <= 0 {
            if let Some(identity) = entry.identity.take() {
                self.mem.borrow_mut().decr_ref(self.mem.borrow().page_of(identity));
                self.pending.push_back(Element::minus(identity, e.timestamp));
            }
        }
    }
}

impl Operator for Except {
    fn run(&mut self, time_slice: usize) -> Result<()> {
        if !self.try_drain_pending() {
            return Ok(());
        }

        let mut consumed = 0;
        while consumed < time_slice {
            let left_ts = self.left.peek().map(|e| e.timestamp);
            let right_ts = self.right.peek().map(|e| e.timestamp);
            let (side, e) = match (left_ts, right_ts) {
                (None, None) => break,
                (Some(_), None) => (0, self.left.dequeue().unwrap()),
                (None, Some(_)) => (1, self.right.dequeue().unwrap()),
                (Some(l), Some(r)) if l <= r => (0, self.left.dequeue().unwrap()),
                (Some(_), Some(_)) => (1, self.right.dequeue().unwrap()),
            };
            consumed += 1;
            match side {
                0 => self.time.note_left(e.timestamp),
                _ => self.time.note_right(e.timestamp),
            }

            if e.kind != Kind::Heartbeat {
                self.apply(side, e);
            }

            if !self.try_drain_pending() {
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
    use crate::queues::SimpleQueue;
    use crate::tuple::{write_int, PAGE_SIZE};

    fn push(mem: &Rc<RefCell<MemoryManager>>, q: &Rc<RefCell<SimpleQueue>>, v: i32, ts: u64) {
        let page = mem.borrow_mut().allocate_page().unwrap();
        let t = TupleHandle(page.0 * PAGE_SIZE);
        write_int(mem.borrow_mut().tuple_bytes_mut(t, 4), 0, v);
        q.borrow_mut().enqueue(Element::plus(t, ts));
    }

    #[test]
    fn union_forwards_both_sides_in_timestamp_order() {
        let mem = Rc::new(RefCell::new(MemoryManager::new(8 * PAGE_SIZE as usize)));
        let l_q = Rc::new(RefCell::new(SimpleQueue::new(1)));
        let r_q = Rc::new(RefCell::new(SimpleQueue::new(1)));
        let out_q = Rc::new(RefCell::new(SimpleQueue::new(1)));
        let mut u = Union::new(
            InputPort::Simple(l_q.clone()),
            InputPort::Simple(r_q.clone()),
            OutputPort::Simple(out_q.clone()),
            mem.clone(),
            SetOutput::Stream,
        );

        push(&mem, &l_q, 1, 2);
        push(&mem, &r_q, 2, 1);
        u.run(10).unwrap();

        assert_eq!(out_q.borrow_mut().dequeue().unwrap().timestamp, 1);
        assert_eq!(out_q.borrow_mut().dequeue().unwrap().timestamp, 2);
    }

    #[test]
    fn except_emits_plus_then_minus_on_sign_transition() {
        let mem = Rc::new(RefCell::new(MemoryManager::new(8 * PAGE_SIZE as usize)));
        let l_q = Rc::new(RefCell::new(SimpleQueue::new(1)));
        let r_q = Rc::new(RefCell::new(SimpleQueue::new(1)));
        let out_q = Rc::new(RefCell::new(SimpleQueue::new(1)));
        let mut ex = Except::new(
            InputPort::Simple(l_q.clone()),
            InputPort::Simple(r_q.clone()),
            OutputPort::Simple(out_q.clone()),
            mem.clone(),
            4,
        );

        push(&mem, &l_q, 1, 1);
        ex.run(10).unwrap();
        let e1 = out_q.borrow_mut().dequeue().unwrap();
        assert_eq!(e1.kind, Kind::Plus);

        push(&mem, &r_q, 1, 2);
        ex.run(10).unwrap();
        let e2 = out_q.borrow_mut().dequeue().unwrap();
        assert_eq!(e2.kind, Kind::Minus);
        assert_eq!(e2.timestamp, 2);
    }
}
