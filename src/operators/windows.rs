use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use super::{InputPort, Operator, OutputPort, TimeTracker};
use crate::memory::MemoryManager;
use crate::queues::{Element, Kind};
use crate::tuple::TupleHandle;
use crate::Result;

/// Common eviction-FIFO plumbing for [`RowWindow`]/[`TimeWindow`] (spec
/// §4.7.7). Tuples are tracked by the identical handle they arrived with —
/// no copy, no new allocation — so the MINUS a window emits on eviction
/// carries the same tuple pointer its PLUS carried in (spec §3's "Windows do
/// not change tuple identity"). The window takes its own page reference on
/// arrival and drops it on eviction, independent of the queue's own refcount
/// discipline.
struct Fifo {
    items: VecDeque<(TupleHandle, u64)>,
}

impl Fifo {
    fn new() -> Self {
        Self { items: VecDeque::new() }
    }

    fn push(&mut self, t: TupleHandle, ts: u64, mem: &mut MemoryManager) {
        mem.add_ref(mem.page_of(t), 1);
        self.items.push_back((t, ts));
    }

    fn pop_front(&mut self, mem: &mut MemoryManager) -> Option<(TupleHandle, u64)> {
        let front = self.items.pop_front();
        if let Some((t, _)) = front {
            mem.decr_ref(mem.page_of(t));
        }
        front
    }
}

/// Retains the last `n` tuples by arrival order, evicting the oldest past
/// the bound (spec §4.7.7's "Row window").
pub struct RowWindow {
    input: InputPort,
    output: OutputPort,
    mem: Rc<RefCell<MemoryManager>>,
    n: usize,
    fifo: Fifo,
    time: TimeTracker,
    pending: VecDeque<Element>,
}

impl RowWindow {
    pub fn new(input: InputPort, output: OutputPort, mem: Rc<RefCell<MemoryManager>>, n: usize) -> Self {
        Self { input, output, mem, n, fifo: Fifo::new(), time: TimeTracker::default(), pending: VecDeque::new() }
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
}

impl Operator for RowWindow {
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
                Kind::Heartbeat => continue,
                Kind::Minus => self.pending.push_back(e),
                Kind::Plus => {
                    let Some(t) = e.tuple else { continue };
                    self.fifo.push(t, e.timestamp, &mut self.mem.borrow_mut());
                    self.pending.push_back(e);
                    while self.fifo.items.len() > self.n {
                        let (evicted, _) = self.fifo.pop_front(&mut self.mem.borrow_mut()).unwrap();
                        self.pending.push_back(Element::minus(evicted, e.timestamp));
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

/// Retains every tuple whose timestamp is within `range` of the most recent
/// input timestamp, evicting anything older (spec §4.7.7's "Time window").
pub struct TimeWindow {
    input: InputPort,
    output: OutputPort,
    mem: Rc<RefCell<MemoryManager>>,
    range: u64,
    fifo: Fifo,
    time: TimeTracker,
    pending: VecDeque<Element>,
}

impl TimeWindow {
    pub fn new(input: InputPort, output: OutputPort, mem: Rc<RefCell<MemoryManager>>, range: u64) -> Self {
        Self { input, output, mem, range, fifo: Fifo::new(), time: TimeTracker::default(), pending: VecDeque::new() }
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
}

impl Operator for TimeWindow {
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
                Kind::Heartbeat => continue,
                Kind::Minus => self.pending.push_back(e),
                Kind::Plus => {
                    let Some(t) = e.tuple else { continue };
                    self.fifo.push(t, e.timestamp, &mut self.mem.borrow_mut());
                    self.pending.push_back(e);
                    let cutoff = e.timestamp.saturating_sub(self.range);
                    while self.fifo.items.front().is_some_and(|&(_, ts)| ts < cutoff) {
                        let (evicted, _) = self.fifo.pop_front(&mut self.mem.borrow_mut()).unwrap();
                        self.pending.push_back(Element::minus(evicted, e.timestamp));
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

/// A time window with `range = 1`: only the most recent instant's tuples
/// survive (spec §4.7.7's "degenerate time window with R = 1").
pub struct NowWindow(TimeWindow);

impl NowWindow {
    pub fn new(input: InputPort, output: OutputPort, mem: Rc<RefCell<MemoryManager>>) -> Self {
        Self(TimeWindow::new(input, output, mem, 1))
    }
}

impl Operator for NowWindow {
    fn run(&mut self, time_slice: usize) -> Result<()> {
        self.0.run(time_slice)
    }
}

/// Maintains an independent row window of size `n` per partition key (spec
/// §4.7.7's "Partition window"). The key is extracted as the concatenation
/// of `key_cols` byte ranges `(offset, len)` from the tuple's own schema.
pub struct PartitionWindow {
    input: InputPort,
    output: OutputPort,
    mem: Rc<RefCell<MemoryManager>>,
    data_len: usize,
    key_cols: Vec<(usize, usize)>,
    n: usize,
    partitions: HashMap<Vec<u8>, Fifo>,
    time: TimeTracker,
    pending: VecDeque<Element>,
}

impl PartitionWindow {
    pub fn new(
        input: InputPort,
        output: OutputPort,
        mem: Rc<RefCell<MemoryManager>>,
        data_len: usize,
        key_cols: Vec<(usize, usize)>,
        n: usize,
    ) -> Self {
        Self {
            input,
            output,
            mem,
            data_len,
            key_cols,
            n,
            partitions: HashMap::new(),
            time: TimeTracker::default(),
            pending: VecDeque::new(),
        }
    }

    fn key_of(&self, t: TupleHandle) -> Vec<u8> {
        let bytes = self.mem.borrow().tuple_bytes(t, self.data_len).to_vec();
        let mut key = Vec::new();
        for &(off, len) in &self.key_cols {
            key.extend_from_slice(&bytes[off..off + len]);
        }
        key
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
}

impl Operator for PartitionWindow {
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
                Kind::Heartbeat => continue,
                Kind::Minus => self.pending.push_back(e),
                Kind::Plus => {
                    let Some(t) = e.tuple else { continue };
                    let key = self.key_of(t);
                    let fifo = self.partitions.entry(key).or_insert_with(Fifo::new);
                    fifo.push(t, e.timestamp, &mut self.mem.borrow_mut());
                    self.pending.push_back(e);
                    while fifo.items.len() > self.n {
                        let (evicted, _) = fifo.pop_front(&mut self.mem.borrow_mut()).unwrap();
                        self.pending.push_back(Element::minus(evicted, e.timestamp));
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
    fn row_window_evicts_past_bound() {
        let mem = Rc::new(RefCell::new(MemoryManager::new(8 * PAGE_SIZE as usize)));
        let in_q = Rc::new(RefCell::new(SimpleQueue::new(1)));
        let out_q = Rc::new(RefCell::new(SimpleQueue::new(1)));
        let mut w = RowWindow::new(InputPort::Simple(in_q.clone()), OutputPort::Simple(out_q.clone()), mem.clone(), 1);

        push(&mem, &in_q, 1, 1);
        push(&mem, &in_q, 2, 2);
        w.run(10).unwrap();

        let e1 = out_q.borrow_mut().dequeue().unwrap();
        assert_eq!(e1.kind, Kind::Plus);
        let e2 = out_q.borrow_mut().dequeue().unwrap();
        assert_eq!(e2.kind, Kind::Minus);
        let e3 = out_q.borrow_mut().dequeue().unwrap();
        assert_eq!(e3.kind, Kind::Plus);
    }

    #[test]
    fn time_window_evicts_by_range() {
        let mem = Rc::new(RefCell::new(MemoryManager::new(8 * PAGE_SIZE as usize)));
        let in_q = Rc::new(RefCell::new(SimpleQueue::new(1)));
        let out_q = Rc::new(RefCell::new(SimpleQueue::new(1)));
        let mut w = TimeWindow::new(InputPort::Simple(in_q.clone()), OutputPort::Simple(out_q.clone()), mem.clone(), 2);

        push(&mem, &in_q, 1, 1);
        push(&mem, &in_q, 2, 5);
        w.run(10).unwrap();

        let e1 = out_q.borrow_mut().dequeue().unwrap();
        assert_eq!(e1.kind, Kind::Plus);
        assert_eq!(e1.timestamp, 1);
        let e2 = out_q.borrow_mut().dequeue().unwrap();
        assert_eq!(e2.kind, Kind::Minus);
        assert_eq!(e2.timestamp, 5);
        let e3 = out_q.borrow_mut().dequeue().unwrap();
        assert_eq!(e3.kind, Kind::Plus);
        assert_eq!(e3.timestamp, 5);
    }
}
