use std::cell::RefCell;
use std::rc::Rc;

use super::{Element, Kind};
use crate::memory::MemoryManager;
use crate::Config;

use super::simple_queue::ELEMENTS_PER_PAGE;

const MAX_READERS: usize = Config::MAX_READERS_PER_SHARED_QUEUE;

/// One writer, up to [`MAX_READERS`] readers (spec §4.2). Tracks one
/// enqueue cursor/counter and one dequeue cursor/counter per reader, plus a
/// cached "slowest reader" index whose dequeue count bounds the writer.
///
/// The physical ring position (`write_pos` / `read_pos`) advances
/// monotonically and is never renormalised — renormalisation only touches
/// the bookkeeping counters (`total_enqueued` / `total_dequeued`) used to
/// detect fullness and the slowest reader, exactly mirroring the
/// reference's counter-overflow-avoidance algorithm without risking a
/// physical/logical position mismatch.
pub struct SharedQueue {
    buf: Vec<Option<Element>>,
    capacity: usize,
    write_pos: u64,
    read_pos: [u64; MAX_READERS],
    total_enqueued: u64,
    total_dequeued: [u64; MAX_READERS],
    num_readers: usize,
    slowest_reader: usize,
}

impl SharedQueue {
    pub fn new(num_pages: usize, num_readers: usize) -> Self {
        assert!(num_readers >= 1 && num_readers <= MAX_READERS);
        let capacity = (num_pages * ELEMENTS_PER_PAGE).max(1);
        Self {
            buf: vec![None; capacity],
            capacity,
            write_pos: 0,
            read_pos: [0; MAX_READERS],
            total_enqueued: 0,
            total_dequeued: [0; MAX_READERS],
            num_readers,
            slowest_reader: 0,
        }
    }

    pub fn num_readers(&self) -> usize {
        self.num_readers
    }

    pub fn is_full(&self) -> bool {
        (self.total_enqueued - self.total_dequeued[self.slowest_reader]) as usize == self.capacity
    }

    pub fn is_empty(&self, reader: usize) -> bool {
        self.total_enqueued == self.total_dequeued[reader]
    }

    /// Returns `false` (not accepted) when the slowest reader hasn't
    /// drained enough to make room.
    pub fn enqueue(&mut self, e: Element) -> bool {
        if self.is_full() {
            return false;
        }
        let idx = (self.write_pos % self.capacity as u64) as usize;
        self.buf[idx] = Some(e);
        self.write_pos += 1;
        self.total_enqueued += 1;
        true
    }

    pub fn peek(&self, reader: usize) -> Option<&Element> {
        if self.is_empty(reader) {
            return None;
        }
        let idx = (self.read_pos[reader] % self.capacity as u64) as usize;
        self.buf[idx].as_ref()
    }

    pub fn dequeue(&mut self, reader: usize) -> Option<Element> {
        if self.is_empty(reader) {
            return None;
        }
        let idx = (self.read_pos[reader] % self.capacity as u64) as usize;
        let e = self.buf[idx];
        self.read_pos[reader] += 1;

        if reader == self.slowest_reader {
            let d = self.total_dequeued[reader];
            for r in 0..self.num_readers {
                self.total_dequeued[r] -= d;
                if r != reader && self.total_dequeued[r] == 0 {
                    self.slowest_reader = r;
                }
            }
            self.total_enqueued -= d;
            self.total_dequeued[reader] = 1;
        } else {
            self.total_dequeued[reader] += 1;
        }
        e
    }
}

/// The writer-side handle (mirrors the reference's `SharedQueueWriter`). On
/// enqueue of a data element, bumps the tuple's page refcount by
/// `numReaders - 1` so that every reader's eventual release balances back
/// to zero (spec §3, "Refcount discipline"). `Clone` just hands out another
/// reference to the same underlying queue — there is still exactly one
/// writer's worth of state, since all of it lives behind the shared `Rc`.
#[derive(Clone)]
pub struct SharedQueueWriter {
    inner: Rc<RefCell<SharedQueue>>,
}

impl SharedQueueWriter {
    pub fn new(inner: Rc<RefCell<SharedQueue>>) -> Self {
        Self { inner }
    }

    pub fn enqueue(&self, e: Element, mem: &mut MemoryManager) -> bool {
        let mut q = self.inner.borrow_mut();
        let extra = q.num_readers.saturating_sub(1) as u32;
        if e.kind != Kind::Heartbeat {
            if let Some(t) = e.tuple {
                if extra > 0 {
                    mem.add_ref(mem.page_of(t), extra);
                }
            }
        }
        q.enqueue(e)
    }

    pub fn is_full(&self) -> bool {
        self.inner.borrow().is_full()
    }
}

/// The reader-side handle (mirrors the reference's `SharedQueueReader`).
#[derive(Clone)]
pub struct SharedQueueReader {
    inner: Rc<RefCell<SharedQueue>>,
    reader_id: usize,
}

impl SharedQueueReader {
    pub fn new(inner: Rc<RefCell<SharedQueue>>, reader_id: usize) -> Self {
        Self { inner, reader_id }
    }

    pub fn dequeue(&self) -> Option<Element> {
        self.inner.borrow_mut().dequeue(self.reader_id)
    }

    pub fn peek(&self) -> Option<Element> {
        self.inner.borrow().peek(self.reader_id).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty(self.reader_id)
    }
}
