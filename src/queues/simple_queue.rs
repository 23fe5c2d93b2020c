use super::Element;

/// One writer, one reader. A ring of `Element`s across a configured number
/// of pages worth of capacity (spec §4.2). Strict FIFO; `enqueue` fails
/// when full, `dequeue`/`peek` return `None` when empty.
pub struct SimpleQueue {
    buf: Vec<Option<Element>>,
    capacity: usize,
    head: usize,
    len: usize,
}

/// Elements per page, chosen so the ring's total capacity scales with
/// `num_pages` the way the reference's page-linked ring does, without this
/// crate needing to actually carve the ring out of `MemoryManager` pages
/// (the queue holds `Element` values directly; see DESIGN.md).
pub const ELEMENTS_PER_PAGE: usize = 128;

impl SimpleQueue {
    pub fn new(num_pages: usize) -> Self {
        let capacity = (num_pages * ELEMENTS_PER_PAGE).max(1);
        Self {
            buf: vec![None; capacity],
            capacity,
            head: 0,
            len: 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `false` (not accepted) when the queue is full.
    pub fn enqueue(&mut self, e: Element) -> bool {
        if self.is_full() {
            return false;
        }
        let tail = (self.head + self.len) % self.capacity;
        self.buf[tail] = Some(e);
        self.len += 1;
        true
    }

    pub fn dequeue(&mut self) -> Option<Element> {
        if self.is_empty() {
            return None;
        }
        let e = self.buf[self.head].take();
        self.head = (self.head + 1) % self.capacity;
        self.len -= 1;
        e
    }

    pub fn peek(&self) -> Option<&Element> {
        if self.is_empty() {
            None
        } else {
            self.buf[self.head].as_ref()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::TupleHandle;

    #[test]
    fn fifo_order_preserved() {
        let mut q = SimpleQueue::new(1);
        for i in 0..3u64 {
            assert!(q.enqueue(Element::plus(TupleHandle(i as u32), i)));
        }
        for i in 0..3u64 {
            assert_eq!(q.dequeue().unwrap().timestamp, i);
        }
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn enqueue_fails_when_full() {
        let mut q = SimpleQueue::new(0); // capacity clamped to 1
        assert!(q.enqueue(Element::heartbeat(1)));
        assert!(!q.enqueue(Element::heartbeat(2)));
    }

    #[test]
    fn peek_does_not_advance() {
        let mut q = SimpleQueue::new(1);
        q.enqueue(Element::heartbeat(7));
        assert_eq!(q.peek().unwrap().timestamp, 7);
        assert_eq!(q.peek().unwrap().timestamp, 7);
        assert_eq!(q.dequeue().unwrap().timestamp, 7);
    }

    #[test]
    fn wraps_around_ring() {
        let mut q = SimpleQueue::new(1); // capacity 128
        for i in 0..200u64 {
            if !q.enqueue(Element::heartbeat(i)) {
                assert_eq!(q.dequeue().unwrap().timestamp, i - 128);
                assert!(q.enqueue(Element::heartbeat(i)));
            }
        }
    }
}
