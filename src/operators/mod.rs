//! Operators (spec §4.7): state machines that consume input queues, update
//! synopses, and produce output queues, each driven by a bounded
//! `run(time_slice)` call (spec §5). Grounded on
//! `original_source/dsms/src/execution/operators/*.cc` for the per-operator
//! algorithms, with builder-style construction and `#[cfg(test)]` placement
//! matching this crate's usual vocabulary.

mod aggregate;
mod join;
mod project;
mod select;
mod set_ops;
mod source_sink;
mod stream_relation;
mod windows;

pub use aggregate::{Distinct, GroupByAggregation};
pub use join::{BinaryJoin, JoinOutput, StreamRelationJoin};
pub use project::{Project, ProjectOutput};
pub use select::Select;
pub use set_ops::{Except, SetOutput, Union};
pub use source_sink::{RelationSource, Sink, StreamSource, TableSource};
pub use stream_relation::{Dstream, Istream, Rstream};
pub use windows::{NowWindow, PartitionWindow, RowWindow, TimeWindow};

use std::cell::RefCell;
use std::rc::Rc;

use crate::memory::MemoryManager;
use crate::queues::{Element, SharedQueueReader, SharedQueueWriter, SimpleQueue};
use crate::Result;

/// Every operator implements this; the scheduler (§4.7/§5a) calls it in a
/// round-robin loop, bounding each call's work by `time_slice`.
pub trait Operator {
    fn run(&mut self, time_slice: usize) -> Result<()>;

    /// A short label for scheduler diagnostics/logging. Defaults to the
    /// type name.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// The consuming end of a queue: either side of a [`SimpleQueue`] or one
/// reader of a [`crate::queues::SharedQueue`]. An operator with two inputs
/// (joins, union, except) holds two of these.
#[derive(Clone)]
pub enum InputPort {
    Simple(Rc<RefCell<SimpleQueue>>),
    Shared(SharedQueueReader),
}

impl InputPort {
    pub fn peek(&self) -> Option<Element> {
        match self {
            InputPort::Simple(q) => q.borrow().peek().copied(),
            InputPort::Shared(r) => r.peek(),
        }
    }

    pub fn dequeue(&self) -> Option<Element> {
        match self {
            InputPort::Simple(q) => q.borrow_mut().dequeue(),
            InputPort::Shared(r) => r.dequeue(),
        }
    }
}

/// The producing end of a queue (spec §4.2). `enqueue` on the `Shared`
/// variant takes `&mut MemoryManager` because the writer must bump the
/// tuple's page refcount by `numReaders - 1` (spec §3's refcount discipline).
#[derive(Clone)]
pub enum OutputPort {
    Simple(Rc<RefCell<SimpleQueue>>),
    Shared(SharedQueueWriter),
}

impl OutputPort {
    pub fn is_full(&self) -> bool {
        match self {
            OutputPort::Simple(q) => q.borrow().is_full(),
            OutputPort::Shared(w) => w.is_full(),
        }
    }

    pub fn enqueue(&self, e: Element, mem: &mut MemoryManager) -> bool {
        match self {
            OutputPort::Simple(q) => q.borrow_mut().enqueue(e),
            OutputPort::Shared(w) => w.enqueue(e, mem),
        }
    }
}

/// Tracks each operator's last-seen-input and last-emitted-output
/// timestamps, the two numbers the heartbeat rule (spec §4.7 point 4)
/// compares.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeTracker {
    pub last_input_ts: u64,
    pub last_output_ts: u64,
}

impl TimeTracker {
    pub fn note_input(&mut self, ts: u64) {
        if ts > self.last_input_ts {
            self.last_input_ts = ts;
        }
    }

    pub fn note_output(&mut self, ts: u64) {
        if ts > self.last_output_ts {
            self.last_output_ts = ts;
        }
    }

    /// At `run` exit, if the output queue has room and output time lags
    /// input time, emit a heartbeat (spec §4.7 point 4: "the only mechanism
    /// by which time advances downstream during quiet periods"). Returns
    /// whether a heartbeat was emitted.
    pub fn maybe_heartbeat(&mut self, out: &OutputPort, mem: &mut MemoryManager) -> bool {
        if !out.is_full() && self.last_input_ts > self.last_output_ts {
            let ts = self.last_input_ts;
            if out.enqueue(Element::heartbeat(ts), mem) {
                self.last_output_ts = ts;
                return true;
            }
        }
        false
    }
}

/// Like [`TimeTracker`] but for an operator with two independent inputs
/// (binary join's outer/inner, union/except's left/right). Spec §4.7.3:
/// "at `run` exit, emit a HEARTBEAT with `min(lastOuterTs, lastInnerTs)` if
/// it exceeds `lastOutputTs`" — collapsing both sides into one max, as a
/// single-input [`TimeTracker`] would, lets the operator heartbeat past a
/// timestamp the *other* side hasn't reached yet, which a later
/// equal-or-earlier element on that side would then violate (spec §8
/// testable property 3, timestamp monotonicity).
#[derive(Debug, Clone, Copy, Default)]
pub struct DualTimeTracker {
    pub last_left_ts: u64,
    pub last_right_ts: u64,
    pub last_output_ts: u64,
}

impl DualTimeTracker {
    pub fn note_left(&mut self, ts: u64) {
        if ts > self.last_left_ts {
            self.last_left_ts = ts;
        }
    }

    pub fn note_right(&mut self, ts: u64) {
        if ts > self.last_right_ts {
            self.last_right_ts = ts;
        }
    }

    pub fn note_output(&mut self, ts: u64) {
        if ts > self.last_output_ts {
            self.last_output_ts = ts;
        }
    }

    /// Mirrors [`TimeTracker::maybe_heartbeat`], but gates on the minimum of
    /// the two inputs' last-seen timestamps rather than a single one.
    pub fn maybe_heartbeat(&mut self, out: &OutputPort, mem: &mut MemoryManager) -> bool {
        let ts = self.last_left_ts.min(self.last_right_ts);
        if !out.is_full() && ts > self.last_output_ts {
            if out.enqueue(Element::heartbeat(ts), mem) {
                self.last_output_ts = ts;
                return true;
            }
        }
        false
    }
}
