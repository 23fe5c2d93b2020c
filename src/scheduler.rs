//! The round-robin driver loop (spec §5: "single-threaded cooperative...
//! the scheduler invokes each operator's `run(time_slice)` in some order"):
//! a named, independently-registered unit of work driven to completion by
//! repeated bounded calls, with plain owned state rather than any
//! `Arc<RwLock<_>>` machinery, since spec §5 requires nothing more: "because
//! execution is single-threaded, no atomic or mutex primitives are required
//! inside the core."

use tracing::{debug, trace};

use crate::operators::Operator;
use crate::Result;

struct Entry {
    operator: Box<dyn Operator>,
    name: String,
}

/// Drives a fixed arena of operators, calling each one's `run(time_slice)`
/// once per tick in registration order. An operator that returns `Err`
/// (spec §4.7.10's source error) aborts the run immediately — "the
/// enclosing scheduler terminates the query."
pub struct Scheduler {
    entries: Vec<Entry>,
    time_slice: usize,
}

impl Scheduler {
    pub fn new(time_slice: usize) -> Self {
        Self { entries: Vec::new(), time_slice }
    }

    /// Registers an operator, keeping its [`Operator::name`] for diagnostics.
    pub fn add(&mut self, operator: Box<dyn Operator>) {
        let name = operator.name().to_string();
        self.entries.push(Entry { operator, name });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs every registered operator once, in order.
    pub fn tick(&mut self) -> Result<()> {
        for entry in &mut self.entries {
            trace!(operator = %entry.name, time_slice = self.time_slice, "running operator");
            entry.operator.run(self.time_slice)?;
        }
        Ok(())
    }

    /// Calls [`Self::tick`] up to `max_ticks` times, stopping early only on
    /// error. There is no notion of "done" at this level (sources can always
    /// produce more heartbeats); callers that want to stop after data is
    /// exhausted do so by bounding `max_ticks`.
    pub fn run_for(&mut self, max_ticks: usize) -> Result<()> {
        for tick in 0..max_ticks {
            debug!(tick, operators = self.entries.len(), "scheduler tick");
            self.tick()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::error::EngineError;

    struct Counter {
        calls: Rc<RefCell<usize>>,
    }

    impl Operator for Counter {
        fn run(&mut self, _time_slice: usize) -> Result<()> {
            *self.calls.borrow_mut() += 1;
            Ok(())
        }
    }

    struct Failing;

    impl Operator for Failing {
        fn run(&mut self, _time_slice: usize) -> Result<()> {
            Err(EngineError::SourceError("boom".into()))
        }
    }

    #[test]
    fn run_for_invokes_every_operator_once_per_tick() {
        let calls_a = Rc::new(RefCell::new(0));
        let calls_b = Rc::new(RefCell::new(0));
        let mut sched = Scheduler::new(4);
        sched.add(Box::new(Counter { calls: calls_a.clone() }));
        sched.add(Box::new(Counter { calls: calls_b.clone() }));

        sched.run_for(3).unwrap();

        assert_eq!(*calls_a.borrow(), 3);
        assert_eq!(*calls_b.borrow(), 3);
    }

    #[test]
    fn an_operator_error_aborts_the_run() {
        let calls = Rc::new(RefCell::new(0));
        let mut sched = Scheduler::new(4);
        sched.add(Box::new(Counter { calls: calls.clone() }));
        sched.add(Box::new(Failing));

        assert!(sched.run_for(5).is_err());
        // The failing operator ran right after the first counter on tick 1,
        // so the counter only advanced once before the whole run aborted.
        assert_eq!(*calls.borrow(), 1);
    }
}
