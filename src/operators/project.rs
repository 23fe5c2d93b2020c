use std::cell::RefCell;
use std::rc::Rc;

use super::{InputPort, Operator, OutputPort, TimeTracker};
use crate::eval::{role, AEval, EvalContext};
use crate::memory::MemoryManager;
use crate::queues::{Element, Kind};
use crate::storage::{SimpleStore, StorageAlloc};
use crate::synopsis::LineageSynopsis;
use crate::tuple::TupleHandle;
use crate::Result;

/// Whether the projection's output feeds a stream consumer (fresh output
/// tuple per input, no tuple-identity tracking needed) or a relation
/// consumer (MINUS must resolve to the exact tuple a prior PLUS produced,
/// spec §4.7.2).
pub enum ProjectOutput {
    Stream(SimpleStore),
    Relation(LineageSynopsis),
}

/// Runs an output-constructor [`AEval`] per input element (spec §4.7.2).
/// Stream mode allocates a fresh output tuple per element. Relation mode
/// additionally keys a lineage synopsis by the input tuple's id so a later
/// MINUS reproduces the identical output tuple pointer (spec §8 property 2).
pub struct Project {
    input: InputPort,
    output: OutputPort,
    mem: Rc<RefCell<MemoryManager>>,
    constructor: AEval,
    input_len: usize,
    output_len: usize,
    store: ProjectOutput,
    time: TimeTracker,
    pending: Option<Element>,
}

impl Project {
    pub fn new(
        input: InputPort,
        output: OutputPort,
        mem: Rc<RefCell<MemoryManager>>,
        constructor: AEval,
        input_len: usize,
        output_len: usize,
        store: ProjectOutput,
    ) -> Self {
        Self {
            input,
            output,
            mem,
            constructor,
            input_len,
            output_len,
            store,
            time: TimeTracker::default(),
            pending: None,
        }
    }

    fn construct(&mut self, input: TupleHandle) -> Result<TupleHandle> {
        let in_bytes = self.mem.borrow().tuple_bytes(input, self.input_len).to_vec();
        let mut ctx = EvalContext::new();
        ctx.bind(role::INPUT, in_bytes);
        ctx.bind(role::OUTPUT, vec![0u8; self.output_len]);
        self.constructor.eval(&mut ctx);
        let out_bytes = ctx.role(role::OUTPUT).to_vec();
        let handle = match &mut self.store {
            ProjectOutput::Stream(s) => s.new_tuple()?,
            ProjectOutput::Relation(syn) => syn.new_tuple()?,
        };
        match &mut self.store {
            ProjectOutput::Stream(s) => s.write_tuple(handle, &out_bytes),
            ProjectOutput::Relation(syn) => syn.write_tuple(handle, &out_bytes),
        }
        Ok(handle)
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

impl Operator for Project {
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

            let out_elem = match e.kind {
                Kind::Heartbeat => continue,
                Kind::Plus => {
                    let Some(t) = e.tuple else { continue };
                    let out_t = self.construct(t)?;
                    if let ProjectOutput::Relation(syn) = &mut self.store {
                        syn.insert_tuple(out_t, &[t.dense_id() as i32]);
                    }
                    Element::plus(out_t, e.timestamp)
                }
                Kind::Minus => {
                    let Some(t) = e.tuple else { continue };
                    match &mut self.store {
                        ProjectOutput::Stream(s) => {
                            let out_t = self.construct_for_minus(t, s)?;
                            Element::minus(out_t, e.timestamp)
                        }
                        ProjectOutput::Relation(syn) => {
                            let lineage = [t.dense_id() as i32];
                            let out_t = syn.get_tuple(&lineage).unwrap_or(t);
                            syn.delete_tuple(out_t);
                            Element::minus(out_t, e.timestamp)
                        }
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

impl Project {
    /// Stream-mode MINUS has no identity to preserve (spec §3's relaxation:
    /// "operators that produce only to stream consumers may ... allocate a
    /// fresh tuple for the MINUS"), so it just re-runs the constructor.
    fn construct_for_minus(&mut self, input: TupleHandle, _s: &mut SimpleStore) -> Result<TupleHandle> {
        self.construct(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{role, AInstr, AOp};
    use crate::queues::SimpleQueue;
    use crate::tuple::{write_int, PAGE_SIZE};

    #[test]
    fn stream_mode_doubles_input_column() {
        let mem = Rc::new(RefCell::new(MemoryManager::new(8 * PAGE_SIZE as usize)));
        let in_q = Rc::new(RefCell::new(SimpleQueue::new(1)));
        let out_q = Rc::new(RefCell::new(SimpleQueue::new(1)));
        let store = SimpleStore::new(mem.clone(), 4).unwrap();

        let mut ctor = AEval::new();
        ctor.push(AInstr::binary(AOp::IntAdd, role::INPUT, 0, role::INPUT, 0, role::OUTPUT, 0)).unwrap();

        let mut project = Project::new(
            InputPort::Simple(in_q.clone()),
            OutputPort::Simple(out_q.clone()),
            mem.clone(),
            ctor,
            4,
            4,
            ProjectOutput::Stream(store),
        );

        let page = mem.borrow_mut().allocate_page().unwrap();
        let t = TupleHandle(page.0 * PAGE_SIZE);
        write_int(mem.borrow_mut().tuple_bytes_mut(t, 4), 0, 21);
        in_q.borrow_mut().enqueue(Element::plus(t, 1));

        project.run(10).unwrap();
        let e = out_q.borrow_mut().dequeue().unwrap();
        let bytes = mem.borrow().tuple_bytes(e.tuple.unwrap(), 4).to_vec();
        assert_eq!(crate::tuple::read_int(&bytes, 0), 42);
    }
}
