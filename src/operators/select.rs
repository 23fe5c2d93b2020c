use std::cell::RefCell;
use std::rc::Rc;

use super::{InputPort, Operator, OutputPort, TimeTracker};
use crate::eval::{role, BEval, EvalContext};
use crate::memory::MemoryManager;
use crate::queues::{Element, Kind};
use crate::Result;

/// Applies a conjunctive [`BEval`] to each input element; forwards PLUS/MINUS
/// unchanged (preserving the tuple pointer) when the predicate holds, drops
/// otherwise (spec §4.7.1). No synopsis, and the only stall state needed is
/// "one element is waiting to be re-emitted" since a single input never
/// produces more than one output. `consts` is bound under `role::CONST`
/// before every predicate evaluation, the same way `GroupByAggregation`
/// exposes its literals, so a plan can express e.g. `a > 10` without folding
/// the threshold into the tuple itself.
pub struct Select {
    input: InputPort,
    output: OutputPort,
    mem: Rc<RefCell<MemoryManager>>,
    predicate: BEval,
    data_len: usize,
    consts: Vec<u8>,
    time: TimeTracker,
    pending: Option<Element>,
}

impl Select {
    pub fn new(
        input: InputPort,
        output: OutputPort,
        mem: Rc<RefCell<MemoryManager>>,
        predicate: BEval,
        data_len: usize,
        consts: Vec<u8>,
    ) -> Self {
        Self { input, output, mem, predicate, data_len, consts, time: TimeTracker::default(), pending: None }
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

impl Operator for Select {
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

            match e.kind {
                Kind::Heartbeat => continue,
                Kind::Plus | Kind::Minus => {
                    let Some(t) = e.tuple else { continue };
                    let bytes = self.mem.borrow().tuple_bytes(t, self.data_len).to_vec();
                    let mut ctx = EvalContext::new();
                    ctx.bind(role::INPUT, bytes);
                    ctx.bind(role::CONST, self.consts.clone());
                    if !self.predicate.eval(&mut ctx) {
                        continue;
                    }
                    if !self.try_emit(e) {
                        self.pending = Some(e);
                        return Ok(());
                    }
                }
            }
        }

        self.time.maybe_heartbeat(&self.output, &mut self.mem.borrow_mut());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{BInstr, BOp};
    use crate::queues::SimpleQueue;
    use crate::tuple::{write_int, TupleHandle, PAGE_SIZE};

    #[test]
    fn passthrough_scenario_a() {
        // Spec §8 scenario A: Select(a > 10) over a=5,20,15 at ts 1,2,3. The
        // threshold (10) is a plan-supplied constant bound under role::CONST.
        //
        // Scenario A's prose lists a trailing `HEARTBEAT(ts=3)` after the two
        // PLUSes, but the normative rule it's illustrating (§4.7 point 4) only
        // fires a heartbeat when the output queue's last-emitted timestamp
        // *lags* the last input timestamp — and here the second PLUS already
        // carries ts=3, so last_output_ts == last_input_ts == 3 and no
        // heartbeat is due. Following the strict rule (the one testable
        // property 4 is phrased against, and the one every operator in this
        // crate actually implements) over the scenario's prose: a heartbeat at
        // the same timestamp as the data element that just advanced time to
        // it would be redundant, not a distinct progress signal.
        let mem = Rc::new(RefCell::new(MemoryManager::new(4 * PAGE_SIZE as usize)));
        let in_q = Rc::new(RefCell::new(SimpleQueue::new(1)));
        let out_q = Rc::new(RefCell::new(SimpleQueue::new(1)));

        let mut pred = BEval::new();
        pred.push(BInstr::cmp(BOp::IntGt, role::INPUT, 0, role::CONST, 0)).unwrap();

        let mut threshold = vec![0u8; 4];
        write_int(&mut threshold, 0, 10);

        let mut select = Select::new(
            InputPort::Simple(in_q.clone()),
            OutputPort::Simple(out_q.clone()),
            mem.clone(),
            pred,
            4,
            threshold,
        );

        let mut push = |a: i32, ts: u64| {
            let page = mem.borrow_mut().allocate_page().unwrap();
            let t = TupleHandle(page.0 * PAGE_SIZE);
            let mut buf = vec![0u8; 4];
            write_int(&mut buf, 0, a);
            mem.borrow_mut().tuple_bytes_mut(t, 4).copy_from_slice(&buf);
            in_q.borrow_mut().enqueue(Element::plus(t, ts));
        };
        push(5, 1);
        push(20, 2);
        push(15, 3);

        select.run(10).unwrap();

        let e1 = out_q.borrow_mut().dequeue().unwrap();
        assert_eq!(e1.timestamp, 2);
        let e2 = out_q.borrow_mut().dequeue().unwrap();
        assert_eq!(e2.timestamp, 3);
        // No trailing heartbeat: the PLUS at ts=3 already carries the last
        // input timestamp, so last_output_ts == last_input_ts and §4.7 point
        // 4's strict lag check has nothing left to advance.
        assert!(out_q.borrow_mut().dequeue().is_none());
    }
}
