use std::cell::RefCell;
use std::rc::Rc;

use super::{InputPort, Operator, OutputPort, TimeTracker};
use crate::error::{EngineError, Result};
use crate::eval::{role, BEval, BInstr, BOp, EvalContext, HEval, HInstr};
use crate::index::HashIndex;
use crate::memory::MemoryManager;
use crate::queues::Element;
use crate::storage::{RelationStore, SimpleStore, StorageAlloc};
use crate::synopsis::{RelationSynopsis, ScanSpec};
use crate::tuple::{decode_record, read_u64, AttrType, Schema, TIMESTAMP_SIZE};

/// An external byte-record feed a [`StreamSource`] or [`RelationSource`]
/// reads from (spec §4.7.10). Instantiation and connection to an actual
/// external feed are out of scope for this spec; this is the seam a plan
/// supplies a concrete reader through.
pub trait TableSource {
    /// Returns the next raw record, or `None` if none is available right
    /// now (not necessarily end-of-stream: a later call may succeed).
    fn read_record(&mut self) -> Option<Vec<u8>>;
}

/// Builds a hash index over every attribute of `schema` (spec §4.7.10's
/// "indexed over all attributes"), used by [`RelationSource`] to resolve an
/// incoming MINUS record back to the tuple pointer its matching PLUS
/// produced. Float columns are excluded from the hash (per [`HEval`]'s own
/// restriction) but still checked for exact equality once a bucket is found.
fn build_identity_index(schema: &Schema, threshold: f64) -> Result<HashIndex> {
    let mut update_h = HEval::new();
    let mut scan_h = HEval::new();
    let mut key_eq = BEval::new();
    for attr in &schema.attrs {
        if !matches!(attr.ty, AttrType::Float) {
            update_h.push(HInstr { ty: attr.ty, role: role::UPDATE, col: attr.offset })?;
            scan_h.push(HInstr { ty: attr.ty, role: role::SCAN, col: attr.offset })?;
        }
        let cmp = match attr.ty {
            AttrType::Int => BInstr::cmp(BOp::IntEq, role::SCAN, attr.offset, role::KEY, attr.offset),
            AttrType::Float => BInstr::cmp(BOp::FltEq, role::SCAN, attr.offset, role::KEY, attr.offset),
            AttrType::Byte => BInstr::cmp(BOp::BytEq, role::SCAN, attr.offset, role::KEY, attr.offset),
            AttrType::Char(n) => BInstr::chr_cmp(BOp::ChrEq, role::SCAN, attr.offset, role::KEY, attr.offset, n as usize),
        };
        key_eq.push(cmp)?;
    }
    Ok(HashIndex::new(update_h, scan_h, key_eq, threshold))
}

fn source_error(msg: impl Into<String>) -> EngineError {
    EngineError::SourceError(msg.into())
}

/// Reads fixed-format records (timestamp header + fixed-length attributes,
/// spec §6) from a [`TableSource`], decodes each into a freshly allocated
/// output tuple, and enqueues a PLUS carrying the record's own timestamp
/// (spec §4.7.10).
pub struct StreamSource {
    source: Box<dyn TableSource>,
    output: OutputPort,
    mem: Rc<RefCell<MemoryManager>>,
    store: SimpleStore,
    schema: Schema,
    time: TimeTracker,
    pending: Option<Element>,
}

impl StreamSource {
    pub fn new(source: Box<dyn TableSource>, output: OutputPort, mem: Rc<RefCell<MemoryManager>>, schema: Schema) -> Result<Self> {
        let store = SimpleStore::new(mem.clone(), schema.data_len)?;
        Ok(Self { source, output, mem, store, schema, time: TimeTracker::default(), pending: None })
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

    fn decode_header(&self, record: &[u8]) -> Result<u64> {
        if record.len() < TIMESTAMP_SIZE {
            return Err(source_error(format!(
                "record length {} is shorter than the {TIMESTAMP_SIZE}-byte timestamp header",
                record.len()
            )));
        }
        let ts = read_u64(record, 0);
        if ts < self.time.last_input_ts {
            return Err(source_error(format!(
                "record timestamp {ts} precedes the previously seen timestamp {}",
                self.time.last_input_ts
            )));
        }
        Ok(ts)
    }
}

impl Operator for StreamSource {
    fn run(&mut self, time_slice: usize) -> Result<()> {
        if let Some(e) = self.pending {
            if !self.try_emit(e) {
                return Ok(());
            }
            self.pending = None;
        }

        let mut consumed = 0;
        while consumed < time_slice {
            let Some(record) = self.source.read_record() else { break };
            consumed += 1;

            let ts = self.decode_header(&record)?;
            let attrs = decode_record(&self.schema, &record[TIMESTAMP_SIZE..])?;
            self.time.note_input(ts);

            let handle = self.store.new_tuple()?;
            self.store.write_tuple(handle, &attrs);
            let e = Element::plus(handle, ts);
            if !self.try_emit(e) {
                self.pending = Some(e);
                return Ok(());
            }
        }

        self.time.maybe_heartbeat(&self.output, &mut self.mem.borrow_mut());
        Ok(())
    }
}

/// Like [`StreamSource`], but each record carries a sign byte (spec
/// §4.7.10): PLUS records allocate, insert into an own identity-indexed
/// relation synopsis, and enqueue; MINUS records resolve the matching
/// previously-inserted tuple pointer via that same index so the MINUS
/// carries it onward unchanged.
pub struct RelationSource {
    source: Box<dyn TableSource>,
    output: OutputPort,
    mem: Rc<RefCell<MemoryManager>>,
    syn: RelationSynopsis,
    identity_scan: usize,
    schema: Schema,
    time: TimeTracker,
    pending: Option<Element>,
}

impl RelationSource {
    pub fn new(
        source: Box<dyn TableSource>,
        output: OutputPort,
        mem: Rc<RefCell<MemoryManager>>,
        schema: Schema,
        index_load_threshold: f64,
    ) -> Result<Self> {
        let store = Rc::new(RefCell::new(RelationStore::new(mem.clone(), schema.data_len, 1)?));
        let mut syn = RelationSynopsis::new(store, 0);
        let index = build_identity_index(&schema, index_load_threshold)?;
        let idx = syn.attach_index(index);
        let identity_scan = syn.declare_scan(ScanSpec::indexed(idx));
        Ok(Self { source, output, mem, syn, identity_scan, schema, time: TimeTracker::default(), pending: None })
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

    fn decode_header(&self, record: &[u8]) -> Result<(u64, u8)> {
        if record.len() < TIMESTAMP_SIZE + 1 {
            return Err(source_error(format!(
                "record length {} is shorter than the {}-byte timestamp+sign header",
                record.len(),
                TIMESTAMP_SIZE + 1
            )));
        }
        let ts = read_u64(record, 0);
        if ts < self.time.last_input_ts {
            return Err(source_error(format!(
                "record timestamp {ts} precedes the previously seen timestamp {}",
                self.time.last_input_ts
            )));
        }
        let sign = record[TIMESTAMP_SIZE];
        if sign != b'+' && sign != b'-' {
            return Err(source_error(format!("sign byte {sign:#x} is neither '+' nor '-'")));
        }
        Ok((ts, sign))
    }
}

impl Operator for RelationSource {
    fn run(&mut self, time_slice: usize) -> Result<()> {
        if let Some(e) = self.pending {
            if !self.try_emit(e) {
                return Ok(());
            }
            self.pending = None;
        }

        let mut consumed = 0;
        while consumed < time_slice {
            let Some(record) = self.source.read_record() else { break };
            consumed += 1;

            let (ts, sign) = self.decode_header(&record)?;
            let attrs = decode_record(&self.schema, &record[TIMESTAMP_SIZE + 1..])?;
            self.time.note_input(ts);

            let e = if sign == b'+' {
                let handle = self.syn.new_tuple()?;
                self.syn.write_tuple(handle, &attrs);
                self.syn.insert_tuple(handle);
                Element::plus(handle, ts)
            } else {
                let mut ctx = EvalContext::new();
                ctx.bind(role::SCAN, attrs);
                let Some(handle) = self.syn.get_scan(self.identity_scan, &mut ctx).into_iter().next() else {
                    return Err(source_error("MINUS record does not match any previously inserted tuple"));
                };
                self.syn.delete_tuple(handle);
                Element::minus(handle, ts)
            };

            if !self.try_emit(e) {
                self.pending = Some(e);
                return Ok(());
            }
        }

        self.time.maybe_heartbeat(&self.output, &mut self.mem.borrow_mut());
        Ok(())
    }
}

/// Dequeues and releases a page reference per element; the terminal
/// operator of every plan (spec §4.7.10: "sinks simply dequeue and release
/// refcounts").
pub struct Sink {
    input: InputPort,
    mem: Rc<RefCell<MemoryManager>>,
}

impl Sink {
    pub fn new(input: InputPort, mem: Rc<RefCell<MemoryManager>>) -> Self {
        Self { input, mem }
    }
}

impl Operator for Sink {
    fn run(&mut self, time_slice: usize) -> Result<()> {
        let mut consumed = 0;
        while consumed < time_slice {
            let Some(e) = self.input.dequeue() else { break };
            consumed += 1;
            if let Some(t) = e.tuple {
                let page = self.mem.borrow().page_of(t);
                self.mem.borrow_mut().decr_ref(page);
            }
        }
        Ok(())
    }
}
