//! Demonstration binary (ambient, not part of the core): builds one fixed
//! plan in-process and runs it to completion, logging progress via
//! `tracing`. Accepts no CLI flags and persists no state.

use std::collections::{HashMap, VecDeque};

use cq_engine::eval::{role, BEval, BInstr, BOp};
use cq_engine::operators::TableSource;
use cq_engine::plan::{Engine, NodeKind, NodeSpec, PlanDescriptor};
use cq_engine::tuple::{AttrType, Schema};
use cq_engine::{Config, Result};
use tracing::info;

/// Replays a fixed list of already-encoded records, one per call.
struct FixedSource {
    records: VecDeque<Vec<u8>>,
}

impl TableSource for FixedSource {
    fn read_record(&mut self) -> Option<Vec<u8>> {
        self.records.pop_front()
    }
}

fn encode_plus(ts: u64, reading: i32) -> Vec<u8> {
    let mut buf = ts.to_le_bytes().to_vec();
    buf.extend_from_slice(&reading.to_le_bytes());
    buf
}

/// One stream source of a single INT reading, filtered by `reading > 100`
/// into a sink — enough to exercise a source, an operator, and a sink
/// wired up entirely from a plan descriptor rather than hand-built
/// operators.
fn demo_plan() -> PlanDescriptor {
    let schema = Schema::new(vec![("reading", AttrType::Int)]);

    let mut predicate = BEval::new();
    predicate
        .push(BInstr::cmp(BOp::IntGt, role::INPUT, 0, role::CONST, 0))
        .expect("a single comparator is well under BEval's instruction cap");

    PlanDescriptor {
        config: Config::default(),
        nodes: vec![
            NodeSpec {
                name: "sensor".into(),
                kind: NodeKind::StreamSource { schema: schema.clone(), output: "raw".into() },
            },
            NodeSpec {
                name: "above_threshold".into(),
                kind: NodeKind::Select {
                    input: "raw".into(),
                    output: "hot".into(),
                    schema,
                    predicate,
                    consts: 100i32.to_le_bytes().to_vec(),
                },
            },
            NodeSpec { name: "sink".into(), kind: NodeKind::Sink { input: "hot".into() } },
        ],
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let descriptor = demo_plan();
    info!(nodes = descriptor.nodes.len(), "built demonstration plan");

    let mut sources: HashMap<String, Box<dyn TableSource>> = HashMap::new();
    sources.insert(
        "sensor".into(),
        Box::new(FixedSource {
            records: vec![encode_plus(1, 42), encode_plus(2, 150), encode_plus(3, 99), encode_plus(4, 220)].into(),
        }),
    );

    let (mut scheduler, _mem) = Engine::instantiate(&descriptor, sources)?;
    info!(operators = scheduler.len(), "instantiated scheduler, running");
    scheduler.run_for(100)?;
    info!("run complete");

    Ok(())
}
