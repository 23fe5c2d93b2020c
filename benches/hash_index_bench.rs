// Hash index performance benchmarks
// Measures insert throughput, scan latency under varying load factors,
// and the cost of a bucket-doubling pass.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use cq_engine::eval::{role, BEval, BInstr, BOp, EvalContext, HEval, HInstr};
use cq_engine::index::HashIndex;
use cq_engine::tuple::{write_int, AttrType, PageId, TupleHandle, PAGE_SIZE};

fn int_heval(role: usize) -> HEval {
    let mut h = HEval::new();
    h.push(HInstr { ty: AttrType::Int, role, col: 0 }).unwrap();
    h
}

fn int_key_equal() -> BEval {
    let mut b = BEval::new();
    b.push(BInstr::cmp(BOp::IntEq, role::SCAN, 0, role::KEY, 0)).unwrap();
    b
}

fn handle(i: u32) -> TupleHandle {
    TupleHandle(PageId(0).0 * PAGE_SIZE + i * 4)
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_index_insert");

    for size in [100u32, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let mut index = HashIndex::new(int_heval(role::UPDATE), int_heval(role::SCAN), int_key_equal(), 0.85);
                for i in 0..size {
                    let mut buf = vec![0u8; 4];
                    write_int(&mut buf, 0, i as i32);
                    let mut ctx = EvalContext::new();
                    ctx.bind(role::UPDATE, buf);
                    index.insert(&ctx, black_box(handle(i)));
                }
                black_box(index);
            });
        });
    }

    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let mut index = HashIndex::new(int_heval(role::UPDATE), int_heval(role::SCAN), int_key_equal(), 0.85);
    let mut bufs = Vec::new();
    for i in 0..10_000u32 {
        let mut buf = vec![0u8; 4];
        write_int(&mut buf, 0, i as i32);
        let mut ctx = EvalContext::new();
        ctx.bind(role::UPDATE, buf.clone());
        index.insert(&ctx, handle(i));
        bufs.push(buf);
    }

    c.bench_function("hash_index_scan_hit", |b| {
        b.iter(|| {
            for buf in bufs.iter().step_by(100) {
                let mut probe = EvalContext::new();
                probe.bind(role::SCAN, buf.clone());
                black_box(index.scan(&mut probe, role::KEY, |_| buf.clone()));
            }
        });
    });
}

fn bench_doubling(c: &mut Criterion) {
    c.bench_function("hash_index_doubling_pass", |b| {
        b.iter(|| {
            let mut index = HashIndex::new(int_heval(role::UPDATE), int_heval(role::SCAN), int_key_equal(), 0.85);
            for i in 0..500u32 {
                let mut buf = vec![0u8; 4];
                write_int(&mut buf, 0, i as i32);
                let mut ctx = EvalContext::new();
                ctx.bind(role::UPDATE, buf);
                index.insert(&ctx, black_box(handle(i)));
            }
            black_box(index.num_buckets());
        });
    });
}

criterion_group!(benches, bench_insert, bench_scan, bench_doubling);
criterion_main!(benches);
