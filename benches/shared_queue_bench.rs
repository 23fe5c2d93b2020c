// Queue throughput benchmarks
// Compares the single-reader SimpleQueue against a SharedQueue fanned out
// to several readers, and measures the cost of the shared queue's
// refcount bump on enqueue.

use std::cell::RefCell;
use std::rc::Rc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use cq_engine::memory::MemoryManager;
use cq_engine::queues::{Element, SharedQueue, SharedQueueReader, SharedQueueWriter, SimpleQueue};
use cq_engine::tuple::{TupleHandle, PAGE_SIZE};

fn sample_handle(mem: &mut MemoryManager) -> TupleHandle {
    let page = mem.allocate_page().unwrap();
    TupleHandle(page.0 * PAGE_SIZE)
}

fn bench_simple_queue_round_trip(c: &mut Criterion) {
    c.bench_function("simple_queue_round_trip", |b| {
        b.iter(|| {
            let mut mem = MemoryManager::new(4 * 1024 * 1024);
            let mut queue = SimpleQueue::new(4);
            let handle = sample_handle(&mut mem);
            for ts in 0..300u64 {
                queue.enqueue(black_box(Element::plus(handle, ts)));
                black_box(queue.dequeue());
            }
        });
    });
}

fn bench_shared_queue_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared_queue_fan_out");

    for readers in [1usize, 4, 10] {
        group.bench_with_input(BenchmarkId::from_parameter(readers), &readers, |b, &readers| {
            b.iter(|| {
                let mut mem = MemoryManager::new(4 * 1024 * 1024);
                let inner = Rc::new(RefCell::new(SharedQueue::new(8, readers)));
                let writer = SharedQueueWriter::new(inner.clone());
                let reader_handles: Vec<_> = (0..readers).map(|id| SharedQueueReader::new(inner.clone(), id)).collect();

                let handle = sample_handle(&mut mem);
                for ts in 0..300u64 {
                    writer.enqueue(black_box(Element::plus(handle, ts)), &mut mem);
                    for reader in &reader_handles {
                        black_box(reader.dequeue());
                    }
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_simple_queue_round_trip, bench_shared_queue_fan_out);
criterion_main!(benches);
