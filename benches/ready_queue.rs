use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use uthread::{ReadyQueue, ThreadId};

/// FIFO append/remove cycle at several queue depths
fn bench_fifo(c: &mut Criterion) {
    let mut group = c.benchmark_group("ready_queue_fifo");
    for depth in [16u32, 256, 1024] {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| {
                let mut q = ReadyQueue::new();
                for i in 0..depth {
                    q.enqueue(ThreadId(i));
                }
                while let Some(id) = q.dequeue() {
                    black_box(id);
                }
            });
        });
    }
    group.finish();
}

/// Sorted insertion with scattered keys, the priority-mode hot path
fn bench_sorted(c: &mut Criterion) {
    let mut group = c.benchmark_group("ready_queue_sorted");
    for depth in [16u32, 256, 1024] {
        let keys: Vec<u32> = (0..depth).map(|i| i.wrapping_mul(2_654_435_761) % 256).collect();
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &keys, |b, keys| {
            b.iter(|| {
                let mut q = ReadyQueue::new();
                for (i, &key) in keys.iter().enumerate() {
                    q.enqueue_sort((key, i as u32), |a: &(u32, u32), b: &(u32, u32)| a.0 <= b.0);
                }
                black_box(q.peek())
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fifo, bench_sorted);
criterion_main!(benches);
