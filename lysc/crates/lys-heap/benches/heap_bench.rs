//! Allocation and collection benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lys_heap::value::{Value, NIL};
use lys_heap::{gc_frame, Heap, HeapConfig};

fn bench_cons_allocation(c: &mut Criterion) {
    c.bench_function("alloc_cons_churn", |b| {
        let mut heap = Heap::new(HeapConfig {
            heap_size: 1024 * 1024,
            ..Default::default()
        })
        .unwrap();
        b.iter(|| {
            for i in 0..1000 {
                black_box(heap.alloc_cons(Value::number(i), NIL));
            }
        });
    });
}

fn bench_collection(c: &mut Criterion) {
    c.bench_function("collect_live_list", |b| {
        let mut heap = Heap::new(HeapConfig {
            heap_size: 1024 * 1024,
            ..Default::default()
        })
        .unwrap();
        let mut list = NIL;
        gc_frame!(heap, [list]);
        for i in 0..5000 {
            list = heap.alloc_cons(Value::number(i), list);
        }
        b.iter(|| {
            heap.collect_now();
            black_box(list);
        });
    });
}

fn bench_interning(c: &mut Criterion) {
    c.bench_function("intern_hit", |b| {
        let mut heap = Heap::with_defaults().unwrap();
        heap.intern("lookup-target").unwrap();
        b.iter(|| black_box(heap.intern("lookup-target").unwrap()));
    });
}

criterion_group!(
    benches,
    bench_cons_allocation,
    bench_collection,
    bench_interning
);
criterion_main!(benches);
