/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use mana_gdma::queue::{QueueKind, Sge, WorkQueue, WqeRequest};
use mana_gdma::resource::ResourcePool;
use mana_gdma::{DmaBuffer, PAGE_SIZE};
use mana_testing::SimMemory;

fn pool_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("resource_pool");

    for capacity in [64usize, 4096] {
        let pool = ResourcePool::new(capacity);
        // keep most ids busy so the scan has work to do
        for _ in 0..capacity - 1 {
            pool.acquire().unwrap();
        }
        group.bench_with_input(
            BenchmarkId::new("acquire_release", capacity),
            &pool,
            |b, pool| {
                b.iter(|| {
                    let id = pool.acquire().unwrap();
                    pool.release(id).unwrap();
                });
            },
        );
    }

    group.finish();
}

fn work_queue_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("work_queue");
    let mem = SimMemory::new(1024 * 1024);

    for num_sge in [1usize, 4] {
        let buf = DmaBuffer::new(mem.clone(), PAGE_SIZE).unwrap();
        let wq = WorkQueue::new(QueueKind::Send, 1, 0, buf, true, 0).unwrap();
        let req = WqeRequest::new()
            .inline_oob(&[0u8; 24])
            .sges((0..num_sge).map(|i| Sge::new(0x1000 * i as u64, 1, 64)));

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("post_and_retire", num_sge), &req, |b, req| {
            b.iter(|| {
                let info = wq.post(req).unwrap();
                wq.advance_tail(info.size_in_bu).unwrap();
            });
        });
    }

    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default();
    targets = pool_benchmark, work_queue_benchmark
}
criterion_main!(benches);
