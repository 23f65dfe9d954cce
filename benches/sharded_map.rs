use std::sync::Arc;

use buildcore::sharded_map::ShardedMap;
use criterion::{criterion_group, criterion_main, Criterion};

/// Publish/await throughput under concurrent readers, the access pattern
/// the scheduler puts on the graph's target and package maps during a
/// large build.
pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("benches");
    group.sample_size(20);
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .build()
        .unwrap();

    group.bench_function("publish_then_get", |b| {
        b.iter(|| {
            let map: ShardedMap<usize, usize> = ShardedMap::new();
            for i in 0..1000 {
                map.publish(i, i * 2);
            }
            for i in 0..1000 {
                assert_eq!(map.get(&i), Some(i * 2));
            }
        })
    });

    group.bench_function("concurrent_wait_and_publish", |b| {
        b.iter(|| {
            rt.block_on(async {
                let map: Arc<ShardedMap<usize, usize>> = Arc::new(ShardedMap::new());
                let mut waiters = Vec::with_capacity(64);
                for i in 0..64 {
                    let map = Arc::clone(&map);
                    waiters.push(tokio::spawn(async move { map.wait(&i).await }));
                }
                for i in 0..64 {
                    map.publish(i, i);
                }
                for w in waiters {
                    w.await.unwrap();
                }
            })
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
