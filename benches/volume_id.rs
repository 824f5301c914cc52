//! Benchmarks for the volume identifier codec and the per-volume lock table

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use pve_csi::csi::ResourceLock;
use pve_csi::VolumeId;
use std::sync::Arc;

fn bench_volume_id(c: &mut Criterion) {
    let mut group = c.benchmark_group("volume_id");
    group.throughput(Throughput::Elements(1));

    group.bench_function("parse_local", |b| {
        b.iter(|| VolumeId::parse(black_box("eu-west/pve-1/local-lvm/vm-9999-pvc-0b7e5c")));
    });

    group.bench_function("parse_shared_compat", |b| {
        b.iter(|| VolumeId::parse_compat(black_box("eu-west/ceph/9999/vm-9999-pvc-0b7e5c.raw")));
    });

    let id = VolumeId::new("eu-west", "pve-1", "local-lvm", "vm-9999-pvc-0b7e5c");
    group.bench_function("encode", |b| {
        b.iter(|| black_box(&id).to_string());
    });

    group.bench_function("volid", |b| {
        b.iter(|| black_box(&id).volid());
    });

    group.finish();
}

fn bench_resource_lock(c: &mut Criterion) {
    let mut group = c.benchmark_group("resource_lock");
    let rt = tokio::runtime::Runtime::new().unwrap();

    group.throughput(Throughput::Elements(1));
    group.bench_function("lock_unlock", |b| {
        let locks = ResourceLock::new();
        b.iter(|| {
            rt.block_on(async {
                let guard = locks.lock(black_box("eu-west/pve-1/local-lvm/vm-9999-pvc-1")).await;
                locks.unlock(guard);
            })
        });
    });

    group.throughput(Throughput::Elements(100));
    group.bench_function("concurrent_100_keys", |b| {
        let locks = Arc::new(ResourceLock::new());
        b.iter(|| {
            rt.block_on(async {
                let mut handles = Vec::new();
                for i in 0..100 {
                    let locks = locks.clone();
                    handles.push(tokio::spawn(async move {
                        let key = format!("eu-west/pve-1/local-lvm/vm-9999-pvc-{}", i % 10);
                        let guard = locks.lock(&key).await;
                        locks.unlock(guard);
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_volume_id, bench_resource_lock);
criterion_main!(benches);
