//! Benchmark for the datastore layout resolver
//!
//! Path computation runs for every disk a command touches; locate runs once
//! per command against the datastore browser.

use cluster_storage_orchestrator::domain::ports::{DatastoreBrowser, VmManager, VmSpec};
use cluster_storage_orchestrator::{DatastoreLayoutResolver, DatastorePath, DiskLayout, SimulatedCluster};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn bench_resolve_pair(c: &mut Criterion) {
    let mut group = c.benchmark_group("layout_resolver");
    group.throughput(Throughput::Elements(1));
    let resolver = DatastoreLayoutResolver::default();

    group.bench_function("resolve_pair_linked", |b| {
        b.iter(|| {
            resolver.resolve_pair(
                black_box("ds1"),
                black_box("i-2-10-VM"),
                black_box("ROOT-10"),
                DiskLayout::PerVmFolder,
                true,
            )
        });
    });

    let descriptor: DatastorePath = "[ds1] i-2-10-VM/ROOT-10.vmdk".parse().unwrap();
    group.bench_function("backing_set", |b| {
        b.iter(|| resolver.backing_set(black_box(&descriptor)));
    });

    group.finish();
}

fn bench_path_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("datastore_path");
    group.throughput(Throughput::Elements(1));

    group.bench_function("parse", |b| {
        b.iter(|| {
            let path: DatastorePath = black_box("[datastore1] i-2-10-VM/ROOT-10-000001.vmdk").parse().unwrap();
            path
        });
    });

    group.finish();
}

fn bench_locate(c: &mut Criterion) {
    let mut group = c.benchmark_group("layout_resolver");
    let rt = tokio::runtime::Runtime::new().unwrap();

    let sim = SimulatedCluster::builder()
        .cluster("c1", 1)
        .local_datastore("ds1", "c1", 1 << 40)
        .build();
    rt.block_on(async {
        for i in 0..200 {
            let vm = format!("vm{}", i);
            sim.create_vm(&VmSpec {
                name: vm.clone(),
                datastore: "ds1".into(),
            })
            .await
            .unwrap();
            let disk: DatastorePath = format!("[ds1] {}/data{}.vmdk", vm, i).parse().unwrap();
            sim.create_virtual_disk(&disk, 1 << 30).await.unwrap();
        }
    });
    let resolver = DatastoreLayoutResolver::default();
    let files: &dyn DatastoreBrowser = &sim;

    group.bench_function("locate_in_vm_folder", |b| {
        b.iter(|| {
            rt.block_on(resolver.locate(files, "ds1", Some("vm150"), black_box("data150")))
                .unwrap()
        });
    });

    group.bench_function("locate_by_search", |b| {
        b.iter(|| {
            rt.block_on(resolver.locate(files, "ds1", None, black_box("data150")))
                .unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_resolve_pair, bench_path_parse, bench_locate);
criterion_main!(benches);
