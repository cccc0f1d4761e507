//! Benchmark for blocking call round-trip latency.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::thread;
use std::time::Duration;

use slotipc::{Client, IpcConfig};
use slotipc_server::{Server, ServerConfig, ShutdownMode};

fn bench_blocking_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("slotipc_roundtrip");
    group.throughput(Throughput::Elements(1));

    group.bench_function("add", |b| {
        let cfg = IpcConfig::with_prefix(&format!("sibench_add_{}", std::process::id()));
        let server_cfg = ServerConfig {
            threads_per_pool: Some(1),
            shutdown: ShutdownMode::Drain,
            slow_op_delay: Duration::ZERO,
        };
        let server = Server::start(cfg.clone(), server_cfg).unwrap();
        let handle = server.handle();
        let server_thread = thread::spawn(move || server.run());

        let mut client = Client::connect(cfg).unwrap();
        // Warm the path before measuring.
        for _ in 0..100 {
            client.add(1, 2).unwrap();
        }
        b.iter(|| black_box(client.add(black_box(2), black_box(3)).unwrap()));

        drop(client);
        handle.request_shutdown();
        server_thread.join().unwrap();
    });

    group.finish();
}

criterion_group!(benches, bench_blocking_add);
criterion_main!(benches);
