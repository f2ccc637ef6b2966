//! Throughput benchmarks for the queue primitive and the store path.

use std::sync::Arc;
use std::thread;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use parzip::{ByteQueue, QueueState};

fn queue_throughput(c: &mut Criterion) {
    const TOTAL: usize = 8 * 1024 * 1024;
    const QUEUE: usize = 256 * 1024;

    let mut group = c.benchmark_group("bytequeue");
    group.throughput(Throughput::Bytes(TOTAL as u64));
    group.bench_function("producer_consumer_8mib", |b| {
        b.iter(|| {
            let q = Arc::new(ByteQueue::new(QUEUE));
            let producer = {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let chunk = vec![0xA5u8; 64 * 1024];
                    let mut pushed = 0;
                    while pushed < TOTAL {
                        q.push(&chunk).unwrap();
                        pushed += chunk.len();
                    }
                    q.shutdown();
                })
            };
            let mut received = 0usize;
            loop {
                q.wait_until_full_or_shutdown();
                received += q.pop().len();
                if q.state() == QueueState::Shutdown {
                    received += q.pop().len();
                    break;
                }
            }
            producer.join().unwrap();
            assert_eq!(received, TOTAL);
        });
    });
    group.finish();
}

fn crc_throughput(c: &mut Criterion) {
    const SIZE: usize = 16 * 1024 * 1024;
    let data = vec![0x5Au8; SIZE];

    let mut group = c.benchmark_group("crc32");
    group.throughput(Throughput::Bytes(SIZE as u64));
    group.bench_function("blocks_16mib", |b| {
        b.iter(|| parzip::compress::crc32_blocks(&data));
    });
    group.finish();
}

criterion_group!(benches, queue_throughput, crc_throughput);
criterion_main!(benches);
