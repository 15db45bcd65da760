use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::io::Read;
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;
use vidpipe::sink::MultiSinkPublisher;

/// One client reading as fast as the publisher writes, to measure steady
/// state `write_frame` overhead rather than backpressure handling.
fn benchmark_write_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("sink_write_frame");

    for payload_size in [4_000usize, 40_000, 200_000].iter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.sock");
        let mut sink = MultiSinkPublisher::open(&path, false, false).unwrap();

        let client = UnixStream::connect(&path).unwrap();
        thread::sleep(Duration::from_millis(20));
        sink.accept_all();

        let drain = thread::spawn(move || {
            let mut client = client;
            let mut buf = vec![0u8; 1 << 20];
            loop {
                match client.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        let payload = vec![0xCCu8; *payload_size];
        group.bench_with_input(BenchmarkId::new("payload_size", payload_size), &payload, |b, payload| {
            b.iter(|| sink.write_frame(black_box(payload)));
        });

        sink.close();
        drop(drain);
    }

    group.finish();
}

criterion_group!(benches, benchmark_write_frame);
criterion_main!(benches);
