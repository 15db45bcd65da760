use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use vidpipe::framer::AccessUnitFramer;

fn nal(nal_type: u8, first_mb_high: bool) -> Vec<u8> {
    let mut v = vec![0, 0, 0, 1, nal_type];
    v.push(if first_mb_high { 0x80 } else { 0x00 });
    v
}

/// Builds `count` back-to-back access units of `payload_size` bytes each,
/// each closed by an AUD, matching the shape `vidpipe-capture` actually
/// writes to the h264 sink.
fn build_stream(count: usize, payload_size: usize) -> Vec<u8> {
    let mut stream = Vec::with_capacity(count * (payload_size + 32));
    for i in 0..count {
        let nal_type = if i == 0 { 5 } else { 1 };
        stream.extend(nal(nal_type, true));
        stream.extend(vec![0xAB; payload_size]);
        stream.extend(vec![0, 0, 0, 1, 9, 0x80]);
    }
    stream
}

fn benchmark_feed(c: &mut Criterion) {
    let mut group = c.benchmark_group("framer_feed");

    for payload_size in [2_000usize, 20_000, 100_000].iter() {
        let stream = build_stream(30, *payload_size);

        group.bench_with_input(BenchmarkId::new("payload_size", payload_size), &stream, |b, stream| {
            b.iter(|| {
                let mut framer = AccessUnitFramer::new();
                let mut units = 0usize;
                framer
                    .feed(black_box(stream), |_unit| units += 1)
                    .unwrap();
                black_box(units)
            });
        });
    }

    group.finish();
}

fn benchmark_split_feed(c: &mut Criterion) {
    // Mirrors the RTSP/WebRTC republisher, which feeds the framer whatever
    // chunk size recv() handed back rather than whole access units.
    let stream = build_stream(30, 20_000);

    c.bench_function("framer_feed_4k_chunks", |b| {
        b.iter(|| {
            let mut framer = AccessUnitFramer::new();
            let mut units = 0usize;
            for chunk in stream.chunks(4096) {
                framer.feed(black_box(chunk), |_unit| units += 1).unwrap();
            }
            black_box(units)
        });
    });
}

criterion_group!(benches, benchmark_feed, benchmark_split_feed);
criterion_main!(benches);
