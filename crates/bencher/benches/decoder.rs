use std::hint::black_box;

use bencher::{LARGE_HEADER, SMALL_HEADER, masked_frame};
use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use micro_mux::codec::HeaderDecoder;
use micro_mux::codec::websocket::FrameDecoder;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;

fn benchmark_header_decoder(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("header_decoder");

    for fixture in [SMALL_HEADER, LARGE_HEADER] {
        group.throughput(Throughput::Bytes(fixture.content().len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(fixture.name()), &fixture, |b, fixture| {
            let mut decoder = HeaderDecoder::new(8 * 1024);
            b.iter_batched_ref(
                || BytesMut::from(fixture.content()),
                |bytes| {
                    let header = decoder.decode(bytes).expect("fixture should be a valid request header").unwrap();
                    black_box(header);
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn benchmark_websocket_decoder(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("websocket_decoder");

    for len in [64, 4 * 1024, 64 * 1024] {
        let frame = masked_frame(len);
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &frame, |b, frame| {
            let mut decoder = FrameDecoder::new(1024 * 1024);
            b.iter_batched_ref(
                || BytesMut::from(&frame[..]),
                |bytes| {
                    let frame = decoder.decode(bytes).expect("fixture should be a valid frame").unwrap();
                    black_box(frame);
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(decoder, benchmark_header_decoder, benchmark_websocket_decoder);
criterion_main!(decoder);
