//! Codec and queue-management benchmarks.
//!
//! Measures the pure hot paths: SOCKS5 compose/interpret, channel frame
//! encode/decode, and the RED drop-probability math.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use bytes::Bytes;
use peerlink::aqm::{RedSentinel, TracedSender};
use peerlink::socks::{self, Command, Endpoint, Reply, Request, Response};
use peerlink::transport::{Frame, MAX_CHANNEL_PAYLOAD};

fn bench_request_compose(c: &mut Criterion) {
    let request = Request {
        command: Command::Connect,
        endpoint: Endpoint::new("example.com", 443),
    };

    c.bench_function("socks_request_compose", |b| {
        b.iter(|| black_box(socks::compose_request(&request).unwrap()))
    });
}

fn bench_request_interpret(c: &mut Criterion) {
    let request = Request {
        command: Command::Connect,
        endpoint: Endpoint::new("example.com", 443),
    };
    let encoded = socks::compose_request(&request).unwrap();

    c.bench_function("socks_request_interpret", |b| {
        b.iter(|| black_box(socks::interpret_request(&encoded).unwrap()))
    });
}

fn bench_response_round_trip(c: &mut Criterion) {
    let response = Response {
        reply: Reply::Succeeded,
        endpoint: Endpoint::new("203.0.113.5", 8080),
    };

    c.bench_function("socks_response_round_trip", |b| {
        b.iter(|| {
            let encoded = socks::compose_response(&response).unwrap();
            black_box(socks::interpret_response(&encoded).unwrap())
        })
    });
}

fn bench_frame_encode(c: &mut Criterion) {
    let payload = vec![0u8; MAX_CHANNEL_PAYLOAD];

    let mut group = c.benchmark_group("frame_encode");
    group.throughput(Throughput::Bytes(MAX_CHANNEL_PAYLOAD as u64));

    group.bench_function("full_payload", |b| {
        b.iter(|| {
            let frame = Frame::data("socks-1", Bytes::from(payload.clone()));
            black_box(frame.encode())
        })
    });

    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let payload = vec![0u8; MAX_CHANNEL_PAYLOAD];
    let encoded = Frame::data("socks-1", Bytes::from(payload)).encode();

    let mut group = c.benchmark_group("frame_decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));

    group.bench_function("full_payload", |b| {
        b.iter(|| black_box(Frame::decode(&encoded).unwrap()))
    });

    group.finish();
}

fn bench_red_drop_probability(c: &mut Criterion) {
    let traced: TracedSender<u32> = Box::new(|_| Box::pin(async {}));
    let red = RedSentinel::new(100, Box::new(|_| {}), traced);

    c.bench_function("red_drop_probability_sweep", |b| {
        b.iter(|| {
            let mut total = 0.0f64;
            for avg in 0..250 {
                total += red.drop_probability(avg as f64);
            }
            black_box(total)
        })
    });
}

criterion_group!(
    benches,
    bench_request_compose,
    bench_request_interpret,
    bench_response_round_trip,
    bench_frame_encode,
    bench_frame_decode,
    bench_red_drop_probability,
);

criterion_main!(benches);
