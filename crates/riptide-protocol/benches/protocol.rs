//! Micro-benchmarks for reply parsing and command encoding.
//!
//! Run with `cargo bench -p riptide-protocol`.

use std::hint::black_box;

use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, Criterion};
use riptide_protocol::{parse_frame, parse_frame_bytes, Cmd};

/// Builds an HGETALL-style reply with `fields` field/value pairs.
fn build_hash_reply(fields: usize, value_size: usize) -> Vec<u8> {
    let value = "x".repeat(value_size);
    let mut out = format!("*{}\r\n", fields * 2);
    for i in 0..fields {
        let field = format!("field:{i}");
        out.push_str(&format!("${}\r\n{}\r\n", field.len(), field));
        out.push_str(&format!("${}\r\n{}\r\n", value.len(), value));
    }
    out.into_bytes()
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("reply_parse");

    group.bench_function("status_ok", |b| {
        b.iter(|| black_box(parse_frame(b"+OK\r\n").unwrap().unwrap()));
    });

    group.bench_function("nil", |b| {
        b.iter(|| black_box(parse_frame(b"$-1\r\n").unwrap().unwrap()));
    });

    let hash_small = build_hash_reply(10, 64);
    group.bench_function("hgetall_10x64B", |b| {
        b.iter(|| black_box(parse_frame(&hash_small).unwrap().unwrap()));
    });

    let hash_large = Bytes::from(build_hash_reply(1000, 64));
    group.bench_function("hgetall_1000x64B_zerocopy", |b| {
        b.iter(|| black_box(parse_frame_bytes(&hash_large).unwrap().unwrap()));
    });

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_encode");

    group.bench_function("type", |b| {
        let mut buf = BytesMut::with_capacity(64);
        b.iter(|| {
            buf.clear();
            Cmd::new("TYPE").arg("key:12345").serialize(&mut buf);
            black_box(&buf);
        });
    });

    let members: Vec<Bytes> = (0..100).map(|i| Bytes::from(format!("member:{i}"))).collect();
    group.bench_function("sadd_100", |b| {
        let mut buf = BytesMut::with_capacity(4096);
        b.iter(|| {
            buf.clear();
            Cmd::new("SADD")
                .arg("set:1")
                .args(members.iter())
                .serialize(&mut buf);
            black_box(&buf);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_parse, bench_encode);
criterion_main!(benches);
