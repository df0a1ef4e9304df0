// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PD/MD codec benchmarks: pack (header build + dual CRC) and parse
//! (verify + slice).

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use trdp::protocol::md::MdHeader;
use trdp::protocol::pd::PdHeader;
use trdp::Uuid;

fn bench_pd_codec(c: &mut Criterion) {
    let payload = vec![0xA5u8; 256];
    let header = PdHeader::data(1000, 42, (7, 9));
    let frame = header.pack(&payload).expect("pack");

    c.bench_function("pd_pack_256", |b| {
        b.iter(|| black_box(header.pack(black_box(&payload)).expect("pack")));
    });
    c.bench_function("pd_parse_256", |b| {
        b.iter(|| black_box(PdHeader::parse(black_box(&frame), (7, 9)).expect("parse")));
    });
}

fn bench_md_codec(c: &mut Criterion) {
    let payload = vec![0x5Au8; 1024];
    let mut header = MdHeader::new(0x4D72, 2000, Uuid([3; 16]), (0, 0));
    header.src_uri = "devA".into();
    header.dest_uri = "devB".into();
    let frame = header.pack(&payload).expect("pack");

    c.bench_function("md_pack_1k", |b| {
        b.iter(|| black_box(header.pack(black_box(&payload)).expect("pack")));
    });
    c.bench_function("md_parse_1k", |b| {
        b.iter(|| black_box(MdHeader::parse(black_box(&frame), (0, 0)).expect("parse")));
    });
}

criterion_group!(benches, bench_pd_codec, bench_md_codec);
criterion_main!(benches);
