use criterion::{black_box, criterion_group, criterion_main, Criterion};

use iax2_proto::frame::{Frame, FullFrame};
use iax2_proto::ies::{build_ies, parse_ies, Ie};

fn new_frame_bytes() -> Vec<u8> {
    let payload = build_ies(&[
        Ie::Version(2),
        Ie::CalledNumber("18005551212".into()),
        Ie::CallingNumber("100".into()),
        Ie::CallingName("bench".into()),
        Ie::Username("bench".into()),
        Ie::Capability(0x0004_0006),
        Ie::Format(0x0000_0004),
        Ie::Refresh(60),
    ]);
    FullFrame {
        scallno: 42,
        dcallno: 0,
        retrans: false,
        ts: 1000,
        oseqno: 0,
        iseqno: 0,
        frametype: iax2_proto::FrameType::Iax as u8,
        csub: iax2_proto::IaxCommand::New as u8,
        payload,
    }
    .encode()
}

fn bench_decode(c: &mut Criterion) {
    let bytes = new_frame_bytes();
    c.bench_function("decode_full_new", |b| {
        b.iter(|| {
            let frame = Frame::decode(black_box(&bytes)).unwrap();
            if let Frame::Full(f) = &frame {
                black_box(parse_ies(&f.payload).unwrap());
            }
        })
    });
}

fn bench_encode(c: &mut Criterion) {
    c.bench_function("encode_full_new", |b| b.iter(|| black_box(new_frame_bytes())));
}

criterion_group!(benches, bench_decode, bench_encode);
criterion_main!(benches);
