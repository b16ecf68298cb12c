//! Microbenchmark for session management packet encode/decode.
//!
//! The control plane is not the hot path, but retransmission storms
//! serialize the same packet repeatedly, so the codec should stay cheap.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use fabrpc::{SessionMetadata, SmErrType, SmPkt, SmPktType, TransportType, START_SEQ_MASK};

fn sample_pkt() -> SmPkt {
    let mut client = SessionMetadata::new_invalid();
    client.transport_type = TransportType::InfiniBand;
    client.set_hostname("client-host.example:31850").unwrap();
    client.app_tid = 3;
    client.phy_port = 0;
    client.session_num = 42;
    client.start_seq = 0xdead_beef_cafe & START_SEQ_MASK;

    let mut server = SessionMetadata::new_invalid();
    server.transport_type = TransportType::InfiniBand;
    server.set_hostname("server-host.example:31850").unwrap();
    server.app_tid = 7;

    SmPkt::new(SmPktType::ConnectReq, SmErrType::NoError, client, server)
}

fn bench_encode(c: &mut Criterion) {
    let pkt = sample_pkt();
    c.bench_function("sm_pkt_encode", |b| {
        b.iter(|| black_box(black_box(&pkt).to_bytes()))
    });
}

fn bench_decode(c: &mut Criterion) {
    let bytes = sample_pkt().to_bytes();
    c.bench_function("sm_pkt_decode", |b| {
        b.iter(|| SmPkt::from_bytes(black_box(&bytes)).unwrap())
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
