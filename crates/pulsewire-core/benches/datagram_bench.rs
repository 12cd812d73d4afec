use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use pulsewire_core::datagram::{self, DatagramHeader, PacketFlags, PacketType};
use pulsewire_core::{PeerId, ProtocolConfig, ProtocolCore};
use pulsewire_crypto::x25519::PrivateKey;
use rand_core::OsRng;

const ALICE: PeerId = [0xA1; 32];
const BOB: PeerId = [0xB0; 32];

fn connected_pair() -> (ProtocolCore, ProtocolCore) {
    let mut config = ProtocolConfig::default();
    config.keystore.rotation_threshold = usize::MAX;

    let alice = ProtocolCore::new(ALICE, config.clone()).unwrap();
    let bob = ProtocolCore::new(BOB, config).unwrap();
    let alice_key = PrivateKey::generate(&mut OsRng);
    let bob_key = PrivateKey::generate(&mut OsRng);
    alice
        .create_connection(&alice_key, BOB, &bob_key.public_key())
        .unwrap();
    bob.create_connection(&bob_key, ALICE, &alice_key.public_key())
        .unwrap();
    (alice, bob)
}

fn bench_header_parse(c: &mut Criterion) {
    let header = DatagramHeader::new(PacketType::Data, 1000, 0xDEAD_BEEF, PacketFlags::new());
    let bytes = datagram::encode(&header, &vec![0xAA; 1200]).unwrap();

    let mut group = c.benchmark_group("header_parse");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("parse_1216_bytes", |b| {
        b.iter(|| datagram::parse(black_box(&bytes)))
    });
    group.finish();
}

fn bench_data_packet_sizes(c: &mut Criterion) {
    let sizes: Vec<(usize, &str)> = vec![
        (64, "64_bytes"),
        (256, "256_bytes"),
        (1024, "1024_bytes"),
        (1200, "1200_bytes"),
    ];

    let mut group = c.benchmark_group("data_packet_seal");
    for (size, name) in sizes {
        let (alice, _bob) = connected_pair();
        let payload = vec![0x42; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(name, |b| {
            b.iter(|| alice.create_data_packet(black_box(&BOB), black_box(&payload)))
        });
    }
    group.finish();
}

fn bench_process_packet(c: &mut Criterion) {
    let (alice, bob) = connected_pair();
    let payload = vec![0x42; 1200];

    let mut group = c.benchmark_group("process_packet");
    group.throughput(Throughput::Bytes(1200));
    // Fresh sequences each iteration; replays would short-circuit
    group.bench_function("seal_and_open_1200_bytes", |b| {
        b.iter(|| {
            let datagram = alice.create_data_packet(&BOB, &payload).unwrap();
            bob.process_packet(black_box(&datagram)).unwrap()
        })
    });
    group.finish();
}

fn bench_replay_rejection(c: &mut Criterion) {
    let (alice, bob) = connected_pair();
    let datagram = alice.create_data_packet(&BOB, &[0x42; 256]).unwrap();
    bob.process_packet(&datagram).unwrap();

    c.bench_function("replay_rejection", |b| {
        b.iter(|| bob.process_packet(black_box(&datagram)).is_err())
    });
}

criterion_group!(
    benches,
    bench_header_parse,
    bench_data_packet_sizes,
    bench_process_packet,
    bench_replay_rejection
);
criterion_main!(benches);
