use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lightning_sphinx::failure::{FailureMessage, FailurePacket};
use lightning_sphinx::{HopPayload, OnionPacket, SharedSecrets, Sphinx};
use rand::prelude::*;
use secp256k1::{PublicKey, Secp256k1, SecretKey};

struct SphinxBencher {
    sphinx: Sphinx,
    nodes: Vec<(SecretKey, PublicKey)>,
}

impl SphinxBencher {
    fn new(sphinx: Sphinx) -> Self {
        let secp = Secp256k1::new();
        let mut rng = thread_rng();
        let nodes = (0..20)
            .map(|_| {
                let mut bytes = [0u8; 32];
                rng.fill_bytes(&mut bytes);
                let private_key = SecretKey::from_slice(&bytes).expect("RNG is busted");
                (private_key, private_key.public_key(&secp))
            })
            .collect();
        SphinxBencher { sphinx, nodes }
    }

    fn random_route(&self, hop_count: usize) -> (SecretKey, Vec<HopPayload>) {
        let mut rng = thread_rng();
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        let session_key = SecretKey::from_slice(&bytes).expect("RNG is busted");
        let hops = (0..hop_count)
            .map(|i| {
                let mut payload = vec![0x08];
                payload.extend_from_slice(&[i as u8; 8]);
                HopPayload {
                    pubkey: self.nodes[i].1,
                    payload,
                }
            })
            .collect();
        (session_key, hops)
    }

    fn prepare_onion(&self, hop_count: usize) -> (OnionPacket, SharedSecrets) {
        let (session_key, hops) = self.random_route(hop_count);
        self.sphinx
            .create(&session_key, &hops, &[0x42; 32])
            .unwrap()
    }
}

fn bench_create(c: &mut Criterion) {
    let bencher = SphinxBencher::new(Sphinx::payment());
    let mut group = c.benchmark_group("create");
    for hop_count in [1usize, 5, 10, 20] {
        group.throughput(Throughput::Elements(hop_count as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(hop_count),
            &hop_count,
            |b, &hop_count| {
                let (session_key, hops) = bencher.random_route(hop_count);
                b.iter(|| {
                    bencher
                        .sphinx
                        .create(black_box(&session_key), black_box(&hops), &[0x42; 32])
                        .unwrap()
                });
            },
        );
    }
    group.finish();
}

fn bench_peel(c: &mut Criterion) {
    let bencher = SphinxBencher::new(Sphinx::payment());
    let (onion, _) = bencher.prepare_onion(20);
    c.bench_function("peel", |b| {
        b.iter(|| {
            bencher
                .sphinx
                .peel(&bencher.nodes[0].0, &[0x42; 32], black_box(&onion))
                .unwrap()
        });
    });
}

fn bench_failure_roundtrip(c: &mut Criterion) {
    let bencher = SphinxBencher::new(Sphinx::payment());
    let (_, shared_secrets) = bencher.prepare_onion(20);
    c.bench_function("failure_roundtrip", |b| {
        b.iter(|| {
            let mut failure = FailurePacket::create(
                &shared_secrets[19].0,
                &FailureMessage::TemporaryNodeFailure,
            )
            .unwrap();
            for (secret, _) in shared_secrets[..19].iter().rev() {
                failure = failure.wrap(secret);
            }
            failure.decrypt(black_box(&shared_secrets)).unwrap()
        });
    });
}

criterion_group!(benches, bench_create, bench_peel, bench_failure_roundtrip);
criterion_main!(benches);
