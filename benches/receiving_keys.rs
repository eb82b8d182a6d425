use criterion::{black_box, criterion_group, criterion_main, Criterion};
use elliptic_curve::Field;
use k256::{ProjectivePoint, Scalar};
use rand_core::OsRng;
use relay_custody::{MemoryKeyStore, PublicKeySet};

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut keys = MemoryKeyStore::new();
    let set = PublicKeySet::generate(&mut OsRng, &mut keys);
    let secret = Scalar::random(&mut OsRng);
    let point = (ProjectivePoint::GENERATOR * secret).to_affine();

    c.bench_function("public key set generation", |b| {
        b.iter(|| PublicKeySet::generate(&mut OsRng, &mut MemoryKeyStore::new()))
    });
    c.bench_function("receiving public key", |b| {
        b.iter(|| set.receiving_public_key(black_box(&point)))
    });
    c.bench_function("receiving private key", |b| {
        b.iter(|| set.receiving_private_key(black_box(&point), &keys))
    });

    let encrypted = set.encrypt(&secret);
    c.bench_function("encrypt", |b| b.iter(|| set.encrypt(black_box(&secret))));
    c.bench_function("decrypt", |b| {
        b.iter(|| set.decrypt(black_box(&encrypted), &point, &keys))
    });

    let (encrypted_point, commitment) = set.encrypt_point(&point);
    c.bench_function("decrypt point", |b| {
        b.iter(|| set.decrypt_point(black_box(&encrypted_point), &commitment, &keys))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
