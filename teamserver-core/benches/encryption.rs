use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use teamserver_core::crypto::{hash_token, MasterKey, Sealer};
use teamserver_core::integrity::{chain_hash, GENESIS_HASH};

fn benchmark_sealing(c: &mut Criterion) {
    let sealer = Sealer::new(MasterKey::generate());

    // Deploy keys and CA keys are small; measure around their sizes
    let sizes = vec![("256B", 256), ("4KB", 4 * 1024), ("64KB", 64 * 1024)];

    for (name, size) in &sizes {
        let data = vec![0u8; *size];

        let mut group = c.benchmark_group(format!("seal-{}", name));
        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_function("seal", |b| {
            b.iter(|| {
                let _ = sealer.seal(black_box(&data));
            });
        });

        let sealed = sealer.seal(&data).unwrap();

        group.bench_function("open", |b| {
            b.iter(|| {
                let _ = sealer.open(black_box(&sealed));
            });
        });

        group.finish();
    }
}

fn benchmark_hashing(c: &mut Criterion) {
    let payload = concat!(
        r#"{"id":42,"timestamp":1700000000,"user":"admin","action":"sync","#,
        r#""details":"shop/prod ok","source_ip":"10.0.0.1"}"#
    )
    .as_bytes();

    c.bench_function("chain_hash", |b| {
        b.iter(|| chain_hash(black_box(GENESIS_HASH), black_box(payload)));
    });

    c.bench_function("hash_token", |b| {
        let token = format!("tss_{}", "0123456789abcdef".repeat(4));
        b.iter(|| hash_token(black_box(&token)));
    });
}

criterion_group!(benches, benchmark_sealing, benchmark_hashing);
criterion_main!(benches);
