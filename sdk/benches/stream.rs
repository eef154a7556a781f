#![allow(
    clippy::unwrap_used,
    clippy::default_numeric_fallback,
    reason = "benchmark"
)]

use {
    coffre_protocol::{EncryptionKey, HashKey, Nonce},
    coffre_sdk::{EncryptedStream, IntegrityOptions, StreamOptions},
    criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput},
    rand::SeedableRng,
    rand_chacha::ChaCha8Rng,
    std::io::{Cursor, Read, Seek, SeekFrom, Write},
};

fn options(with_integrity: bool) -> StreamOptions {
    StreamOptions {
        integrity: with_integrity.then(|| IntegrityOptions {
            hash_key: HashKey::generate_with_rng(&mut ChaCha8Rng::seed_from_u64(2)),
            chunk_size: 4096,
        }),
        ..StreamOptions::default()
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    let key = EncryptionKey::generate_with_rng(&mut ChaCha8Rng::seed_from_u64(1));
    let nonce = Nonce::from_u64(1);

    for (name, with_integrity) in [("encrypt", false), ("encrypt_integrity", true)] {
        let mut group = c.benchmark_group(name);
        for size in [1024usize, 1024 * 1024] {
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
                b.iter_batched(
                    || (0..size).map(|_| rand::random::<u8>()).collect::<Vec<u8>>(),
                    |input| {
                        let mut stream = EncryptedStream::create(
                            Cursor::new(Vec::with_capacity(size * 2)),
                            &key,
                            nonce,
                            options(with_integrity),
                        )
                        .unwrap();
                        stream.write_all(&input).unwrap();
                        stream.into_inner().into_inner()
                    },
                    BatchSize::SmallInput,
                );
            });
        }
        group.finish();
    }

    let mut group = c.benchmark_group("decrypt_seek");
    for size in [1024 * 1024usize] {
        let mut stream = EncryptedStream::create(
            Cursor::new(Vec::new()),
            &key,
            nonce,
            options(true),
        )
        .unwrap();
        stream.write_all(&vec![0xA5u8; size]).unwrap();
        let encrypted = stream.into_inner().into_inner();

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut reader = EncryptedStream::open(
                Cursor::new(encrypted.clone()),
                &key,
                options(true),
            )
            .unwrap();
            let mut buf = vec![0u8; 4096];
            b.iter(|| {
                reader.seek(SeekFrom::Start((size / 2) as u64)).unwrap();
                reader.read_exact(&mut buf).unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
