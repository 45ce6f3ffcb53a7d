#![allow(clippy::expect_used)]

//! Hot-path benchmarks for the ticket subsystem.
//!
//! ```bash
//! cargo bench -p tessera-tickets
//! cargo bench -p tessera-tickets -- cipher
//! ```
//!
//! # Benchmark Groups
//!
//! - `ids`: ticket id generation
//! - `policies`: expiration policy evaluation
//! - `cipher`: sealing and opening a ticket body
//! - `lifecycle`: issue-then-validate of a service ticket over memory storage

use std::{hint::black_box, sync::Arc, time::Duration};

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tessera_storage::MemoryBackend;
use tessera_tickets::{
    AesHmacCipher, CipherExecutor, ExpirationPolicy, IdConfig, RegistryConfig, TicketIdGenerator,
    TicketKind, TicketState, TicketSystem,
    testutil::{alice_login, service_request},
};

// =============================================================================
// Id generation
// =============================================================================

fn bench_ids(c: &mut Criterion) {
    let mut group = c.benchmark_group("ids");
    for random_bytes in [16usize, 32, 64] {
        let config = IdConfig::builder().random_bytes(random_bytes).build().expect("id config");
        let generator = TicketIdGenerator::new(&config);
        group.bench_with_input(BenchmarkId::new("generate", random_bytes), &generator, |b, g| {
            b.iter(|| black_box(g.generate("ST")));
        });
    }
    group.finish();
}

// =============================================================================
// Policy evaluation
// =============================================================================

fn bench_policies(c: &mut Criterion) {
    let mut group = c.benchmark_group("policies");
    let now = Utc::now();
    let state = TicketState::new(now).update(now);
    let policies = [
        ("hard", ExpirationPolicy::HardTimeout { time_to_live: Duration::from_secs(10) }),
        (
            "hard_or_idle",
            ExpirationPolicy::HardOrIdle {
                time_to_live: Duration::from_secs(8 * 3600),
                time_to_idle: Duration::from_secs(2 * 3600),
            },
        ),
        (
            "throttled_multi_use",
            ExpirationPolicy::Throttled {
                inner: Box::new(ExpirationPolicy::MultiUse {
                    max_uses: 5,
                    time_to_live: Duration::from_secs(60),
                }),
                min_interval: Duration::from_secs(1),
            },
        ),
    ];
    for (name, policy) in &policies {
        group.bench_function(*name, |b| {
            b.iter(|| {
                black_box(policy.is_expired(&state, now));
                black_box(policy.expires_at(&state))
            });
        });
    }
    group.finish();
}

// =============================================================================
// Cipher
// =============================================================================

fn bench_cipher(c: &mut Criterion) {
    let mut group = c.benchmark_group("cipher");
    let cipher = AesHmacCipher::new(&[0x11; 32], &[0x22; 64]).expect("cipher");
    for size in [256usize, 1024, 8192] {
        let plaintext = vec![0x5a; size];
        let sealed = cipher.encode(&plaintext).expect("encode");
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &plaintext, |b, p| {
            b.iter(|| black_box(cipher.encode(p).expect("encode")));
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &sealed, |b, s| {
            b.iter(|| black_box(cipher.decode(s)));
        });
    }
    group.finish();
}

// =============================================================================
// Lifecycle
// =============================================================================

fn bench_lifecycle(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("lifecycle");

    for (name, config) in [
        ("plaintext", RegistryConfig::default()),
        ("encrypted", tessera_tickets::testutil::encrypted_config()),
    ] {
        let system = TicketSystem::builder()
            .backend(Arc::new(MemoryBackend::without_sweeper()))
            .config(&config)
            .build()
            .expect("system");
        let tgt = rt
            .block_on(system.create(TicketKind::TicketGranting, alice_login()))
            .expect("tgt");

        group.bench_function(BenchmarkId::new("issue_and_validate", name), |b| {
            b.iter(|| {
                rt.block_on(async {
                    let st = system
                        .create(TicketKind::Service, service_request(tgt.id()))
                        .await
                        .expect("st");
                    black_box(system.validate(st.id(), TicketKind::Service).await.expect("validate"))
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_ids, bench_policies, bench_cipher, bench_lifecycle);
criterion_main!(benches);
