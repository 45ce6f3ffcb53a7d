//! Long-running checks, excluded from the default test run.
//!
//! ```bash
//! cargo test -p tessera-tickets --test stress -- --ignored
//! ```

#![allow(clippy::expect_used)]

use std::{collections::HashSet, sync::Arc};

use tessera_tickets::{IdConfig, RegistryConfig, TicketIdGenerator, TicketKind, testutil};

#[test]
#[ignore = "generates a million ids"]
fn million_ids_are_unique() {
    let generator = TicketIdGenerator::new(&IdConfig::default());
    let mut seen = HashSet::with_capacity(1_000_000);
    for _ in 0..1_000_000 {
        let id = generator.generate("ST");
        assert!(id.len() <= generator.max_len("ST"));
        assert!(seen.insert(id), "duplicate id");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "issues a hundred thousand tickets"]
async fn concurrent_issuance_never_collides() {
    let (system, _clock) = testutil::memory_system(&RegistryConfig::default());
    let system = Arc::new(system);
    let tgt = system
        .create(TicketKind::TicketGranting, testutil::alice_login())
        .await
        .expect("tgt");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let system = Arc::clone(&system);
        let parent = tgt.id().to_owned();
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::with_capacity(12_500);
            for _ in 0..12_500 {
                let st = system
                    .create(TicketKind::Service, testutil::service_request(&parent))
                    .await
                    .expect("st");
                ids.push(st.id().to_owned());
            }
            ids
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.expect("task") {
            assert!(seen.insert(id), "duplicate id");
        }
    }
    assert_eq!(seen.len(), 100_000);
    assert_eq!(system.metrics().snapshot().issued, 100_001);
}
