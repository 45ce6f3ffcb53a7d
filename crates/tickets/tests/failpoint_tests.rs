//! Fail-point injection in consumption and sweeping.
//!
//! Requires the `failpoints` feature:
//! ```bash
//! cargo test -p tessera-tickets --features failpoints --test failpoint_tests
//! ```

#![allow(clippy::expect_used, clippy::panic)]

use std::time::Duration;

use tessera_tickets::{
    RegistryConfig, TicketError, TicketKind, TicketRegistry, Validation,
    testutil::{alice_login, memory_system, service_request},
};

#[tokio::test]
async fn failure_before_consume_leaves_ticket_intact() {
    let scenario = fail::FailScenario::setup();
    let (system, _clock) = memory_system(&RegistryConfig::default());
    let tgt = system.create(TicketKind::TicketGranting, alice_login()).await.expect("tgt");
    let st = system.create(TicketKind::Service, service_request(tgt.id())).await.expect("st");

    fail::cfg("registry-before-consume", "return").expect("failed to configure fail point");
    let err = system.validate(st.id(), TicketKind::Service).await.expect_err("injected");
    assert!(matches!(err, TicketError::Storage { .. }), "{err:?}");
    assert!(system.registry().get_ticket(st.id(), None).await.expect("get").is_some());

    fail::remove("registry-before-consume");
    assert!(system.validate(st.id(), TicketKind::Service).await.expect("validate").is_valid());

    scenario.teardown();
}

#[tokio::test]
async fn failure_before_delete_is_counted_and_retried_next_sweep() {
    let scenario = fail::FailScenario::setup();
    let (system, clock) = memory_system(&RegistryConfig::default());
    let tgt = system.create(TicketKind::TicketGranting, alice_login()).await.expect("tgt");
    for _ in 0..2 {
        system.create(TicketKind::Service, service_request(tgt.id())).await.expect("st");
    }
    clock.advance(Duration::from_secs(11));

    fail::cfg("cleaner-before-delete", "return").expect("failed to configure fail point");
    let report = system.cleaner().clean().await.expect("sweep continues past failures");
    assert_eq!(report.examined, 2);
    assert_eq!(report.failures, 2);
    assert_eq!(report.removed, 0);
    assert_eq!(system.metrics().snapshot().sweep_failures, 2);

    fail::remove("cleaner-before-delete");
    let report = system.cleaner().clean().await.expect("clean");
    assert_eq!(report.removed, 2);

    let outcome = system
        .validate(tgt.id(), TicketKind::TicketGranting)
        .await
        .expect("session untouched");
    assert!(matches!(outcome, Validation::Valid(_)));

    scenario.teardown();
}
