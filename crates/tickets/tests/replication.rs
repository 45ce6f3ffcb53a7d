//! Two nodes with separate stores kept in step over a shared bus.

#![allow(clippy::expect_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use tessera_storage::MemoryBackend;
use tessera_tickets::{
    BroadcastBus, CLEANER_LOCK, LockingStrategy, MessageBus, RegistryConfig, ReplicatedBackend, Ticket, TicketKind,
    TicketRegistry, TicketSystem, Validation,
    testutil::{alice_login, encrypted_config, service_request},
};

type Node = TicketSystem<ReplicatedBackend<MemoryBackend>>;

fn node(name: &str, bus: &Arc<dyn MessageBus>, config: &RegistryConfig) -> Node {
    let backend = ReplicatedBackend::new(MemoryBackend::new(), name, Arc::clone(bus));
    TicketSystem::builder().backend(Arc::new(backend)).config(config).build().expect("node")
}

fn cluster(config: &RegistryConfig) -> (Node, Node) {
    let bus: Arc<dyn MessageBus> = Arc::new(BroadcastBus::default());
    (node("node-a", &bus, config), node("node-b", &bus, config))
}

/// Polls `node` until `id` is present (or absent), giving up after a second.
async fn await_presence(node: &Node, id: &str, present: bool) -> Option<Ticket> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        let found = node.registry().get_ticket(id, None).await.expect("get");
        if found.is_some() == present {
            return found;
        }
        assert!(tokio::time::Instant::now() < deadline, "replication of {id} timed out");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn issued_ticket_reaches_other_node() {
    let (a, b) = cluster(&RegistryConfig::default());

    let tgt = a.create(TicketKind::TicketGranting, alice_login()).await.expect("tgt");
    let replica = await_presence(&b, tgt.id(), true).await.expect("replicated");
    assert_eq!(replica.principal(), "alice");
}

#[tokio::test]
async fn children_issued_on_either_node_share_the_session() {
    let (a, b) = cluster(&encrypted_config());

    let tgt = a.create(TicketKind::TicketGranting, alice_login()).await.expect("tgt");
    await_presence(&b, tgt.id(), true).await;

    let st = b.create(TicketKind::Service, service_request(tgt.id())).await.expect("st on b");
    await_presence(&a, st.id(), true).await;

    match a.validate(st.id(), TicketKind::Service).await.expect("validate on a") {
        Validation::Valid(ticket) => assert_eq!(ticket.principal(), "alice"),
        other => panic!("unexpected outcome {other:?}"),
    }
    await_presence(&b, st.id(), false).await;
}

#[tokio::test]
async fn revocation_propagates() {
    let config = RegistryConfig::builder().remove_descendants(true).build().expect("config");
    let (a, b) = cluster(&config);

    let tgt = a.create(TicketKind::TicketGranting, alice_login()).await.expect("tgt");
    let st = a.create(TicketKind::Service, service_request(tgt.id())).await.expect("st");
    await_presence(&b, st.id(), true).await;

    // The parent's update follows the child's insert on the bus.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        let session = await_presence(&b, tgt.id(), true).await.expect("session");
        if session.descendants().any(|child| child == st.id()) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "session update timed out");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(b.revoke(tgt.id()).await.expect("revoke on b"), 2);
    await_presence(&a, tgt.id(), false).await;
    await_presence(&a, st.id(), false).await;
    assert_eq!(a.registry().session_count().await.expect("sessions"), 0);
}

#[tokio::test]
async fn lease_locks_are_exclusive_per_node_only() {
    let (a, b) = cluster(&RegistryConfig::default());
    let a_locks = a.registry().locks();
    let b_locks = b.registry().locks();

    // On a single-threaded runtime neither insert replicates before the
    // other runs, so both nodes win.
    assert!(a_locks.try_lock("ticket/shared").await.expect("a locks"));
    assert!(!a_locks.try_lock("ticket/shared").await.expect("a again"));
    assert!(b_locks.try_lock("ticket/shared").await.expect("b locks"));

    // The cleaner lock excludes only its own node.
    assert!(a_locks.try_lock(CLEANER_LOCK).await.expect("a takes cleaner lock"));
    assert!(a.cleaner().clean().await.expect("clean a").skipped);
    assert!(!b.cleaner().clean().await.expect("clean b").skipped);
}
