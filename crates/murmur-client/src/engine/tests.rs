use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{sleep, timeout, Instant};

use murmur_net::memory::{AckPolicy, MemoryNetwork};
use murmur_shared::event::TAG_PUBKEY;
use murmur_shared::crypto::SymmetricKey;
use murmur_shared::{
    ConversationId, CryptoError, DirectMessageCodec, Ed25519Signer, Event, EventKind, EventSigner,
    GroupId, Identity, MessageCodec, PublicKey, SigningError, UnsignedEvent,
};
use murmur_store::{Database, MessageStatus};

use super::*;
use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::ErrorKind;
use crate::tracer::FlowStage;

const RELAY_A: &str = "wss://a.test";
const RELAY_B: &str = "wss://b.test";
const RELAY_C: &str = "wss://c.test";

fn config(relays: &[&str]) -> ClientConfig {
    ClientConfig {
        relays: relays.iter().map(|r| r.to_string()).collect(),
        ack_timeout: Duration::from_millis(200),
        connect_timeout: Duration::from_secs(5),
        retry_base: Duration::from_secs(60),
        retry_max: Duration::from_secs(120),
        reconnect_base: Duration::from_millis(20),
        reconnect_max: Duration::from_millis(100),
        sync_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    }
}

fn start(network: &MemoryNetwork, relays: &[&str], identity: Identity) -> Client {
    Client::start(
        config(relays),
        identity,
        Arc::new(network.clone()),
        Database::open_in_memory().unwrap(),
    )
    .unwrap()
}

/// Start a client and wait until `open` relays are connected.
async fn connected(network: &MemoryNetwork, relays: &[&str], identity: Identity) -> Client {
    let client = start(network, relays, identity);
    client.wait_until_ready().await.unwrap();
    let open = relays.len();
    eventually("all relays open", || client.pool().open_count() == open).await;
    client
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

fn status_of(engine: &DeliveryEngine, id: &LocalMessageId) -> MessageStatus {
    engine.message(id).unwrap().message.status
}

/// Engine over a bare pool, for tests that swap the codec or signer.
async fn engine_with(
    network: &MemoryNetwork,
    codec: Arc<dyn MessageCodec>,
    signer: Arc<dyn EventSigner>,
) -> DeliveryEngine {
    let settings = config(&[RELAY_A]);
    let pool = RelayPool::new(Arc::new(network.clone()), settings.pool_config());
    let monitor = Arc::new(NetworkMonitor::new());
    let engine = DeliveryEngine::builder(
        Identity::generate(),
        pool.clone(),
        Database::open_in_memory().unwrap(),
    )
    .codec(codec)
    .signer(signer)
    .monitor(monitor.clone())
    .config(settings.engine_config())
    .build()
    .unwrap();
    engine.start();

    pool.add_relay(RELAY_A).unwrap();
    pool.wait_for_connection(Duration::from_secs(2)).await.unwrap();
    monitor.set_relay_connection(true);
    engine
}

struct BrokenCodec;

impl MessageCodec for BrokenCodec {
    fn encrypt(&self, _: &Identity, _: &str, _: &PublicKey) -> Result<String, CryptoError> {
        Err(CryptoError::EncryptionFailed)
    }

    fn decrypt(&self, _: &Identity, _: &str, _: &PublicKey) -> Result<String, CryptoError> {
        Err(CryptoError::DecryptionFailed)
    }

    fn seal_group(&self, _: &SymmetricKey, _: &str) -> Result<String, CryptoError> {
        Err(CryptoError::EncryptionFailed)
    }

    fn open_group(&self, _: &SymmetricKey, _: &str) -> Result<String, CryptoError> {
        Err(CryptoError::DecryptionFailed)
    }
}

struct BrokenSigner;

impl EventSigner for BrokenSigner {
    fn sign(&self, _: UnsignedEvent, _: &Identity) -> Result<Event, SigningError> {
        Err(SigningError::Serialization("key store locked".into()))
    }
}

fn signed_dm(from: &Identity, to: &PublicKey, text: &str, created_at: i64) -> Event {
    let envelope = DirectMessageCodec.encrypt(from, text, to).unwrap();
    let unsigned = UnsignedEvent::new(
        from.public_key(),
        created_at,
        EventKind::DirectMessage,
        envelope,
    )
    .tag(&[TAG_PUBKEY, &to.to_hex()]);
    Ed25519Signer.sign(unsigned, from).unwrap()
}

#[tokio::test]
async fn test_accepted_by_single_relay() {
    let network = MemoryNetwork::new();
    let relay = network.relay(RELAY_A);
    let client = connected(&network, &[RELAY_A], Identity::generate()).await;
    let engine = client.engine();
    let bob = Identity::generate().public_key();

    let receipt = engine.send(SendRequest::direct(bob, "hello")).await.unwrap();

    assert_eq!(receipt.status, MessageStatus::Accepted);
    assert!(receipt.event_id.is_some());
    assert_eq!(relay.received_event_count(), 1);

    let view = engine.message(&receipt.local_id).unwrap();
    assert_eq!(view.message.event_id, receipt.event_id);
    assert_eq!(view.relay_summary().to_string(), "sent to 1 of 1 relays");
    assert_eq!(engine.queue_status().unwrap().total_queued, 0);

    let conversation = engine
        .conversation(&ConversationId::direct(&engine.public_key(), &bob))
        .unwrap();
    assert_eq!(conversation.len(), 1);
    assert_eq!(conversation[0].message.content, "hello");
}

#[tokio::test]
async fn test_one_acceptance_is_enough() {
    let network = MemoryNetwork::new();
    network.relay(RELAY_A);
    network.relay(RELAY_B).set_policy(AckPolicy::Silent);
    network.relay(RELAY_C).set_policy(AckPolicy::Silent);
    let client = connected(&network, &[RELAY_A, RELAY_B, RELAY_C], Identity::generate()).await;
    let bob = Identity::generate().public_key();

    let receipt = client
        .engine()
        .send(SendRequest::direct(bob, "quorum"))
        .await
        .unwrap();

    assert_eq!(receipt.status, MessageStatus::Accepted);
    eventually("every relay saw the event", || {
        [RELAY_A, RELAY_B, RELAY_C]
            .iter()
            .all(|url| network.relay(url).received_event_count() == 1)
    })
    .await;
}

#[tokio::test]
async fn test_rejected_when_every_relay_refuses() {
    let network = MemoryNetwork::new();
    network
        .relay(RELAY_A)
        .set_policy(AckPolicy::Reject("blocked".into()));
    network
        .relay(RELAY_B)
        .set_policy(AckPolicy::Reject("rate-limited".into()));
    let client = connected(&network, &[RELAY_A, RELAY_B], Identity::generate()).await;
    let engine = client.engine();

    let receipt = engine
        .send(SendRequest::direct(Identity::generate().public_key(), "nope"))
        .await
        .unwrap();

    assert_eq!(receipt.status, MessageStatus::Rejected);
    assert_eq!(receipt.error_kind, Some(ErrorKind::AllRelaysFailed));

    let view = engine.message(&receipt.local_id).unwrap();
    assert_eq!(view.relay_results.len(), 2);
    assert!(view.relay_results.iter().all(|r| !r.success));
    assert_eq!(view.relay_summary().to_string(), "sent to 0 of 2 relays");
    assert_eq!(engine.queue_status().unwrap().total_queued, 1);
}

#[tokio::test]
async fn test_offline_send_is_queued_then_flushed() {
    let network = MemoryNetwork::new();
    let relay = network.relay(RELAY_A);
    let client = connected(&network, &[RELAY_A], Identity::generate()).await;
    let engine = client.engine();
    let mut updates = engine.subscribe_status();

    client.monitor().set_online(false);
    let receipt = engine
        .send(SendRequest::direct(Identity::generate().public_key(), "later"))
        .await
        .unwrap();

    assert_eq!(receipt.status, MessageStatus::Queued);
    assert_eq!(receipt.error_kind, Some(ErrorKind::NetworkOffline));
    assert_eq!(relay.received_event_count(), 0);
    assert!(lock(&engine.inner.scheduler).is_scheduled(&receipt.local_id));
    assert_eq!(updates.recv().await.unwrap().status, MessageStatus::Sending);
    assert_eq!(updates.recv().await.unwrap().status, MessageStatus::Queued);

    client.monitor().set_online(true);
    eventually("queued message accepted", || {
        status_of(engine, &receipt.local_id) == MessageStatus::Accepted
    })
    .await;
    assert_eq!(relay.received_event_count(), 1);
    assert_eq!(engine.queue_status().unwrap().total_queued, 0);
}

#[tokio::test]
async fn test_no_open_relay_queues_without_sending() {
    let network = MemoryNetwork::new();
    let relay = network.relay(RELAY_A);
    relay.set_reachable(false);
    let client = start(&network, &[RELAY_A], Identity::generate());

    let receipt = client
        .engine()
        .send(SendRequest::direct(Identity::generate().public_key(), "anyone?"))
        .await
        .unwrap();

    assert_eq!(receipt.status, MessageStatus::Queued);
    assert_eq!(receipt.error_kind, Some(ErrorKind::AllRelaysFailed));
    assert_eq!(relay.received_event_count(), 0);

    relay.set_reachable(true);
    eventually("reconnect flushes outbox", || {
        status_of(client.engine(), &receipt.local_id) == MessageStatus::Accepted
    })
    .await;
    assert_eq!(relay.received_event_count(), 1);
}

#[tokio::test]
async fn test_gives_up_after_max_attempts_and_manual_retry_starts_over() {
    let network = MemoryNetwork::new();
    let relay = network.relay(RELAY_A);
    relay.set_policy(AckPolicy::Silent);
    let client = connected(&network, &[RELAY_A], Identity::generate()).await;
    let engine = client.engine();

    let receipt = engine
        .send(SendRequest::direct(Identity::generate().public_key(), "echo"))
        .await
        .unwrap();
    assert_eq!(receipt.status, MessageStatus::Queued);
    assert_eq!(receipt.error_kind, Some(ErrorKind::RelayTimeout));

    for _ in 0..4 {
        assert_eq!(engine.process_offline_queue().await.unwrap(), 1);
    }
    let view = engine.message(&receipt.local_id).unwrap();
    assert_eq!(view.message.status, MessageStatus::Failed);
    assert_eq!(view.message.retry_count, 5);
    assert_eq!(relay.received_event_count(), 5);

    // Failed messages are not picked up automatically.
    assert_eq!(engine.process_offline_queue().await.unwrap(), 0);
    assert_eq!(relay.received_event_count(), 5);

    relay.set_policy(AckPolicy::Accept);
    let retried = engine.retry_failed_message(&receipt.local_id).await.unwrap();
    assert_eq!(retried.status, MessageStatus::Accepted);
    assert_eq!(relay.received_event_count(), 6);

    // Every attempt carried the same signed event.
    let events = relay.received_events();
    assert!(events.iter().all(|e| Some(e.id) == receipt.event_id));
}

#[tokio::test]
async fn test_concurrent_retries_send_once() {
    let network = MemoryNetwork::new();
    let relay = network.relay(RELAY_A);
    relay.set_policy(AckPolicy::Reject("busy".into()));
    let client = connected(&network, &[RELAY_A], Identity::generate()).await;
    let engine = client.engine();

    let receipt = engine
        .send(SendRequest::direct(Identity::generate().public_key(), "once"))
        .await
        .unwrap();
    assert_eq!(receipt.status, MessageStatus::Rejected);

    relay.set_policy(AckPolicy::Accept);
    let (manual, automatic) = tokio::join!(
        engine.retry_failed_message(&receipt.local_id),
        engine.process_offline_queue(),
    );
    manual.unwrap();
    automatic.unwrap();

    assert_eq!(relay.received_event_count(), 2);
    assert_eq!(status_of(engine, &receipt.local_id), MessageStatus::Accepted);
}

#[tokio::test]
async fn test_cancel_removes_queued_message() {
    let network = MemoryNetwork::new();
    let relay = network.relay(RELAY_A);
    let client = connected(&network, &[RELAY_A], Identity::generate()).await;
    let engine = client.engine();

    client.monitor().set_online(false);
    let receipt = engine
        .send(SendRequest::direct(Identity::generate().public_key(), "never"))
        .await
        .unwrap();

    assert!(engine.cancel(&receipt.local_id).unwrap());
    assert!(!engine.cancel(&receipt.local_id).unwrap());
    assert_eq!(status_of(engine, &receipt.local_id), MessageStatus::Cancelled);
    assert_eq!(engine.queue_status().unwrap().total_queued, 0);

    client.monitor().set_online(true);
    assert_eq!(engine.process_offline_queue().await.unwrap(), 0);
    assert_eq!(relay.received_event_count(), 0);

    let retry = engine.retry_failed_message(&receipt.local_id).await;
    assert_eq!(retry.unwrap_err().kind, ErrorKind::InvalidInput);
}

#[tokio::test]
async fn test_invalid_input_is_not_persisted() {
    let network = MemoryNetwork::new();
    network.relay(RELAY_A);
    let client = connected(&network, &[RELAY_A], Identity::generate()).await;
    let engine = client.engine();
    let bob = Identity::generate().public_key();

    let empty = engine.send(SendRequest::direct(bob, "  ")).await;
    assert_eq!(empty.unwrap_err().kind, ErrorKind::InvalidInput);

    let bad_key = engine.send_text("not-a-key", "hi").await;
    assert_eq!(bad_key.unwrap_err().kind, ErrorKind::InvalidInput);

    let group = engine
        .send(SendRequest::group(GroupId::new("nobody"), "hi"))
        .await;
    assert_eq!(group.unwrap_err().kind, ErrorKind::InvalidInput);

    assert!(engine.conversation_ids().unwrap().is_empty());
}

#[tokio::test]
async fn test_alice_reaches_bob_through_mixed_relays() {
    let network = MemoryNetwork::new();
    network.relay(RELAY_A);
    network
        .relay(RELAY_B)
        .set_policy(AckPolicy::Reject("rate-limited".into()));
    let alice_id = Identity::generate();
    let bob_id = Identity::generate();
    let alice_key = alice_id.public_key();
    let bob_key = bob_id.public_key();

    let bob = connected(&network, &[RELAY_A, RELAY_B], bob_id).await;
    let alice = connected(&network, &[RELAY_A, RELAY_B], alice_id).await;
    let mut incoming = bob.engine().subscribe_incoming();

    let receipt = alice
        .engine()
        .send(SendRequest::direct(bob_key, "hi bob"))
        .await
        .unwrap();
    assert_eq!(receipt.status, MessageStatus::Accepted);

    let received = timeout(Duration::from_secs(2), incoming.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.content, "hi bob");
    assert_eq!(received.sender, alice_key);
    assert_eq!(received.event_id, receipt.event_id);
    assert_eq!(received.status, MessageStatus::Delivered);

    let conversation = ConversationId::direct(&alice_key, &bob_key);
    assert_eq!(bob.engine().conversation(&conversation).unwrap().len(), 1);

    // The rejecting relay's answer lands after acceptance and is still recorded.
    eventually("both relay results", || {
        alice
            .engine()
            .message(&receipt.local_id)
            .map(|v| v.relay_results.len() == 2)
            .unwrap_or(false)
    })
    .await;
    let view = alice.engine().message(&receipt.local_id).unwrap();
    assert_eq!(view.message.status, MessageStatus::Accepted);
    assert_eq!(view.relay_summary().to_string(), "sent to 1 of 2 relays");

    // Bob reacts; Alice sees it on her copy.
    assert!(bob.engine().react(&received.local_id, "👍").unwrap());
    eventually("reaction reaches alice", || {
        alice
            .engine()
            .message(&receipt.local_id)
            .map(|v| v.reactions.get("👍") == Some(&1))
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_offline_recipient_catches_up_once() {
    let network = MemoryNetwork::new();
    network.relay(RELAY_A);
    network.relay(RELAY_B);
    let alice_id = Identity::generate();
    let bob_id = Identity::generate();
    let alice_key = alice_id.public_key();
    let bob_key = bob_id.public_key();

    let alice = connected(&network, &[RELAY_A, RELAY_B], alice_id).await;
    let receipt = alice
        .engine()
        .send(SendRequest::direct(bob_key, "while you were out"))
        .await
        .unwrap();
    assert_eq!(receipt.status, MessageStatus::Accepted);
    eventually("both relays stored the event", || {
        network.relay(RELAY_B).stored_events().len() == 1
            && network.relay(RELAY_A).stored_events().len() == 1
    })
    .await;

    // The live subscription starts at the current second; step past the event.
    sleep(Duration::from_millis(1100)).await;
    let bob = connected(&network, &[RELAY_A, RELAY_B], bob_id).await;
    assert_eq!(bob.engine().sync_missed_messages(None).await.unwrap(), 1);
    assert_eq!(bob.engine().sync_missed_messages(None).await.unwrap(), 0);

    let conversation = bob
        .engine()
        .conversation(&ConversationId::direct(&alice_key, &bob_key))
        .unwrap();
    assert_eq!(conversation.len(), 1);
    assert_eq!(conversation[0].message.content, "while you were out");
}

#[tokio::test]
async fn test_inbound_is_ordered_and_deduplicated() {
    let network = MemoryNetwork::new();
    let a = network.relay(RELAY_A);
    let b = network.relay(RELAY_B);
    let alice = Identity::generate();
    let bob_id = Identity::generate();
    let bob_key = bob_id.public_key();
    let bob = connected(&network, &[RELAY_A, RELAY_B], bob_id).await;

    let now = Utc::now().timestamp();
    let first = signed_dm(&alice, &bob_key, "first", now + 30);
    let second = signed_dm(&alice, &bob_key, "second", now + 10);
    let third = signed_dm(&alice, &bob_key, "third", now + 20);

    a.inject(first.clone());
    b.inject(first);
    a.inject(second);
    b.inject(third);

    let conversation_id = ConversationId::direct(&alice.public_key(), &bob_key);
    eventually("three messages", || {
        bob.engine()
            .conversation(&conversation_id)
            .map(|c| c.len() == 3)
            .unwrap_or(false)
    })
    .await;
    sleep(Duration::from_millis(50)).await;

    let contents: Vec<String> = bob
        .engine()
        .conversation(&conversation_id)
        .unwrap()
        .into_iter()
        .map(|v| v.message.content)
        .collect();
    assert_eq!(contents, vec!["second", "third", "first"]);
    assert!(bob
        .engine()
        .tracer()
        .snapshot()
        .iter()
        .any(|r| r.stage == FlowStage::Duplicate));
}

#[tokio::test]
async fn test_tampered_and_misaddressed_events_are_dropped() {
    let network = MemoryNetwork::new();
    let relay = network.relay(RELAY_A);
    let alice = Identity::generate();
    let carol = Identity::generate().public_key();
    let bob_id = Identity::generate();
    let bob_key = bob_id.public_key();
    let bob = connected(&network, &[RELAY_A], bob_id).await;
    let now = Utc::now().timestamp() + 5;

    let mut tampered = signed_dm(&alice, &bob_key, "original", now);
    tampered.content = signed_dm(&alice, &bob_key, "forged", now).content;
    relay.inject(tampered);
    relay.inject(signed_dm(&alice, &carol, "for carol", now));
    relay.inject(signed_dm(&alice, &bob_key, "genuine", now));

    let conversation_id = ConversationId::direct(&alice.public_key(), &bob_key);
    eventually("genuine message", || {
        bob.engine()
            .conversation(&conversation_id)
            .map(|c| !c.is_empty())
            .unwrap_or(false)
    })
    .await;

    let conversation = bob.engine().conversation(&conversation_id).unwrap();
    assert_eq!(conversation.len(), 1);
    assert_eq!(conversation[0].message.content, "genuine");
    assert!(bob
        .engine()
        .tracer()
        .snapshot()
        .iter()
        .any(|r| r.stage == FlowStage::Discarded));
}

#[tokio::test]
async fn test_group_messages_reach_members() {
    let network = MemoryNetwork::new();
    network.relay(RELAY_A);
    let group = GroupId::new("book-club");

    let alice = start(&network, &[], Identity::generate());
    let bob = start(&network, &[], Identity::generate());
    alice.engine().join_group(&group, b"shared secret").unwrap();
    bob.engine().join_group(&group, b"shared secret").unwrap();
    for client in [&alice, &bob] {
        client.pool().add_relay(RELAY_A).unwrap();
        client.wait_until_ready().await.unwrap();
    }
    let mut incoming = bob.engine().subscribe_incoming();

    let receipt = alice
        .engine()
        .send(SendRequest::group(group.clone(), "chapter 3 tonight"))
        .await
        .unwrap();
    assert_eq!(receipt.status, MessageStatus::Accepted);

    let received = timeout(Duration::from_secs(2), incoming.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.content, "chapter 3 tonight");
    assert_eq!(received.conversation_id, ConversationId::group(&group));
    assert_eq!(received.group_id, Some(group));
}

#[tokio::test]
async fn test_mark_delivered_only_after_acceptance() {
    let network = MemoryNetwork::new();
    network.relay(RELAY_A);
    let client = connected(&network, &[RELAY_A], Identity::generate()).await;
    let engine = client.engine();

    let receipt = engine
        .send(SendRequest::direct(Identity::generate().public_key(), "ping"))
        .await
        .unwrap();
    let event_id = receipt.event_id.unwrap();

    assert!(engine.mark_delivered(&event_id).unwrap());
    assert!(!engine.mark_delivered(&event_id).unwrap());
    assert_eq!(status_of(engine, &receipt.local_id), MessageStatus::Delivered);

    assert!(engine.delete_message(&receipt.local_id).unwrap());
    assert!(engine.message(&receipt.local_id).unwrap().message.is_deleted());
}

#[tokio::test]
async fn test_sync_requires_a_relay() {
    let network = MemoryNetwork::new();
    network.relay(RELAY_A).set_reachable(false);
    let client = start(&network, &[RELAY_A], Identity::generate());

    let err = client.engine().sync_missed_messages(None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::AllRelaysFailed);
}

#[tokio::test]
async fn test_pending_send_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("murmur.db");
    let network = MemoryNetwork::new();
    let relay = network.relay(RELAY_A);
    relay.set_policy(AckPolicy::Silent);
    let identity = Identity::generate();
    let secret = *identity.secret_bytes();

    let first = Client::start(
        config(&[RELAY_A]),
        identity,
        Arc::new(network.clone()),
        Database::open_at(&db_path).unwrap(),
    )
    .unwrap();
    first.wait_until_ready().await.unwrap();
    let receipt = first
        .engine()
        .send(SendRequest::direct(Identity::generate().public_key(), "persist me"))
        .await
        .unwrap();
    assert_eq!(receipt.status, MessageStatus::Queued);
    first.shutdown();
    drop(first);

    relay.set_policy(AckPolicy::Accept);
    let second = Client::start(
        config(&[RELAY_A]),
        Identity::from_secret_bytes(&secret),
        Arc::new(network.clone()),
        Database::open_at(&db_path).unwrap(),
    )
    .unwrap();
    eventually("restored message accepted", || {
        status_of(second.engine(), &receipt.local_id) == MessageStatus::Accepted
    })
    .await;
    assert_eq!(relay.received_event_count(), 2);
}

#[tokio::test]
async fn test_every_relay_result_is_recorded_after_quorum() {
    let network = MemoryNetwork::new();
    for url in [RELAY_A, RELAY_B, RELAY_C] {
        network.relay(url);
    }
    let client = connected(&network, &[RELAY_A, RELAY_B, RELAY_C], Identity::generate()).await;
    let engine = client.engine();

    for text in ["one", "two", "three"] {
        let receipt = engine
            .send(SendRequest::direct(Identity::generate().public_key(), text))
            .await
            .unwrap();
        assert_eq!(receipt.status, MessageStatus::Accepted);

        eventually("three relay results", || {
            engine
                .message(&receipt.local_id)
                .map(|v| v.relay_results.len() == 3)
                .unwrap_or(false)
        })
        .await;
        let view = engine.message(&receipt.local_id).unwrap();
        assert_eq!(view.relay_summary().to_string(), "sent to 3 of 3 relays");
    }
}

#[tokio::test]
async fn test_cancel_during_attempt_leaves_it_running() {
    let network = MemoryNetwork::new();
    let relay = network.relay(RELAY_A);
    relay.set_policy(AckPolicy::Silent);
    let client = connected(&network, &[RELAY_A], Identity::generate()).await;
    let engine = client.engine();

    let (receipt, during) = tokio::join!(
        engine.send(SendRequest::direct(Identity::generate().public_key(), "hold on")),
        async {
            eventually("event published", || relay.received_event_count() == 1).await;
            let local_id = engine.db().outbox_entries().unwrap()[0].local_id;
            let first = engine.cancel(&local_id).unwrap();
            let second = engine.cancel(&local_id).unwrap();
            let still_marked = lock(&engine.inner.in_flight).contains(&local_id);
            let flushed = engine.process_offline_queue().await.unwrap();
            (first, second, still_marked, flushed)
        }
    );
    assert_eq!(during, (false, false, true, 0));

    let receipt = receipt.unwrap();
    assert_eq!(receipt.status, MessageStatus::Queued);
    assert!(lock(&engine.inner.in_flight).is_empty());
    assert_eq!(relay.received_event_count(), 1);

    assert!(engine.cancel(&receipt.local_id).unwrap());
    assert_eq!(status_of(engine, &receipt.local_id), MessageStatus::Cancelled);
}

#[tokio::test]
async fn test_due_retry_resends_at_its_time() {
    let network = MemoryNetwork::new();
    let relay = network.relay(RELAY_A);
    relay.set_policy(AckPolicy::Silent);
    let client = connected(&network, &[RELAY_A], Identity::generate()).await;
    let engine = client.engine();

    let receipt = engine
        .send(SendRequest::direct(Identity::generate().public_key(), "again"))
        .await
        .unwrap();
    assert_eq!(receipt.status, MessageStatus::Queued);
    let entry = engine
        .db()
        .get_outbox_entry(&receipt.local_id)
        .unwrap()
        .unwrap();
    let ready_at = entry.next_attempt_at.unwrap();
    assert!(ready_at > Utc::now());

    relay.set_policy(AckPolicy::Accept);
    assert_eq!(engine.run_due_retries(Utc::now()).await, 0);
    assert_eq!(relay.received_event_count(), 1);

    let later = ready_at + chrono::Duration::seconds(1);
    assert_eq!(engine.run_due_retries(later).await, 1);
    assert_eq!(status_of(engine, &receipt.local_id), MessageStatus::Accepted);
    assert_eq!(relay.received_event_count(), 2);
    assert_eq!(engine.queue_status().unwrap().total_queued, 0);
}

#[tokio::test]
async fn test_codec_and_signer_failures_are_final() {
    let network = MemoryNetwork::new();
    let relay = network.relay(RELAY_A);
    let cases: [(Arc<dyn MessageCodec>, Arc<dyn EventSigner>, ErrorKind); 2] = [
        (Arc::new(BrokenCodec), Arc::new(Ed25519Signer), ErrorKind::EncryptionFailed),
        (Arc::new(DirectMessageCodec), Arc::new(BrokenSigner), ErrorKind::SignatureFailed),
    ];

    for (codec, signer, kind) in cases {
        let engine = engine_with(&network, codec, signer).await;
        let err = engine
            .send(SendRequest::direct(Identity::generate().public_key(), "secret"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, kind);

        let local_id = err.message_id.unwrap();
        let message = engine.message(&local_id).unwrap().message;
        assert_eq!(message.status, MessageStatus::Failed);
        assert_eq!(message.error_kind.as_deref(), Some(kind.as_str()));
        assert_eq!(engine.queue_status().unwrap().total_queued, 0);

        assert_eq!(engine.process_offline_queue().await.unwrap(), 0);
        let later = Utc::now() + chrono::Duration::days(1);
        assert_eq!(engine.run_due_retries(later).await, 0);
        engine.shutdown();
    }
    assert_eq!(relay.received_event_count(), 0);
}

#[tokio::test]
async fn test_storage_error_mid_attempt_requeues() {
    let network = MemoryNetwork::new();
    let relay = network.relay(RELAY_A);
    let client = connected(&network, &[RELAY_A], Identity::generate()).await;
    let engine = client.engine();
    engine
        .db()
        .conn()
        .execute_batch("DROP TABLE relay_results")
        .unwrap();

    let err = engine
        .send(SendRequest::direct(Identity::generate().public_key(), "fragile"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::StorageFailed);
    assert_eq!(relay.received_event_count(), 1);

    let local_id = err.message_id.unwrap();
    let message = engine.db().get_message(&local_id).unwrap();
    assert_eq!(message.status, MessageStatus::Queued);
    assert_eq!(message.error_kind.as_deref(), Some("storage_failed"));
    assert_eq!(engine.queue_status().unwrap().total_queued, 1);
    assert!(lock(&engine.inner.in_flight).is_empty());
    assert!(lock(&engine.inner.scheduler).is_scheduled(&local_id));
}
