//! Signaling integration tests: mailbox relay, dedup, and sweeping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use jamroom::signaling::IncomingSignal;
use jamroom::{MailboxStore, MemoryMailbox, RoomRtcConfig, SignalKind, SignalingChannel};

fn channel(user: &str, mailbox: &Arc<MemoryMailbox>) -> SignalingChannel {
    SignalingChannel::new(
        "room-1",
        user,
        Arc::clone(mailbox) as Arc<dyn MailboxStore>,
        &RoomRtcConfig::default(),
    )
}

#[tokio::test]
async fn offer_relayed_to_addressee_only() {
    let mailbox = Arc::new(MemoryMailbox::new());
    let alice = channel("alice", &mailbox);
    let bob = channel("bob", &mailbox);
    let carol = channel("carol", &mailbox);

    let bob_seen = Arc::new(Mutex::new(Vec::new()));
    let carol_seen = Arc::new(AtomicUsize::new(0));

    let seen = Arc::clone(&bob_seen);
    bob.listen(move |signal| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().push(signal);
        }
    })
    .await
    .unwrap();

    let count = Arc::clone(&carol_seen);
    carol
        .listen(move |_| {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();

    alice
        .send(SignalKind::Offer, serde_json::json!("v=0 fake-sdp"), "bob")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let signals = bob_seen.lock();
    assert_eq!(signals.len(), 1);
    match &signals[0] {
        IncomingSignal::Offer { from, sdp } => {
            assert_eq!(from, "alice");
            assert_eq!(sdp, "v=0 fake-sdp");
        }
        other => panic!("expected offer, got {:?}", other),
    }
    assert_eq!(carol_seen.load(Ordering::SeqCst), 0);

    alice.cleanup();
    bob.cleanup();
    carol.cleanup();
}

#[tokio::test]
async fn redelivered_signal_processed_once() {
    let mailbox = Arc::new(MemoryMailbox::new());
    let alice = channel("alice", &mailbox);
    let bob = channel("bob", &mailbox);

    let calls = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&calls);
    bob.listen(move |_| {
        let count = Arc::clone(&count);
        async move {
            count.fetch_add(1, Ordering::SeqCst);
        }
    })
    .await
    .unwrap();

    alice
        .send(SignalKind::Answer, serde_json::json!("sdp"), "bob")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Simulate at-least-once storage redelivering the consumed entry
    let delivered = mailbox.entries("room-1");
    for msg in delivered {
        mailbox.put(msg).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);

    alice.cleanup();
    bob.cleanup();
}

#[tokio::test]
async fn processed_signals_are_deleted() {
    let mailbox = Arc::new(MemoryMailbox::new());
    let alice = channel("alice", &mailbox);
    let bob = channel("bob", &mailbox);

    bob.listen(|_| async {}).await.unwrap();

    for _ in 0..3 {
        alice
            .send(SignalKind::Offer, serde_json::json!("sdp"), "bob")
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(mailbox.entry_count("room-1"), 0);

    alice.cleanup();
    bob.cleanup();
}

#[tokio::test]
async fn malformed_ice_payload_does_not_stop_listener() {
    let mailbox = Arc::new(MemoryMailbox::new());
    let alice = channel("alice", &mailbox);
    let bob = channel("bob", &mailbox);

    let calls = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&calls);
    bob.listen(move |_| {
        let count = Arc::clone(&count);
        async move {
            count.fetch_add(1, Ordering::SeqCst);
        }
    })
    .await
    .unwrap();

    // Candidate payload that is not a candidate object
    alice
        .send(SignalKind::IceCandidate, serde_json::json!(42), "bob")
        .await
        .unwrap();
    // A good signal afterwards still arrives
    alice
        .send(SignalKind::Offer, serde_json::json!("sdp"), "bob")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // The malformed entry was still consumed
    assert_eq!(mailbox.entry_count("room-1"), 0);

    alice.cleanup();
    bob.cleanup();
}

#[tokio::test]
async fn expired_entries_are_swept() {
    let mailbox = Arc::new(MemoryMailbox::new());
    let config = RoomRtcConfig {
        signal_ttl_ms: 10,
        signal_sweep_interval_secs: 1,
        ..Default::default()
    };
    let alice = SignalingChannel::new(
        "room-1",
        "alice",
        Arc::clone(&mailbox) as Arc<dyn MailboxStore>,
        &config,
    );

    // Nobody listens for bob, so the entry just sits in the mailbox
    alice
        .send(SignalKind::Offer, serde_json::json!("sdp"), "bob")
        .await
        .unwrap();
    assert_eq!(mailbox.entry_count("room-1"), 1);

    // The sweep task belongs to a listening channel
    alice.listen(|_| async {}).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert_eq!(mailbox.entry_count("room-1"), 0);
    alice.cleanup();
}
