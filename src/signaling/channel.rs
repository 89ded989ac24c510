//! Signaling channel
//!
//! Relays offer/answer/ICE messages between two peers through the
//! room's mailbox store. Storage delivery is at-least-once; a bounded
//! dedup cache plus delete-after-processing gives at-most-once
//! observable effect. A background sweep bounds mailbox growth when a
//! receiver never appears.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::mailbox::MailboxStore;
use super::message::{epoch_millis, IncomingSignal, SignalKind, SignalMessage};
use crate::config::RoomRtcConfig;
use crate::Result;

/// Maximum signal ids remembered for deduplication; oldest evicted first.
const DEDUP_CACHE_CAPACITY: usize = 100;

/// Bounded first-in-first-out set of processed dedup keys.
struct DedupCache {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupCache {
    fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(DEDUP_CACHE_CAPACITY),
            seen: HashSet::with_capacity(DEDUP_CACHE_CAPACITY),
        }
    }

    /// Record a key; returns false when it was already present.
    fn insert(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() >= DEDUP_CACHE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.seen.insert(key);
        true
    }
}

/// Relays typed signaling messages through a shared room mailbox
pub struct SignalingChannel {
    room_id: String,
    local_id: String,
    ttl_ms: u64,
    sweep_interval: Duration,
    store: Arc<dyn MailboxStore>,
    processed: Arc<Mutex<DedupCache>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Create a channel bound to one room and one local user id.
    pub fn new(
        room_id: impl Into<String>,
        local_id: impl Into<String>,
        store: Arc<dyn MailboxStore>,
        config: &RoomRtcConfig,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            local_id: local_id.into(),
            ttl_ms: config.signal_ttl_ms,
            sweep_interval: Duration::from_secs(config.signal_sweep_interval_secs),
            store,
            processed: Arc::new(Mutex::new(DedupCache::new())),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Local user id this channel receives for.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Write one signal to the room mailbox, returning once stored.
    pub async fn send(
        &self,
        kind: SignalKind,
        payload: serde_json::Value,
        to: &str,
    ) -> Result<()> {
        let msg = SignalMessage::new(
            kind,
            payload,
            self.local_id.clone(),
            to,
            self.room_id.clone(),
            self.ttl_ms,
        );

        debug!(kind = %msg.kind, to, signal_id = %msg.signal_id, "Sending signal");
        self.store.put(msg).await
    }

    /// Subscribe to signals addressed to the local id and start the
    /// periodic TTL sweep.
    ///
    /// Each new mailbox entry is deduplicated against a bounded cache,
    /// decoded (ICE payloads into the engine's native candidate type),
    /// handed to `on_signal`, and then deleted from the mailbox.
    pub async fn listen<F, Fut>(&self, on_signal: F) -> Result<()>
    where
        F: Fn(IncomingSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.store.subscribe(&self.room_id, &self.local_id).await?;

        let store = Arc::clone(&self.store);
        let processed = Arc::clone(&self.processed);
        let room_id = self.room_id.clone();
        let local_id = self.local_id.clone();

        let listener = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let key = msg.dedup_key();
                let first_time = processed.lock().insert(key);
                if !first_time {
                    debug!(signal_id = %msg.signal_id, "Skipping duplicate signal");
                    continue;
                }

                match IncomingSignal::from_message(&msg) {
                    Ok(signal) => on_signal(signal).await,
                    Err(e) => {
                        // Still deleted below so a malformed entry cannot
                        // be redelivered forever
                        warn!(local_id = %local_id, error = %e, "Dropping undecodable signal");
                    }
                }

                if let Err(e) = store.delete(&room_id, &msg.signal_id).await {
                    warn!(signal_id = %msg.signal_id, error = %e, "Failed to delete consumed signal");
                }
            }

            debug!(local_id = %local_id, "Signal listener ended");
        });

        let store = Arc::clone(&self.store);
        let room_id = self.room_id.clone();
        let sweep_interval = self.sweep_interval;

        let sweeper = tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                match store.purge_expired(&room_id, epoch_millis()).await {
                    Ok(0) => {}
                    Ok(n) => debug!(room_id = %room_id, purged = n, "Mailbox sweep"),
                    Err(e) => warn!(room_id = %room_id, error = %e, "Mailbox sweep failed"),
                }
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.push(listener);
        tasks.push(sweeper);

        info!(room_id = %self.room_id, local_id = %self.local_id, "Signaling channel listening");
        Ok(())
    }

    /// Cancel the sweep and all subscriptions. Idempotent.
    pub fn cleanup(&self) {
        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::mailbox::MemoryMailbox;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> RoomRtcConfig {
        RoomRtcConfig::default()
    }

    #[tokio::test]
    async fn test_send_stores_message() {
        let mailbox = Arc::new(MemoryMailbox::new());
        let channel =
            SignalingChannel::new("room-1", "alice", mailbox.clone(), &test_config());

        channel
            .send(SignalKind::Offer, serde_json::json!("sdp"), "bob")
            .await
            .unwrap();

        assert_eq!(mailbox.entry_count("room-1"), 1);
        let stored = &mailbox.entries("room-1")[0];
        assert_eq!(stored.from, "alice");
        assert_eq!(stored.to, "bob");
        assert_eq!(stored.ttl, 60_000);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_invokes_handler_once() {
        let mailbox = Arc::new(MemoryMailbox::new());
        let alice = SignalingChannel::new("room-1", "alice", mailbox.clone(), &test_config());
        let bob = SignalingChannel::new("room-1", "bob", mailbox.clone(), &test_config());

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        bob.listen(move |_signal| {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();

        alice
            .send(SignalKind::Offer, serde_json::json!("sdp"), "bob")
            .await
            .unwrap();

        // Redeliver the exact same message (at-least-once storage)
        let dup = mailbox.entries("room-1").pop();
        if let Some(dup) = dup {
            mailbox.put(dup).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        bob.cleanup();
        alice.cleanup();
    }

    #[tokio::test]
    async fn test_consumed_signal_deleted_from_mailbox() {
        let mailbox = Arc::new(MemoryMailbox::new());
        let alice = SignalingChannel::new("room-1", "alice", mailbox.clone(), &test_config());
        let bob = SignalingChannel::new("room-1", "bob", mailbox.clone(), &test_config());

        bob.listen(|_signal| async {}).await.unwrap();
        alice
            .send(SignalKind::Answer, serde_json::json!("sdp"), "bob")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mailbox.entry_count("room-1"), 0);

        bob.cleanup();
        alice.cleanup();
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let mailbox = Arc::new(MemoryMailbox::new());
        let channel = SignalingChannel::new("room-1", "alice", mailbox, &test_config());

        channel.listen(|_signal| async {}).await.unwrap();
        channel.cleanup();
        channel.cleanup();
    }

    #[test]
    fn test_dedup_cache_eviction() {
        let mut cache = DedupCache::new();

        for i in 0..DEDUP_CACHE_CAPACITY {
            assert!(cache.insert(format!("key-{}", i)));
        }

        // Capacity reached: inserting a new key evicts the oldest
        assert!(cache.insert("overflow".to_string()));
        assert!(cache.insert("key-0".to_string()), "evicted key is forgotten");
        assert!(!cache.insert("overflow".to_string()));
    }
}
