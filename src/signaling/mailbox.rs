//! Mailbox store seam
//!
//! The persistent room/participant document store is an external
//! collaborator; the core only needs a mailbox it can write signals
//! into, subscribe to, and purge. Delivery is at-least-once; the
//! channel layer deduplicates and deletes after processing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

use super::message::SignalMessage;
use crate::{Error, Result};

/// Room-scoped signal mailbox
#[async_trait]
pub trait MailboxStore: Send + Sync {
    /// Durably store one message. Returns once the write is visible to
    /// subscribers.
    async fn put(&self, msg: SignalMessage) -> Result<()>;

    /// Delete a message by signal id; deleting an unknown id is a no-op.
    async fn delete(&self, room_id: &str, signal_id: &str) -> Result<()>;

    /// Subscribe to all messages addressed to `recipient` in `room_id`.
    /// Messages already in the mailbox are replayed first.
    async fn subscribe(
        &self,
        room_id: &str,
        recipient: &str,
    ) -> Result<mpsc::Receiver<SignalMessage>>;

    /// Purge every entry whose `timestamp + ttl` has elapsed, regardless
    /// of consumption state. Returns the number of purged entries.
    async fn purge_expired(&self, room_id: &str, now_ms: u64) -> Result<usize>;
}

type Subscriber = (String, mpsc::Sender<SignalMessage>);

#[derive(Default)]
struct RoomState {
    entries: Vec<SignalMessage>,
    subscribers: Vec<Subscriber>,
}

/// In-process mailbox for tests and embedders without a backing store.
///
/// Senders and receivers share one instance; at-least-once delivery is
/// modelled by replaying undelivered entries on subscribe and by never
/// deduplicating on the store side.
#[derive(Default)]
pub struct MemoryMailbox {
    rooms: Mutex<HashMap<String, RoomState>>,
}

impl MemoryMailbox {
    /// Create an empty mailbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of undeleted entries in a room (test/monitoring helper).
    pub fn entry_count(&self, room_id: &str) -> usize {
        self.rooms
            .lock()
            .get(room_id)
            .map(|r| r.entries.len())
            .unwrap_or(0)
    }

    /// Snapshot of undeleted entries in a room (test helper).
    pub fn entries(&self, room_id: &str) -> Vec<SignalMessage> {
        self.rooms
            .lock()
            .get(room_id)
            .map(|r| r.entries.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MailboxStore for MemoryMailbox {
    async fn put(&self, msg: SignalMessage) -> Result<()> {
        let mut rooms = self.rooms.lock();
        let room = rooms.entry(msg.room_id.clone()).or_default();

        // Fan out to live subscribers for the recipient; a full or closed
        // receiver surfaces as a delivery failure the caller may retry.
        for (recipient, tx) in &room.subscribers {
            if recipient == &msg.to {
                tx.try_send(msg.clone())
                    .map_err(|e| Error::Delivery(format!("mailbox fan-out failed: {}", e)))?;
            }
        }

        room.entries.push(msg);
        Ok(())
    }

    async fn delete(&self, room_id: &str, signal_id: &str) -> Result<()> {
        let mut rooms = self.rooms.lock();
        if let Some(room) = rooms.get_mut(room_id) {
            room.entries.retain(|m| m.signal_id != signal_id);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        room_id: &str,
        recipient: &str,
    ) -> Result<mpsc::Receiver<SignalMessage>> {
        let (tx, rx) = mpsc::channel(64);

        let mut rooms = self.rooms.lock();
        let room = rooms.entry(room_id.to_string()).or_default();

        // Replay whatever is already waiting for this recipient
        for msg in room.entries.iter().filter(|m| m.to == recipient) {
            tx.try_send(msg.clone())
                .map_err(|e| Error::Delivery(format!("mailbox replay failed: {}", e)))?;
        }

        room.subscribers.push((recipient.to_string(), tx));
        Ok(rx)
    }

    async fn purge_expired(&self, room_id: &str, now_ms: u64) -> Result<usize> {
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get_mut(room_id) else {
            return Ok(0);
        };

        let before = room.entries.len();
        room.entries.retain(|m| !m.is_expired_at(now_ms));
        let purged = before - room.entries.len();

        if purged > 0 {
            debug!(room_id, purged, "Purged expired mailbox entries");
        }

        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::message::{SignalKind, DEFAULT_SIGNAL_TTL_MS};

    fn msg(from: &str, to: &str) -> SignalMessage {
        SignalMessage::new(
            SignalKind::Offer,
            serde_json::json!("sdp"),
            from,
            to,
            "room-1",
            DEFAULT_SIGNAL_TTL_MS,
        )
    }

    #[tokio::test]
    async fn test_put_then_subscribe_replays() {
        let mailbox = MemoryMailbox::new();
        mailbox.put(msg("alice", "bob")).await.unwrap();

        let mut rx = mailbox.subscribe("room-1", "bob").await.unwrap();
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.from, "alice");
    }

    #[tokio::test]
    async fn test_subscribe_then_put_delivers_live() {
        let mailbox = MemoryMailbox::new();
        let mut rx = mailbox.subscribe("room-1", "bob").await.unwrap();

        mailbox.put(msg("alice", "bob")).await.unwrap();
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.to, "bob");
    }

    #[tokio::test]
    async fn test_delivery_is_recipient_scoped() {
        let mailbox = MemoryMailbox::new();
        let mut bob_rx = mailbox.subscribe("room-1", "bob").await.unwrap();
        let mut carol_rx = mailbox.subscribe("room-1", "carol").await.unwrap();

        mailbox.put(msg("alice", "bob")).await.unwrap();

        assert_eq!(bob_rx.recv().await.unwrap().to, "bob");
        assert!(carol_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delete_removes_entry() {
        let mailbox = MemoryMailbox::new();
        let m = msg("alice", "bob");
        let id = m.signal_id.clone();
        mailbox.put(m).await.unwrap();
        assert_eq!(mailbox.entry_count("room-1"), 1);

        mailbox.delete("room-1", &id).await.unwrap();
        assert_eq!(mailbox.entry_count("room-1"), 0);

        // Unknown id is a no-op
        mailbox.delete("room-1", "missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_expired_ignores_fresh() {
        let mailbox = MemoryMailbox::new();
        let mut stale = msg("alice", "bob");
        stale.timestamp = 0;
        stale.ttl = 1;
        let fresh = msg("alice", "bob");

        mailbox.put(stale).await.unwrap();
        mailbox.put(fresh).await.unwrap();

        let purged = mailbox
            .purge_expired("room-1", crate::signaling::message::epoch_millis())
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(mailbox.entry_count("room-1"), 1);
    }
}
