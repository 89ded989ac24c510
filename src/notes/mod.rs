//! Note event broadcast and echo suppression
//!
//! Played notes are published to every participant over a shared bus.
//! Because the bus may loop a sender's own events back (and deliver
//! duplicates), the coordinator drops everything carrying the local
//! user id, then applies a short dedup window, before anything reaches
//! the local synthesizer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::signaling::epoch_millis;
use crate::synth::NoteSynthesizer;
use crate::{Error, Result};

/// Velocity clamp range applied before an event leaves or plays.
const VELOCITY_RANGE: (f32, f32) = (0.1, 1.0);
/// Duration clamp range in milliseconds.
const DURATION_RANGE_MS: (u64, u64) = (100, 3000);
/// Bucket width for the timestamp-based dedup key.
const DEDUP_BUCKET_MS: u64 = 200;
/// Dedup map size that triggers an expiry sweep.
const DEDUP_CLEANUP_THRESHOLD: usize = 100;

/// One played note crossing the peer boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentNoteEvent {
    /// Player's user id
    pub user_id: String,
    /// Scientific pitch name, e.g. "C4"
    pub note: String,
    /// Instrument preset name
    pub instrument: String,
    /// Strike velocity in [0.1, 1.0]
    pub velocity: f32,
    /// Note duration in milliseconds, in [100, 3000]
    pub duration: u64,
    /// Sender's epoch-millis clock at play time
    pub timestamp: u64,
    /// Unique id of the sending session; distinguishes two tabs of the
    /// same user
    pub session_id: String,
}

impl InstrumentNoteEvent {
    /// Reject events that cannot be played safely. Out-of-range values
    /// are clamped, not rejected; only structural problems fail.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(Error::InvalidEvent("missing user id".to_string()));
        }
        if self.note.is_empty() || self.note.len() > 4 {
            return Err(Error::InvalidEvent(format!(
                "bad note name {:?}",
                self.note
            )));
        }
        if self.instrument.is_empty() {
            return Err(Error::InvalidEvent("missing instrument".to_string()));
        }
        if !self.velocity.is_finite() {
            return Err(Error::InvalidEvent("non-finite velocity".to_string()));
        }
        Ok(())
    }

    /// Velocity clamped to its legal range.
    pub fn clamped_velocity(&self) -> f32 {
        self.velocity.clamp(VELOCITY_RANGE.0, VELOCITY_RANGE.1)
    }

    /// Duration clamped to its legal range.
    pub fn clamped_duration(&self) -> u64 {
        self.duration.clamp(DURATION_RANGE_MS.0, DURATION_RANGE_MS.1)
    }
}

/// Fan-out transport for note events.
///
/// Delivery may include the sender's own events and duplicates; the
/// coordinator is responsible for filtering both.
#[async_trait]
pub trait NoteBus: Send + Sync {
    async fn broadcast(&self, event: InstrumentNoteEvent) -> Result<()>;
    async fn subscribe(&self) -> Result<broadcast::Receiver<InstrumentNoteEvent>>;
}

/// In-process bus for tests and single-process rooms.
pub struct MemoryNoteBus {
    tx: broadcast::Sender<InstrumentNoteEvent>,
}

impl Default for MemoryNoteBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNoteBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }
}

#[async_trait]
impl NoteBus for MemoryNoteBus {
    async fn broadcast(&self, event: InstrumentNoteEvent) -> Result<()> {
        // A send with no subscribers is fine; nobody has joined yet
        let _ = self.tx.send(event);
        Ok(())
    }

    async fn subscribe(&self) -> Result<broadcast::Receiver<InstrumentNoteEvent>> {
        Ok(self.tx.subscribe())
    }
}

struct DedupState {
    entries: HashMap<String, u64>,
}

impl DedupState {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Record both dedup keys for an event; returns false when either
    /// was already seen inside the window.
    fn check_and_record(&mut self, event: &InstrumentNoteEvent, now: u64, window_ms: u64) -> bool {
        let session_key = format!("{}:{}:{}", event.user_id, event.note, event.session_id);
        let bucket_key = format!(
            "{}:{}:{}",
            event.user_id,
            event.note,
            event.timestamp / DEDUP_BUCKET_MS
        );

        let fresh = |seen: Option<&u64>| match seen {
            Some(&ts) => now.saturating_sub(ts) >= window_ms,
            None => true,
        };

        let new_event =
            fresh(self.entries.get(&session_key)) && fresh(self.entries.get(&bucket_key));

        if new_event {
            self.entries.insert(session_key, now);
            self.entries.insert(bucket_key, now);

            if self.entries.len() > DEDUP_CLEANUP_THRESHOLD {
                self.entries
                    .retain(|_, ts| now.saturating_sub(*ts) < window_ms);
            }
        }

        new_event
    }
}

/// Publishes local notes and plays remote ones, suppressing echoes.
pub struct NoteBroadcastCoordinator {
    user_id: String,
    session_id: String,
    window_ms: u64,
    bus: Arc<dyn NoteBus>,
    synth: Arc<NoteSynthesizer>,
    dedup: Arc<Mutex<DedupState>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl NoteBroadcastCoordinator {
    pub fn new(
        user_id: impl Into<String>,
        bus: Arc<dyn NoteBus>,
        synth: Arc<NoteSynthesizer>,
        window_ms: u64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: uuid::Uuid::new_v4().to_string(),
            window_ms,
            bus,
            synth,
            dedup: Arc::new(Mutex::new(DedupState::new())),
            listener: Mutex::new(None),
        }
    }

    /// Id distinguishing this session from another tab of the same user.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Publish a locally played note.
    ///
    /// The event is recorded in the dedup window before sending, so a
    /// looped-back copy can never retrigger the local synthesizer.
    pub async fn broadcast(
        &self,
        note: &str,
        instrument: &str,
        velocity: f32,
        duration_ms: u64,
    ) -> Result<()> {
        let event = InstrumentNoteEvent {
            user_id: self.user_id.clone(),
            note: note.to_string(),
            instrument: instrument.to_string(),
            velocity: velocity.clamp(VELOCITY_RANGE.0, VELOCITY_RANGE.1),
            duration: duration_ms.clamp(DURATION_RANGE_MS.0, DURATION_RANGE_MS.1),
            timestamp: epoch_millis(),
            session_id: self.session_id.clone(),
        };
        event.validate()?;

        self.dedup
            .lock()
            .check_and_record(&event, event.timestamp, self.window_ms);

        debug!(note, instrument, "Broadcasting note");
        self.bus.broadcast(event).await
    }

    /// Handle one event from the bus. Own events and duplicates are
    /// dropped silently; malformed events are dropped with a warning.
    pub fn on_remote_event(&self, event: InstrumentNoteEvent) {
        // The local player already hears themselves; that covers other
        // tabs of the same user too, not just this session
        if event.user_id == self.user_id {
            return;
        }

        if let Err(e) = event.validate() {
            warn!(error = %e, "Dropping malformed note event");
            return;
        }

        let now = epoch_millis();
        if !self
            .dedup
            .lock()
            .check_and_record(&event, now, self.window_ms)
        {
            debug!(user_id = %event.user_id, note = %event.note, "Suppressed duplicate note");
            return;
        }

        // One voice per event, so two players holding the same note
        // never steal each other's oscillator
        let voice_id = format!(
            "{}:{}:{}",
            event.user_id,
            event.note,
            uuid::Uuid::new_v4()
        );
        if let Err(e) = self.synth.play(
            &voice_id,
            &event.note,
            &event.instrument,
            event.clamped_velocity(),
            event.clamped_duration(),
        ) {
            // NotReady just means the local engine is still suspended
            debug!(error = %e, "Remote note not played");
        }
    }

    /// Subscribe to the bus and feed events through `on_remote_event`
    /// until disposed.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let mut rx = self.bus.subscribe().await?;
        let coordinator = Arc::clone(self);

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => coordinator.on_remote_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Note bus receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut listener = self.listener.lock();
        if let Some(previous) = listener.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Stop listening. Idempotent.
    pub fn dispose(&self) {
        if let Some(task) = self.listener.lock().take() {
            task.abort();
        }
    }
}

impl Drop for NoteBroadcastCoordinator {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioEngine;
    use crate::synth::NoteSink;
    use std::time::Duration;

    struct NullSink;
    impl NoteSink for NullSink {
        fn write(&self, _block: &[f32]) {}
    }

    fn coordinator(user: &str, bus: Arc<dyn NoteBus>) -> Arc<NoteBroadcastCoordinator> {
        let engine = Arc::new(AudioEngine::new(48000));
        engine.resume().unwrap();
        let synth = Arc::new(NoteSynthesizer::new(engine, Arc::new(NullSink)));
        Arc::new(NoteBroadcastCoordinator::new(user, bus, synth, 300))
    }

    fn event(user: &str, session: &str, note: &str, timestamp: u64) -> InstrumentNoteEvent {
        InstrumentNoteEvent {
            user_id: user.to_string(),
            note: note.to_string(),
            instrument: "piano".to_string(),
            velocity: 0.8,
            duration: 500,
            timestamp,
            session_id: session.to_string(),
        }
    }

    #[test]
    fn test_event_wire_format_is_camel_case() {
        let e = event("alice", "s-1", "C4", 1000);
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"userId\""));
        assert!(json.contains("\"sessionId\""));
        assert!(!json.contains("\"user_id\""));
    }

    #[test]
    fn test_validate_rejects_structural_problems() {
        assert!(event("alice", "s", "C4", 0).validate().is_ok());
        assert!(event("", "s", "C4", 0).validate().is_err());
        assert!(event("alice", "s", "", 0).validate().is_err());
        assert!(event("alice", "s", "C4-extra", 0).validate().is_err());

        let mut e = event("alice", "s", "C4", 0);
        e.velocity = f32::NAN;
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_clamping() {
        let mut e = event("alice", "s", "C4", 0);
        e.velocity = 7.0;
        e.duration = 60_000;
        assert_eq!(e.clamped_velocity(), 1.0);
        assert_eq!(e.clamped_duration(), 3000);

        e.velocity = 0.0;
        e.duration = 1;
        assert_eq!(e.clamped_velocity(), 0.1);
        assert_eq!(e.clamped_duration(), 100);
    }

    #[test]
    fn test_dedup_same_session_key() {
        let mut dedup = DedupState::new();
        let e = event("alice", "s-1", "C4", 1000);

        assert!(dedup.check_and_record(&e, 1000, 300));
        assert!(!dedup.check_and_record(&e, 1100, 300));
        // Window elapsed
        assert!(dedup.check_and_record(&e, 1400, 300));
    }

    #[test]
    fn test_dedup_bucket_key_catches_cross_session_copies() {
        let mut dedup = DedupState::new();
        // Same user and note relayed via two different sessions in the
        // same 200 ms bucket
        let a = event("alice", "s-1", "C4", 1000);
        let b = event("alice", "s-2", "C4", 1050);

        assert!(dedup.check_and_record(&a, 1000, 300));
        assert!(!dedup.check_and_record(&b, 1060, 300));
    }

    #[test]
    fn test_dedup_distinct_notes_pass() {
        let mut dedup = DedupState::new();
        assert!(dedup.check_and_record(&event("alice", "s", "C4", 1000), 1000, 300));
        assert!(dedup.check_and_record(&event("alice", "s", "E4", 1000), 1000, 300));
        assert!(dedup.check_and_record(&event("bob", "t", "C4", 1000), 1000, 300));
    }

    #[test]
    fn test_dedup_map_sweeps_expired_entries() {
        let mut dedup = DedupState::new();
        for i in 0..60 {
            let e = event("alice", "s", &format!("N{}", i), 1000);
            dedup.check_and_record(&e, 1000, 300);
        }
        assert!(dedup.entries.len() > DEDUP_CLEANUP_THRESHOLD);

        // Next insert past the window triggers the sweep
        dedup.check_and_record(&event("bob", "t", "C4", 2000), 2000, 300);
        assert!(dedup.entries.len() <= 3);
    }

    #[tokio::test]
    async fn test_own_events_do_not_echo() {
        let bus: Arc<dyn NoteBus> = Arc::new(MemoryNoteBus::new());
        let alice = coordinator("alice", bus.clone());
        alice.run().await.unwrap();

        alice.broadcast("C4", "piano", 0.8, 500).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The looped-back event was filtered before reaching the synth
        assert!(alice.synth.active_voices().is_empty());
        alice.dispose();
    }

    #[tokio::test]
    async fn test_own_user_from_another_session_does_not_echo() {
        let bus: Arc<dyn NoteBus> = Arc::new(MemoryNoteBus::new());
        let alice = coordinator("alice", bus.clone());
        alice.run().await.unwrap();

        // Same user playing in a second tab; still their own sound
        bus.broadcast(event("alice", "other-tab", "C4", epoch_millis()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(alice.synth.active_voices().is_empty());
        alice.dispose();
    }

    #[tokio::test]
    async fn test_remote_event_plays_once() {
        let bus: Arc<dyn NoteBus> = Arc::new(MemoryNoteBus::new());
        let alice = coordinator("alice", bus.clone());
        let bob = coordinator("bob", bus.clone());
        bob.run().await.unwrap();

        alice.broadcast("G4", "guitar", 0.7, 3000).await.unwrap();
        // Duplicate delivery of the same event
        bus.broadcast(event("alice", alice.session_id(), "G4", epoch_millis()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(bob.synth.active_voices().len(), 1);

        bob.dispose();
        alice.dispose();
    }

    #[tokio::test]
    async fn test_malformed_event_is_dropped() {
        let bus: Arc<dyn NoteBus> = Arc::new(MemoryNoteBus::new());
        let bob = coordinator("bob", bus.clone());
        bob.run().await.unwrap();

        let mut bad = event("alice", "s-1", "C4", epoch_millis());
        bad.note = String::new();
        bus.broadcast(bad).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(bob.synth.active_voices().is_empty());
        bob.dispose();
    }
}
