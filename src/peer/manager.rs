//! Mesh connection manager
//!
//! Owns one [`PeerConnection`] per remote participant, drives
//! negotiation through the signaling channel, and recovers failed
//! connections with capped exponential backoff. Timers attached to a
//! peer are always cancelled before its state is cleared.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::connection::{ConnectionState, PeerConnection};
use super::reconnect::ReconnectPolicy;
use crate::audio::{AudioEngine, AudioPipeline};
use crate::config::{AudioProcessorConfig, RoomRtcConfig};
use crate::media::{create_audio_track, write_frame, AudioCodecConfig, AudioEncoder};
use crate::signaling::{IncomingSignal, SignalKind, SignalingChannel};
use crate::{Error, Result};

/// Status snapshot for one peer
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub peer_id: String,
    pub state: ConnectionState,
    /// Inbound audio level in [0, 1]
    pub audio_level: f32,
    pub muted: bool,
    pub reconnect_attempts: u32,
}

struct PeerEntry {
    connection: Arc<PeerConnection>,
    attempts: u32,
    terminal_failed: bool,
    timeout_task: Option<JoinHandle<()>>,
    watcher_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
}

impl PeerEntry {
    /// Cancel every timer before anything else touches the entry.
    fn cancel_tasks(&mut self) {
        for task in [
            self.timeout_task.take(),
            self.watcher_task.take(),
            self.reconnect_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

struct Outbound {
    track: Arc<TrackLocalStaticSample>,
    encoder: parking_lot::Mutex<AudioEncoder>,
}

/// Manages the full mesh for one local participant.
pub struct PeerConnectionManager {
    local_id: String,
    config: RoomRtcConfig,
    policy: ReconnectPolicy,
    signaling: Arc<SignalingChannel>,
    engine: Arc<AudioEngine>,
    pipeline: Arc<AudioPipeline>,
    peers: RwLock<HashMap<String, PeerEntry>>,
    outbound: RwLock<Option<Outbound>>,
    disposed: AtomicBool,
}

impl PeerConnectionManager {
    pub fn new(
        local_id: impl Into<String>,
        signaling: Arc<SignalingChannel>,
        engine: Arc<AudioEngine>,
        config: RoomRtcConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let policy = ReconnectPolicy::from_config(&config);
        let pipeline = Arc::new(AudioPipeline::new(config.sample_rate));

        Ok(Arc::new(Self {
            local_id: local_id.into(),
            config,
            policy,
            signaling,
            engine,
            pipeline,
            peers: RwLock::new(HashMap::new()),
            outbound: RwLock::new(None),
            disposed: AtomicBool::new(false),
        }))
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// The outgoing processing chain; reconfigure it through
    /// [`AudioPipeline::update_config`].
    pub fn pipeline(&self) -> &Arc<AudioPipeline> {
        &self.pipeline
    }

    /// Wire inbound signals into negotiation and start listening.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(self);
        self.signaling
            .listen(move |signal| {
                let weak = weak.clone();
                async move {
                    let Some(manager) = weak.upgrade() else {
                        return;
                    };
                    let from = signal.from_id().to_string();
                    let result = match signal {
                        IncomingSignal::Offer { from, sdp } => {
                            manager.handle_offer(&from, sdp).await
                        }
                        IncomingSignal::Answer { from, sdp } => {
                            manager.handle_answer(&from, sdp).await
                        }
                        IncomingSignal::Candidate { from, candidate } => {
                            manager.handle_ice_candidate(&from, candidate).await
                        }
                    };
                    if let Err(e) = result {
                        warn!(from = %from, error = %e, "Signal handling failed");
                    }
                }
            })
            .await
    }

    /// Begin sharing local audio.
    ///
    /// Builds the processing chain and the shared outbound track, then
    /// renegotiates with every already-connected peer so the new track
    /// reaches them.
    pub async fn start_sharing(
        self: &Arc<Self>,
        processor_config: AudioProcessorConfig,
    ) -> Result<()> {
        self.engine.ensure_resumed()?;

        if self.outbound.read().await.is_some() {
            return Ok(());
        }

        self.pipeline.initialize(processor_config)?;

        let codec = AudioCodecConfig {
            sample_rate: self.config.sample_rate,
            ..Default::default()
        };
        let encoder = AudioEncoder::new(codec).map_err(|e| {
            Error::MediaAcquisition(format!("outbound encoder unavailable: {}", e))
        })?;
        let track = create_audio_track(&format!("audio-{}", self.local_id), &codec);

        *self.outbound.write().await = Some(Outbound {
            track: Arc::clone(&track),
            encoder: parking_lot::Mutex::new(encoder),
        });

        // Attach to live peers and re-offer
        let existing: Vec<(String, Arc<PeerConnection>)> = {
            let peers = self.peers.read().await;
            peers
                .iter()
                .filter(|(_, e)| !e.terminal_failed)
                .map(|(id, e)| (id.clone(), Arc::clone(&e.connection)))
                .collect()
        };

        for (peer_id, connection) in existing {
            if let Err(e) = self.renegotiate(&peer_id, &connection, &track).await {
                warn!(peer_id = %peer_id, error = %e, "Renegotiation failed");
            }
        }

        info!("Audio sharing started");
        Ok(())
    }

    async fn renegotiate(
        &self,
        peer_id: &str,
        connection: &Arc<PeerConnection>,
        track: &Arc<TrackLocalStaticSample>,
    ) -> Result<()> {
        connection.add_local_audio(Arc::clone(track)).await?;
        let sdp = connection
            .create_offer()
            .await
            .map_err(|e| Error::Negotiation(format!("re-offer to {} failed: {}", peer_id, e)))?;
        self.signaling
            .send(SignalKind::Offer, serde_json::Value::String(sdp), peer_id)
            .await
    }

    /// Run one captured block through the pipeline, encode it, and
    /// write it to the shared track.
    pub async fn push_audio(&self, samples: &mut [f32]) -> Result<()> {
        self.pipeline.process(samples);

        let outbound = self.outbound.read().await;
        let Some(outbound) = outbound.as_ref() else {
            return Err(Error::Internal("audio sharing not started".to_string()));
        };

        let packet = outbound.encoder.lock().encode(samples)?;
        write_frame(&outbound.track, packet).await
    }

    /// Stop sharing local audio. Connections stay up; only the track
    /// source and processing chain are torn down. Idempotent.
    pub async fn stop_sharing(&self) {
        if self.outbound.write().await.take().is_some() {
            self.pipeline.dispose();
            info!("Audio sharing stopped");
        }
    }

    /// Initiate a connection to one peer.
    ///
    /// A no-op when the peer is already tracked (repeated roster updates
    /// cannot create duplicates) or when local sharing has not started;
    /// there is nothing to offer without an outbound track. Inbound
    /// offers are still answered either way, so a listen-only session
    /// hears everyone.
    pub async fn connect_to_peer(self: &Arc<Self>, peer_id: &str) -> Result<()> {
        if peer_id == self.local_id {
            return Ok(());
        }
        if self.outbound.read().await.is_none() {
            debug!(peer_id = %peer_id, "Not sharing audio; outbound dial skipped");
            return Ok(());
        }
        {
            let peers = self.peers.read().await;
            if peers.contains_key(peer_id) {
                return Ok(());
            }
            if peers.len() >= self.config.max_peers as usize {
                return Err(Error::PeerConnection(format!(
                    "mesh is full ({} peers)",
                    peers.len()
                )));
            }
        }

        self.establish(peer_id, 0).await
    }

    /// Build an initiator connection, attach media, offer, and monitor.
    ///
    /// Boxed because the reconnect path re-enters it from tasks spawned
    /// inside [`Self::install`].
    fn establish<'a>(
        self: &'a Arc<Self>,
        peer_id: &'a str,
        attempts: u32,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.disposed.load(Ordering::SeqCst) {
                return Ok(());
            }

            let connection = Arc::new(PeerConnection::new(peer_id, &self.config).await?);
            self.wire_candidates(peer_id, &connection);

            if let Some(outbound) = self.outbound.read().await.as_ref() {
                connection
                    .add_local_audio(Arc::clone(&outbound.track))
                    .await?;
            }

            let sdp = connection.create_offer().await.map_err(|e| {
                Error::Negotiation(format!("offer to {} failed: {}", peer_id, e))
            })?;
            self.signaling
                .send(SignalKind::Offer, serde_json::Value::String(sdp), peer_id)
                .await?;

            self.install(peer_id, connection, attempts).await;
            info!(peer_id = %peer_id, attempts, "Connecting to peer");
            Ok(())
        })
    }

    /// Answer an inbound offer.
    ///
    /// A live connection to that peer handles this as renegotiation on
    /// the same transport. When the offer crosses one of our own still
    /// unanswered offers, the lexicographically greater id's offer wins
    /// and the lesser side rebuilds as responder. A failed or closed
    /// connection is always replaced (the remote restarted from
    /// scratch).
    pub async fn handle_offer(self: &Arc<Self>, from: &str, sdp: String) -> Result<()> {
        let live = {
            let peers = self.peers.read().await;
            peers.get(from).and_then(|e| {
                let state = e.connection.state();
                if !e.terminal_failed
                    && state != ConnectionState::Failed
                    && state != ConnectionState::Closed
                {
                    Some(Arc::clone(&e.connection))
                } else {
                    None
                }
            })
        };

        if let Some(connection) = live {
            match connection.signaling_state() {
                RTCSignalingState::HaveLocalOffer if self.local_id.as_str() > from => {
                    // Glare: our own offer is still in flight and our id
                    // wins, so the remote rolls back and answers it
                    debug!(peer_id = %from, "Crossing offer ignored; ours wins");
                    return Ok(());
                }
                RTCSignalingState::HaveLocalOffer => {
                    debug!(peer_id = %from, "Crossing offer wins; rebuilding as responder");
                }
                _ => {
                    let answer = connection.create_answer(sdp).await.map_err(|e| {
                        Error::Negotiation(format!("answer to {} failed: {}", from, e))
                    })?;
                    self.signaling
                        .send(SignalKind::Answer, serde_json::Value::String(answer), from)
                        .await?;
                    debug!(peer_id = %from, "Renegotiated on existing connection");
                    return Ok(());
                }
            }
        }

        let previous_attempts = self.remove_peer_internal(from).await;

        let connection = Arc::new(PeerConnection::new(from, &self.config).await?);
        self.wire_candidates(from, &connection);

        if let Some(outbound) = self.outbound.read().await.as_ref() {
            connection
                .add_local_audio(Arc::clone(&outbound.track))
                .await?;
        }

        let answer = connection
            .create_answer(sdp)
            .await
            .map_err(|e| Error::Negotiation(format!("answer to {} failed: {}", from, e)))?;
        self.signaling
            .send(
                SignalKind::Answer,
                serde_json::Value::String(answer),
                from,
            )
            .await?;

        self.install(from, connection, previous_attempts.unwrap_or(0))
            .await;
        info!(peer_id = %from, "Answered offer");
        Ok(())
    }

    /// Apply a remote answer to a connection we offered on.
    pub async fn handle_answer(&self, from: &str, sdp: String) -> Result<()> {
        let connection = {
            let peers = self.peers.read().await;
            peers
                .get(from)
                .map(|e| Arc::clone(&e.connection))
                .ok_or_else(|| Error::PeerNotFound(from.to_string()))?
        };
        connection
            .set_remote_answer(sdp)
            .await
            .map_err(|e| Error::Negotiation(format!("answer from {} rejected: {}", from, e)))
    }

    /// Route a remote candidate to its connection; unknown peers are
    /// dropped with a warning (their offer may have been torn down).
    pub async fn handle_ice_candidate(
        &self,
        from: &str,
        candidate: RTCIceCandidateInit,
    ) -> Result<()> {
        let connection = {
            let peers = self.peers.read().await;
            match peers.get(from) {
                Some(e) => Arc::clone(&e.connection),
                None => {
                    warn!(from, "Candidate for unknown peer dropped");
                    return Ok(());
                }
            }
        };
        connection.add_ice_candidate(candidate).await
    }

    /// Reconcile the mesh against a room roster.
    ///
    /// Departed peers are torn down. Every new peer is dialed while
    /// sharing is active; when two fresh participants dial each other at
    /// once, the crossing offers are resolved in
    /// [`Self::handle_offer`].
    pub async fn update_participants(self: &Arc<Self>, participants: &[String]) -> Result<()> {
        let current: Vec<String> = self.peers.read().await.keys().cloned().collect();

        for peer_id in &current {
            if !participants.contains(peer_id) {
                debug!(peer_id = %peer_id, "Participant left");
                self.remove_peer(peer_id).await;
            }
        }

        for peer_id in participants {
            if peer_id == &self.local_id {
                continue;
            }
            if let Err(e) = self.connect_to_peer(peer_id).await {
                warn!(peer_id = %peer_id, error = %e, "Failed to connect to participant");
            }
        }

        Ok(())
    }

    fn wire_candidates(self: &Arc<Self>, peer_id: &str, connection: &Arc<PeerConnection>) {
        let signaling = Arc::clone(&self.signaling);
        let peer_id = peer_id.to_string();
        connection.on_local_candidate(move |init| {
            let signaling = Arc::clone(&signaling);
            let peer_id = peer_id.clone();
            tokio::spawn(async move {
                let payload = match serde_json::to_value(&init) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(peer_id = %peer_id, error = %e, "Candidate serialization failed");
                        return;
                    }
                };
                if let Err(e) = signaling
                    .send(SignalKind::IceCandidate, payload, &peer_id)
                    .await
                {
                    warn!(peer_id = %peer_id, error = %e, "Candidate delivery failed");
                }
            });
        });
    }

    /// Register the entry and spawn its establishment-timeout and
    /// state-watcher tasks.
    async fn install(self: &Arc<Self>, peer_id: &str, connection: Arc<PeerConnection>, attempts: u32) {
        let weak = Arc::downgrade(self);
        let timeout_peer = peer_id.to_string();
        let timeout = Duration::from_secs(self.config.ice_timeout_secs);
        let timeout_conn = Arc::clone(&connection);
        let timeout_task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if timeout_conn.state() != ConnectionState::Connected {
                warn!(peer_id = %timeout_peer, "Connection establishment timed out");
                if let Some(manager) = weak.upgrade() {
                    manager.on_peer_failed(&timeout_peer).await;
                }
            }
        });

        let weak = Arc::downgrade(self);
        let watcher_peer = peer_id.to_string();
        let mut state_rx = connection.subscribe_state();
        let watcher_task = tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow();
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                match state {
                    ConnectionState::Connected => manager.on_peer_connected(&watcher_peer).await,
                    ConnectionState::Failed => manager.on_peer_failed(&watcher_peer).await,
                    ConnectionState::Closed => break,
                    _ => {}
                }
            }
        });

        let mut peers = self.peers.write().await;
        if self.disposed.load(Ordering::SeqCst) {
            timeout_task.abort();
            watcher_task.abort();
            tokio::spawn(async move {
                let _ = connection.close().await;
            });
            return;
        }
        if let Some(mut stale) = peers.insert(
            peer_id.to_string(),
            PeerEntry {
                connection,
                attempts,
                terminal_failed: false,
                timeout_task: Some(timeout_task),
                watcher_task: Some(watcher_task),
                reconnect_task: None,
            },
        ) {
            stale.cancel_tasks();
            let conn = stale.connection;
            tokio::spawn(async move {
                let _ = conn.close().await;
            });
        }
    }

    async fn on_peer_connected(&self, peer_id: &str) {
        let mut peers = self.peers.write().await;
        if let Some(entry) = peers.get_mut(peer_id) {
            if let Some(timeout) = entry.timeout_task.take() {
                timeout.abort();
            }
            // An ICE drop that recovered on its own cancels the redial
            if let Some(reconnect) = entry.reconnect_task.take() {
                reconnect.abort();
            }
            entry.attempts = 0;
            info!(peer_id = %peer_id, "Peer connected");
        }
    }

    /// Shared failure path for ICE failure and establishment timeout.
    async fn on_peer_failed(self: &Arc<Self>, peer_id: &str) {
        let mut peers = self.peers.write().await;
        let Some(entry) = peers.get_mut(peer_id) else {
            return;
        };
        if entry.terminal_failed || entry.reconnect_task.is_some() {
            return;
        }

        let attempts = entry.attempts;
        if !self.policy.should_retry(attempts) {
            error!(peer_id = %peer_id, attempts, "Reconnect budget exhausted");
            entry.cancel_tasks();
            entry.terminal_failed = true;
            let conn = Arc::clone(&entry.connection);
            tokio::spawn(async move {
                let _ = conn.close().await;
            });
            return;
        }

        let delay = self.policy.calculate_backoff(attempts);
        entry.attempts = attempts + 1;
        warn!(peer_id = %peer_id, attempt = attempts + 1, delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect");

        let weak = Arc::downgrade(self);
        let peer = peer_id.to_string();
        entry.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = weak.upgrade() else {
                return;
            };
            manager.reconnect(&peer).await;
        }));
    }

    /// Tear down the failed connection and dial again, carrying the
    /// attempt count forward.
    ///
    /// Runs inside the entry's own reconnect task, so that handle is
    /// dropped here rather than aborted; aborting it would cancel this
    /// very call mid-teardown.
    async fn reconnect(self: &Arc<Self>, peer_id: &str) {
        let attempts = {
            let mut peers = self.peers.write().await;
            let Some(mut entry) = peers.remove(peer_id) else {
                return;
            };
            drop(entry.reconnect_task.take());
            entry.cancel_tasks();
            let conn = Arc::clone(&entry.connection);
            tokio::spawn(async move {
                let _ = conn.close().await;
            });
            entry.attempts
        };

        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.establish(peer_id, attempts).await {
            warn!(peer_id = %peer_id, error = %e, "Reconnect attempt failed");
            self.spawn_redial(peer_id, attempts);
        }
    }

    /// Retry dialing until it succeeds or the budget runs out. A dial
    /// that fails before a connection exists still consumes budget.
    fn spawn_redial(self: &Arc<Self>, peer_id: &str, mut attempts: u32) {
        let weak = Arc::downgrade(self);
        let policy = self.policy.clone();
        let peer = peer_id.to_string();
        tokio::spawn(async move {
            loop {
                attempts += 1;
                if !policy.should_retry(attempts) {
                    error!(peer_id = %peer, attempts, "Reconnect budget exhausted");
                    return;
                }
                tokio::time::sleep(policy.calculate_backoff(attempts)).await;
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                if manager.disposed.load(Ordering::SeqCst) {
                    return;
                }
                match manager.establish(&peer, attempts).await {
                    Ok(()) => return,
                    Err(e) => warn!(peer_id = %peer, error = %e, "Reconnect attempt failed"),
                }
            }
        });
    }

    /// Remove a peer entirely, cancelling its timers first.
    pub async fn remove_peer(&self, peer_id: &str) {
        self.remove_peer_internal(peer_id).await;
    }

    /// Returns the removed entry's attempt count, if it existed.
    async fn remove_peer_internal(&self, peer_id: &str) -> Option<u32> {
        let mut entry = self.peers.write().await.remove(peer_id)?;
        entry.cancel_tasks();
        let attempts = entry.attempts;
        let _ = entry.connection.close().await;
        debug!(peer_id = %peer_id, "Peer removed");
        Some(attempts)
    }

    /// Mute or unmute one peer's inbound audio.
    pub async fn set_peer_muted(&self, peer_id: &str, muted: bool) -> Result<()> {
        let peers = self.peers.read().await;
        let entry = peers
            .get(peer_id)
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))?;
        entry.connection.set_muted(muted);
        Ok(())
    }

    /// Snapshot of every tracked peer.
    pub async fn peer_statuses(&self) -> Vec<PeerStatus> {
        let peers = self.peers.read().await;
        peers
            .iter()
            .map(|(peer_id, entry)| PeerStatus {
                peer_id: peer_id.clone(),
                state: if entry.terminal_failed {
                    ConnectionState::Failed
                } else {
                    entry.connection.state()
                },
                audio_level: entry.connection.audio_level(),
                muted: entry.connection.is_muted(),
                reconnect_attempts: entry.attempts,
            })
            .collect()
    }

    /// Number of tracked peers.
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Tear the whole mesh down. Idempotent.
    ///
    /// The disposed flag is raised first so that an in-flight reconnect
    /// past its backoff sleep cannot re-dial against the cleared map.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.signaling.cleanup();

        let entries: Vec<PeerEntry> = {
            let mut peers = self.peers.write().await;
            peers.drain().map(|(_, e)| e).collect()
        };
        for mut entry in entries {
            entry.cancel_tasks();
            let _ = entry.connection.close().await;
        }

        self.stop_sharing().await;
        info!("Peer manager disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::MemoryMailbox;

    fn manager_for(user: &str, mailbox: Arc<MemoryMailbox>) -> Arc<PeerConnectionManager> {
        let config = RoomRtcConfig::default();
        let signaling = Arc::new(SignalingChannel::new(
            "room-1",
            user,
            mailbox as Arc<dyn crate::signaling::MailboxStore>,
            &config,
        ));
        let engine = Arc::new(AudioEngine::new(48000));
        engine.resume().unwrap();
        PeerConnectionManager::new(user, signaling, engine, config).unwrap()
    }

    async fn share(manager: &Arc<PeerConnectionManager>) {
        manager
            .start_sharing(AudioProcessorConfig::default())
            .await
            .unwrap();
    }

    fn offers_to(mailbox: &MemoryMailbox, peer: &str) -> usize {
        mailbox
            .entries("room-1")
            .iter()
            .filter(|m| m.kind == SignalKind::Offer && m.to == peer)
            .count()
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let mailbox = Arc::new(MemoryMailbox::new());
        let manager = manager_for("alice", mailbox.clone());
        share(&manager).await;

        manager.connect_to_peer("bob").await.unwrap();
        manager.connect_to_peer("bob").await.unwrap();
        assert_eq!(manager.peer_count().await, 1);

        // Exactly one offer left the building
        assert_eq!(offers_to(&mailbox, "bob"), 1);

        manager.dispose().await;
    }

    #[tokio::test]
    async fn test_connect_to_self_is_noop() {
        let mailbox = Arc::new(MemoryMailbox::new());
        let manager = manager_for("alice", mailbox);
        share(&manager).await;

        manager.connect_to_peer("alice").await.unwrap();
        assert_eq!(manager.peer_count().await, 0);
        manager.dispose().await;
    }

    #[tokio::test]
    async fn test_connect_without_stream_is_noop() {
        let mailbox = Arc::new(MemoryMailbox::new());
        let manager = manager_for("alice", mailbox.clone());

        manager.connect_to_peer("bob").await.unwrap();
        assert_eq!(manager.peer_count().await, 0);
        assert!(mailbox.entries("room-1").is_empty());

        manager.dispose().await;
    }

    #[tokio::test]
    async fn test_fresh_roster_produces_one_offer() {
        let mailbox = Arc::new(MemoryMailbox::new());
        let manager = manager_for("alice", mailbox.clone());
        share(&manager).await;

        // "p1" sorts above "alice"; a sharing participant dials anyway
        manager
            .update_participants(&["p1".to_string()])
            .await
            .unwrap();

        assert_eq!(manager.peer_count().await, 1);
        assert_eq!(offers_to(&mailbox, "p1"), 1);

        manager.dispose().await;
    }

    #[tokio::test]
    async fn test_offer_answer_through_mailbox() {
        let mailbox = Arc::new(MemoryMailbox::new());
        let alice = manager_for("alice", mailbox.clone());
        let bob = manager_for("bob", mailbox.clone());

        alice.start().await.unwrap();
        bob.start().await.unwrap();
        share(&alice).await;

        alice.connect_to_peer("bob").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Bob answered the relayed offer without sharing anything himself
        assert_eq!(bob.peer_count().await, 1);
        let statuses = bob.peer_statuses().await;
        assert_eq!(statuses[0].peer_id, "alice");

        alice.dispose().await;
        bob.dispose().await;
    }

    #[tokio::test]
    async fn test_departed_participant_is_removed() {
        let mailbox = Arc::new(MemoryMailbox::new());
        let bob = manager_for("bob", mailbox);
        share(&bob).await;

        bob.update_participants(&["alice".to_string(), "bob".to_string()])
            .await
            .unwrap();
        assert_eq!(bob.peer_count().await, 1);

        bob.update_participants(&["bob".to_string()]).await.unwrap();
        assert_eq!(bob.peer_count().await, 0);

        bob.dispose().await;
    }

    #[tokio::test]
    async fn test_mute_unknown_peer_fails() {
        let mailbox = Arc::new(MemoryMailbox::new());
        let manager = manager_for("alice", mailbox);
        let result = manager.set_peer_muted("ghost", true).await;
        assert!(matches!(result, Err(Error::PeerNotFound(_))));
        manager.dispose().await;
    }

    #[tokio::test]
    async fn test_start_sharing_requires_resumed_engine() {
        let config = RoomRtcConfig::default();
        let mailbox = Arc::new(MemoryMailbox::new());
        let signaling = Arc::new(SignalingChannel::new(
            "room-1",
            "alice",
            mailbox as Arc<dyn crate::signaling::MailboxStore>,
            &config,
        ));
        let engine = Arc::new(AudioEngine::new(48000));
        let manager = PeerConnectionManager::new("alice", signaling, engine, config).unwrap();

        let result = manager.start_sharing(AudioProcessorConfig::default()).await;
        assert!(matches!(result, Err(Error::NotReady)));
        manager.dispose().await;
    }

    #[tokio::test]
    async fn test_push_audio_roundtrip() {
        let mailbox = Arc::new(MemoryMailbox::new());
        let manager = manager_for("alice", mailbox);
        manager
            .start_sharing(AudioProcessorConfig::default())
            .await
            .unwrap();

        let mut frame = vec![0.1_f32; 960];
        manager.push_audio(&mut frame).await.unwrap();

        manager.stop_sharing().await;
        let result = manager.push_audio(&mut frame).await;
        assert!(result.is_err());
        manager.dispose().await;
    }
}
