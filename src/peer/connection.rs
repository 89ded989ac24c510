//! Single peer connection wrapper
//!
//! Wraps one `RTCPeerConnection` with the negotiation surface the
//! manager needs: offer/answer creation, queue-then-flush ICE handling,
//! the shared outbound track attachment, and inbound audio metering.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::audio::LevelMeter;
use crate::config::RoomRtcConfig;
use crate::media::{AudioCodecConfig, AudioDecoder};
use crate::{Error, Result};

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, negotiation not finished
    New,
    /// ICE running
    Connecting,
    /// Media flowing
    Connected,
    /// ICE failed or dropped; the manager schedules a reconnect
    Failed,
    /// Closed locally or by the remote
    Closed,
}

/// Remote candidates arriving before the remote description are queued
/// and flushed once it lands.
#[derive(Default)]
struct CandidateQueue {
    remote_set: bool,
    queued: Vec<RTCIceCandidateInit>,
}

/// One connection to one remote peer.
pub struct PeerConnection {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    state_tx: watch::Sender<ConnectionState>,
    candidates: Arc<Mutex<CandidateQueue>>,
    level: Arc<LevelMeter>,
    muted: Arc<AtomicBool>,
}

impl PeerConnection {
    /// Build a connection against the configured STUN servers.
    pub async fn new(peer_id: impl Into<String>, config: &RoomRtcConfig) -> Result<Self> {
        let peer_id = peer_id.into();

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::PeerConnection(format!("failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::PeerConnection(format!("failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::PeerConnection(format!("failed to create connection: {}", e)))?,
        );

        let (state_tx, _) = watch::channel(ConnectionState::New);

        // Reconnection is driven by the ICE connection state: a
        // transient drop surfaces as Disconnected there long before the
        // transport-level state gives up.
        let state_for_ice = state_tx.clone();
        let peer_for_ice = peer_id.clone();
        pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
            let state_tx = state_for_ice.clone();
            let peer_id = peer_for_ice.clone();
            Box::pin(async move {
                let mapped = match s {
                    RTCIceConnectionState::Checking => ConnectionState::Connecting,
                    RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                        ConnectionState::Connected
                    }
                    RTCIceConnectionState::Failed | RTCIceConnectionState::Disconnected => {
                        ConnectionState::Failed
                    }
                    RTCIceConnectionState::Closed => ConnectionState::Closed,
                    _ => return,
                };
                debug!(peer_id = %peer_id, ice_state = ?s, state = ?mapped, "ICE state change");
                let _ = state_tx.send(mapped);
            })
        }));

        let state_for_handler = state_tx.clone();
        let peer_for_handler = peer_id.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state_tx = state_for_handler.clone();
            let peer_id = peer_for_handler.clone();
            Box::pin(async move {
                debug!(peer_id = %peer_id, state = ?s, "Transport state change");
                if s == RTCPeerConnectionState::Closed {
                    let _ = state_tx.send(ConnectionState::Closed);
                }
            })
        }));

        let level = LevelMeter::new();
        let muted = Arc::new(AtomicBool::new(false));

        let level_for_track = Arc::clone(&level);
        let peer_for_track = peer_id.clone();
        let sample_rate = config.sample_rate;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let level = Arc::clone(&level_for_track);
                let peer_id = peer_for_track.clone();
                Box::pin(async move {
                    info!(peer_id = %peer_id, kind = %track.kind(), "Remote track started");
                    tokio::spawn(read_remote_audio(track, level, peer_id, sample_rate));
                })
            },
        ));

        Ok(Self {
            peer_id,
            pc,
            state_tx,
            candidates: Arc::new(Mutex::new(CandidateQueue::default())),
            level,
            muted,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch channel for state transitions; the manager's per-peer
    /// watcher task drives timeouts and reconnects from this.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Where negotiation stands; `HaveLocalOffer` means our offer is
    /// still waiting for the remote answer.
    pub fn signaling_state(&self) -> RTCSignalingState {
        self.pc.signaling_state()
    }

    /// Latest inbound audio level in [0, 1].
    pub fn audio_level(&self) -> f32 {
        self.level.level()
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Register the local-candidate handler; each gathered candidate is
    /// handed over in wire-ready form.
    pub fn on_local_candidate<F>(&self, handler: F)
    where
        F: Fn(RTCIceCandidateInit) + Send + Sync + 'static,
    {
        let peer_id = self.peer_id.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let peer_id = peer_id.clone();
                let Some(candidate) = candidate else {
                    // End-of-candidates marker
                    return Box::pin(async {});
                };
                match candidate.to_json() {
                    Ok(init) => handler(init),
                    Err(e) => {
                        warn!(peer_id = %peer_id, error = %e, "Failed to serialize candidate")
                    }
                }
                Box::pin(async {})
            }));
    }

    /// Attach the shared outbound audio track.
    pub async fn add_local_audio(&self, track: Arc<TrackLocalStaticSample>) -> Result<()> {
        self.pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::MediaTrack(format!("failed to add audio track: {}", e)))?;
        debug!(peer_id = %self.peer_id, "Local audio attached");
        Ok(())
    }

    /// Create and install the local offer, returning its SDP.
    pub async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::Sdp(format!("failed to create offer: {}", e)))?;

        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::Sdp(format!("failed to set local description: {}", e)))?;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Sdp("no local description after offer".to_string()))?;

        debug!(peer_id = %self.peer_id, "Created offer");
        Ok(local.sdp)
    }

    /// Apply a remote offer and produce the local answer SDP.
    pub async fn create_answer(&self, offer_sdp: String) -> Result<String> {
        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| Error::Sdp(format!("failed to parse offer: {}", e)))?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::Sdp(format!("failed to set remote description: {}", e)))?;
        self.flush_candidates().await?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::Sdp(format!("failed to create answer: {}", e)))?;

        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::Sdp(format!("failed to set local description: {}", e)))?;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Sdp("no local description after answer".to_string()))?;

        debug!(peer_id = %self.peer_id, "Created answer");
        Ok(local.sdp)
    }

    /// Apply the remote answer to a connection we offered on.
    pub async fn set_remote_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| Error::Sdp(format!("failed to parse answer: {}", e)))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::Sdp(format!("failed to set remote description: {}", e)))?;

        self.flush_candidates().await
    }

    /// Add a remote candidate, queuing it if the remote description has
    /// not landed yet.
    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        {
            let mut queue = self.candidates.lock().await;
            if !queue.remote_set {
                queue.queued.push(candidate);
                debug!(peer_id = %self.peer_id, queued = queue.queued.len(), "Candidate queued");
                return Ok(());
            }
        }

        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| Error::IceCandidate(format!("failed to add candidate: {}", e)))
    }

    async fn flush_candidates(&self) -> Result<()> {
        let queued = {
            let mut queue = self.candidates.lock().await;
            queue.remote_set = true;
            std::mem::take(&mut queue.queued)
        };

        if !queued.is_empty() {
            debug!(peer_id = %self.peer_id, count = queued.len(), "Flushing queued candidates");
        }
        for candidate in queued {
            self.pc
                .add_ice_candidate(candidate)
                .await
                .map_err(|e| Error::IceCandidate(format!("failed to add candidate: {}", e)))?;
        }
        Ok(())
    }

    /// Close the underlying connection.
    pub async fn close(&self) -> Result<()> {
        let _ = self.state_tx.send(ConnectionState::Closed);
        self.pc
            .close()
            .await
            .map_err(|e| Error::PeerConnection(format!("failed to close connection: {}", e)))
    }
}

/// Per-track reader: decode inbound Opus and feed the level meter.
async fn read_remote_audio(
    track: Arc<TrackRemote>,
    level: Arc<LevelMeter>,
    peer_id: String,
    sample_rate: u32,
) {
    let mut decoder = match AudioDecoder::new(AudioCodecConfig {
        sample_rate,
        ..Default::default()
    }) {
        Ok(d) => d,
        Err(e) => {
            warn!(peer_id = %peer_id, error = %e, "Failed to create inbound decoder");
            return;
        }
    };

    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                if packet.payload.is_empty() {
                    continue;
                }
                match decoder.decode(&packet.payload) {
                    Ok(samples) => level.update(&samples),
                    Err(e) => debug!(peer_id = %peer_id, error = %e, "Undecodable packet"),
                }
            }
            Err(e) => {
                debug!(peer_id = %peer_id, error = %e, "Remote track ended");
                level.clear();
                break;
            }
        }
    }
}
