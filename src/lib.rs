//! Peer-to-peer audio collaboration core
//!
//! This crate provides the real-time audio layer for small jam rooms:
//! a full WebRTC mesh between participants, mailbox-based signaling,
//! an outgoing audio processing chain, an oscillator note synthesizer,
//! and echo-suppressed note broadcast.
//!
//! # Features
//!
//! - **Multi-peer mesh topology**: Up to 10 simultaneous peer connections
//! - **Mailbox signaling**: Offers, answers, and ICE candidates relayed
//!   through a room-scoped store with dedup and TTL sweeping
//! - **Automatic recovery**: Capped exponential-backoff reconnects
//! - **Audio processing**: Noise gate, compressor, band filters, and
//!   smoothed output gain, reconfigurable live
//! - **Note synthesis**: Per-instrument oscillator voices with ADSR
//!   envelopes and forced stop fades
//! - **Echo suppression**: Session- and time-keyed dedup on the shared
//!   note bus
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Remote participants (mesh peer connections)             │
//! │  ↓                                                       │
//! │  PeerConnectionManager                                   │
//! │  ├─ SignalingChannel (MailboxStore relay)                │
//! │  ├─ Per-peer PeerConnection (timeout + reconnect)        │
//! │  └─ AudioPipeline → Opus → shared outbound track         │
//! │                                                          │
//! │  NoteBroadcastCoordinator                                │
//! │  ├─ NoteBus (fan-out, at-least-once)                     │
//! │  └─ NoteSynthesizer → NoteSink (local mix)               │
//! │                                                          │
//! │  AudioEngine (suspended until an explicit resume)        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use jamroom::RoomRtcConfig;
//!
//! let config = RoomRtcConfig::default();
//! assert!(config.validate().is_ok());
//! assert_eq!(config.max_peers, 10);
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod media;
pub mod notes;
pub mod peer;
pub mod signaling;
pub mod synth;

pub use audio::{AudioEngine, AudioPipeline, EngineState, LevelMeter};
pub use config::{AudioProcessorConfig, AudioProcessorConfigUpdate, RoomRtcConfig};
pub use error::{Error, Result};
pub use notes::{
    InstrumentNoteEvent, MemoryNoteBus, NoteBroadcastCoordinator, NoteBus,
};
pub use peer::{ConnectionState, PeerConnection, PeerConnectionManager, PeerStatus};
pub use signaling::{
    IncomingSignal, MailboxStore, MemoryMailbox, SignalKind, SignalMessage, SignalingChannel,
};
pub use synth::{note_to_frequency, NoteSink, NoteSynthesizer};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
