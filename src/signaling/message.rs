//! Signaling wire format
//!
//! Messages are relayed between two peers through a room-scoped mailbox
//! store. A message is immutable once sent and uniquely identified by
//! `signal_id` (falling back to a `from:kind:timestamp` composite when a
//! producer omitted it).

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::{Error, Result};

/// Default mailbox time-to-live for a signal, in milliseconds.
pub const DEFAULT_SIGNAL_TTL_MS: u64 = 60_000;

/// Signal kinds exchanged during negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// SDP offer initiating a connection
    Offer,
    /// SDP answer completing negotiation
    Answer,
    /// Serialized ICE candidate
    IceCandidate,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Offer => write!(f, "offer"),
            SignalKind::Answer => write!(f, "answer"),
            SignalKind::IceCandidate => write!(f, "ice-candidate"),
        }
    }
}

/// One mailbox entry, addressed from one peer to another within a room
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    /// Signal kind
    #[serde(rename = "type")]
    pub kind: SignalKind,

    /// SDP string for offers/answers, serialized candidate for ICE
    pub data: serde_json::Value,

    /// Sender user id
    pub from: String,

    /// Recipient user id
    pub to: String,

    /// Room the mailbox belongs to
    pub room_id: String,

    /// Epoch millis when the sender created the message
    pub timestamp: u64,

    /// Unique id for deduplication
    pub signal_id: String,

    /// Time-to-live in milliseconds; expired entries are swept regardless
    /// of consumption state
    pub ttl: u64,
}

impl SignalMessage {
    /// Build a new message with a fresh signal id and current timestamp.
    pub fn new(
        kind: SignalKind,
        data: serde_json::Value,
        from: impl Into<String>,
        to: impl Into<String>,
        room_id: impl Into<String>,
        ttl_ms: u64,
    ) -> Self {
        Self {
            kind,
            data,
            from: from.into(),
            to: to.into(),
            room_id: room_id.into(),
            timestamp: epoch_millis(),
            signal_id: uuid::Uuid::new_v4().to_string(),
            ttl: ttl_ms,
        }
    }

    /// Deduplication key: the signal id, or a `from:kind:timestamp`
    /// composite when the id is empty.
    pub fn dedup_key(&self) -> String {
        if self.signal_id.is_empty() {
            format!("{}:{}:{}", self.from, self.kind, self.timestamp)
        } else {
            self.signal_id.clone()
        }
    }

    /// Whether this entry has outlived its TTL at the given clock reading.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.timestamp.saturating_add(self.ttl) < now_ms
    }

    /// Extract the SDP string from an offer/answer payload.
    pub fn sdp(&self) -> Result<String> {
        self.data
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Serialization("signal payload is not an SDP string".to_string()))
    }

    /// Deserialize an ICE-candidate payload into the engine's native type.
    pub fn ice_candidate(&self) -> Result<RTCIceCandidateInit> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| Error::Serialization(format!("malformed ICE candidate payload: {}", e)))
    }
}

/// Decoded signal handed to the negotiation layer
#[derive(Debug, Clone)]
pub enum IncomingSignal {
    /// SDP offer from `from`
    Offer { from: String, sdp: String },
    /// SDP answer from `from`
    Answer { from: String, sdp: String },
    /// ICE candidate from `from`, already in native form
    Candidate {
        from: String,
        candidate: RTCIceCandidateInit,
    },
}

impl IncomingSignal {
    /// Decode a raw mailbox entry.
    pub fn from_message(msg: &SignalMessage) -> Result<Self> {
        match msg.kind {
            SignalKind::Offer => Ok(IncomingSignal::Offer {
                from: msg.from.clone(),
                sdp: msg.sdp()?,
            }),
            SignalKind::Answer => Ok(IncomingSignal::Answer {
                from: msg.from.clone(),
                sdp: msg.sdp()?,
            }),
            SignalKind::IceCandidate => Ok(IncomingSignal::Candidate {
                from: msg.from.clone(),
                candidate: msg.ice_candidate()?,
            }),
        }
    }

    /// Sender user id
    pub fn from_id(&self) -> &str {
        match self {
            IncomingSignal::Offer { from, .. } => from,
            IncomingSignal::Answer { from, .. } => from,
            IncomingSignal::Candidate { from, .. } => from,
        }
    }
}

/// Current wall clock in epoch milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_roundtrip() {
        let msg = SignalMessage::new(
            SignalKind::Offer,
            serde_json::json!("v=0\r\no=- ..."),
            "alice",
            "bob",
            "room-1",
            DEFAULT_SIGNAL_TTL_MS,
        );

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"offer\""));
        assert!(json.contains("\"roomId\""));

        let parsed: SignalMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, SignalKind::Offer);
        assert_eq!(parsed.sdp().unwrap(), "v=0\r\no=- ...");
    }

    #[test]
    fn test_dedup_key_composite_fallback() {
        let mut msg = SignalMessage::new(
            SignalKind::Answer,
            serde_json::json!("sdp"),
            "alice",
            "bob",
            "room-1",
            DEFAULT_SIGNAL_TTL_MS,
        );
        assert_eq!(msg.dedup_key(), msg.signal_id);

        msg.signal_id.clear();
        let key = msg.dedup_key();
        assert!(key.starts_with("alice:answer:"));
    }

    #[test]
    fn test_expiry() {
        let mut msg = SignalMessage::new(
            SignalKind::Offer,
            serde_json::json!("sdp"),
            "a",
            "b",
            "r",
            1000,
        );
        msg.timestamp = 10_000;

        assert!(!msg.is_expired_at(10_500));
        assert!(!msg.is_expired_at(11_000));
        assert!(msg.is_expired_at(11_001));
    }

    #[test]
    fn test_ice_payload_native_decode() {
        let msg = SignalMessage::new(
            SignalKind::IceCandidate,
            serde_json::json!({
                "candidate": "candidate:1 1 udp 2130706431 192.0.2.1 54400 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "usernameFragment": "abcd"
            }),
            "alice",
            "bob",
            "room-1",
            DEFAULT_SIGNAL_TTL_MS,
        );

        let init = msg.ice_candidate().unwrap();
        assert_eq!(init.sdp_mline_index, Some(0));
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));

        let signal = IncomingSignal::from_message(&msg).unwrap();
        assert!(matches!(signal, IncomingSignal::Candidate { .. }));
        assert_eq!(signal.from_id(), "alice");
    }
}
