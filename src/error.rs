//! Error types for the jam-room audio core

/// Result type alias using the jamroom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in room audio operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling mailbox write/read failure (recoverable, caller may retry)
    #[error("Signal delivery failed: {0}")]
    Delivery(String),

    /// SDP offer/answer or ICE exchange error; feeds the reconnect policy
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Local capture denied or unavailable; fatal to starting sharing only
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// An optional processing stage failed to initialize; stage degrades
    /// to pass-through rather than aborting sharing
    #[error("Pipeline stage error: {0}")]
    PipelineStage(String),

    /// Malformed note event; dropped after logging, never crosses the
    /// peer boundary
    #[error("Invalid note event: {0}")]
    InvalidEvent(String),

    /// Peer not found
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidate(String),

    /// SDP negotiation error
    #[error("SDP error: {0}")]
    Sdp(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrack(String),

    /// Opus encoding/decoding error
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Audio engine is suspended pending a resume gesture; callers must
    /// defer and retry after `AudioEngine::resume`
    #[error("Audio engine not resumed")]
    NotReady,

    /// Internal error (should not occur in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Delivery(_) | Error::Negotiation(_) | Error::NotReady | Error::Io(_)
        )
    }

    /// Check if this error only affects a single peer rather than the session
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerNotFound(_)
                | Error::PeerConnection(_)
                | Error::IceCandidate(_)
                | Error::Sdp(_)
                | Error::Negotiation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("test".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: test");
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::Delivery("test".to_string()).is_retryable());
        assert!(Error::NotReady.is_retryable());
        assert!(!Error::InvalidConfig("test".to_string()).is_retryable());
    }

    #[test]
    fn test_error_is_peer_error() {
        assert!(Error::PeerNotFound("test".to_string()).is_peer_error());
        assert!(Error::Negotiation("test".to_string()).is_peer_error());
        assert!(!Error::InvalidEvent("test".to_string()).is_peer_error());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
    }
}
