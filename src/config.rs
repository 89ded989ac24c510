//! Configuration types for the room audio core

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration for a room RTC session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomRtcConfig {
    /// STUN server URLs (at least one required; no TURN fallback)
    pub stun_servers: Vec<String>,

    /// Maximum peers in the mesh (default: 10, max: 10)
    pub max_peers: u32,

    /// Connection establishment timeout in seconds (default: 30).
    /// Expiry feeds the same reconnect path as an ICE failure.
    pub ice_timeout_secs: u64,

    /// Maximum reconnection attempts per peer (default: 5)
    pub max_reconnect_attempts: u32,

    /// Initial reconnection backoff in milliseconds (default: 1000)
    pub reconnect_backoff_initial_ms: u64,

    /// Maximum reconnection backoff in milliseconds (default: 30000)
    pub reconnect_backoff_max_ms: u64,

    /// Signal mailbox time-to-live in milliseconds (default: 60000)
    pub signal_ttl_ms: u64,

    /// Mailbox sweep interval in seconds (default: 30)
    pub signal_sweep_interval_secs: u64,

    /// Echo-suppression dedup window in milliseconds (default: 300)
    pub note_dedup_window_ms: u64,

    /// Session sample rate in Hz (default: 48000, Opus native)
    pub sample_rate: u32,
}

impl Default for RoomRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            max_peers: 10,
            ice_timeout_secs: 30,
            max_reconnect_attempts: 5,
            reconnect_backoff_initial_ms: 1000,
            reconnect_backoff_max_ms: 30000,
            signal_ttl_ms: 60_000,
            signal_sweep_interval_secs: 30,
            note_dedup_window_ms: 300,
            sample_rate: 48000,
        }
    }
}

impl RoomRtcConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is outside its supported range.
    pub fn validate(&self) -> Result<()> {
        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one STUN server is required".to_string(),
            ));
        }

        for url in &self.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN server URL must start with stun: or stuns:, got {}",
                    url
                )));
            }
        }

        if self.max_peers == 0 || self.max_peers > 10 {
            return Err(Error::InvalidConfig(format!(
                "max_peers must be in range 1-10, got {}",
                self.max_peers
            )));
        }

        if self.ice_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "ice_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.signal_ttl_ms == 0 {
            return Err(Error::InvalidConfig(
                "signal_ttl_ms must be greater than zero".to_string(),
            ));
        }

        if self.sample_rate != 48000 && self.sample_rate != 24000 && self.sample_rate != 16000 {
            return Err(Error::InvalidConfig(
                "sample_rate must be 48000, 24000, or 16000 Hz (Opus)".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration for the outgoing audio processing chain.
///
/// Mutable at runtime; `AudioPipeline::update_config` re-parameterizes
/// already-connected stages without rebuilding the graph.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioProcessorConfig {
    /// Noise gate threshold in dB (signals below are attenuated)
    pub noise_gate_threshold_db: f32,

    /// Compression ratio (1.0 = none, 20.0 = hard limiting)
    pub compression_ratio: f32,

    /// High-pass cutoff in Hz (rumble removal)
    pub low_cut_hz: f32,

    /// Low-pass cutoff in Hz (hiss removal)
    pub high_cut_hz: f32,

    /// Enable the noise gate stage
    pub enable_noise_gate: bool,

    /// Enable the compressor stage
    pub enable_compression: bool,

    /// Enable the band filter stages
    pub enable_filtering: bool,
}

impl Default for AudioProcessorConfig {
    fn default() -> Self {
        Self {
            noise_gate_threshold_db: -45.0,
            compression_ratio: 4.0,
            low_cut_hz: 80.0,
            high_cut_hz: 12000.0,
            enable_noise_gate: true,
            enable_compression: true,
            enable_filtering: true,
        }
    }
}

/// Partial update for [`AudioProcessorConfig`]; `None` fields keep the
/// live value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AudioProcessorConfigUpdate {
    pub noise_gate_threshold_db: Option<f32>,
    pub compression_ratio: Option<f32>,
    pub low_cut_hz: Option<f32>,
    pub high_cut_hz: Option<f32>,
    pub enable_noise_gate: Option<bool>,
    pub enable_compression: Option<bool>,
    pub enable_filtering: Option<bool>,
}

impl AudioProcessorConfig {
    /// Merge a partial update into this config, returning the result.
    pub fn merged(&self, update: &AudioProcessorConfigUpdate) -> Self {
        Self {
            noise_gate_threshold_db: update
                .noise_gate_threshold_db
                .unwrap_or(self.noise_gate_threshold_db),
            compression_ratio: update.compression_ratio.unwrap_or(self.compression_ratio),
            low_cut_hz: update.low_cut_hz.unwrap_or(self.low_cut_hz),
            high_cut_hz: update.high_cut_hz.unwrap_or(self.high_cut_hz),
            enable_noise_gate: update.enable_noise_gate.unwrap_or(self.enable_noise_gate),
            enable_compression: update.enable_compression.unwrap_or(self.enable_compression),
            enable_filtering: update.enable_filtering.unwrap_or(self.enable_filtering),
        }
    }
}
