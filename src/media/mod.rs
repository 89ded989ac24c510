//! Opus codec wrappers and the shared outbound audio track
//!
//! One [`TrackLocalStaticSample`] carries the local mix; it is attached
//! to every peer connection rather than duplicated per peer, so the
//! capture/encode pump runs once regardless of mesh size.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::{Error, Result};

/// Opus frame duration; 20 ms is the interactive-latency standard.
pub const FRAME_DURATION_MS: u32 = 20;

/// Samples per 20 ms mono frame at a given rate.
pub fn samples_per_frame(sample_rate: u32) -> usize {
    (sample_rate as usize / 1000) * FRAME_DURATION_MS as usize
}

/// Opus codec configuration shared by encoder and decoder
#[derive(Debug, Clone, Copy)]
pub struct AudioCodecConfig {
    /// Sample rate in Hz (48000, 24000, or 16000)
    pub sample_rate: u32,
    /// Channel count (1 or 2)
    pub channels: u16,
    /// Encoder bitrate in bits per second
    pub bitrate: u32,
}

impl Default for AudioCodecConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            bitrate: 64000,
        }
    }
}

impl AudioCodecConfig {
    fn validate(&self) -> Result<opus::Channels> {
        if self.sample_rate != 48000 && self.sample_rate != 24000 && self.sample_rate != 16000 {
            return Err(Error::InvalidConfig(
                "Opus sample rate must be 48000, 24000, or 16000 Hz".to_string(),
            ));
        }
        match self.channels {
            1 => Ok(opus::Channels::Mono),
            2 => Ok(opus::Channels::Stereo),
            _ => Err(Error::InvalidConfig(
                "Opus supports 1 (mono) or 2 (stereo) channels".to_string(),
            )),
        }
    }
}

/// Opus encoder for the outbound track
pub struct AudioEncoder {
    encoder: opus::Encoder,
}

// SAFETY: each encoder instance is independent; callers serialize
// access through the audio pump task.
unsafe impl Send for AudioEncoder {}
unsafe impl Sync for AudioEncoder {}

impl AudioEncoder {
    pub fn new(config: AudioCodecConfig) -> Result<Self> {
        let channels = config.validate()?;

        let mut encoder =
            opus::Encoder::new(config.sample_rate, channels, opus::Application::Voip)
                .map_err(|e| Error::Encoding(format!("failed to create Opus encoder: {:?}", e)))?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| Error::Encoding(format!("failed to set bitrate: {:?}", e)))?;

        Ok(Self { encoder })
    }

    /// Encode one frame of f32 samples (-1.0..1.0) into an Opus packet.
    pub fn encode(&mut self, samples: &[f32]) -> Result<Vec<u8>> {
        const MAX_PACKET_SIZE: usize = 4000;
        let mut output = vec![0u8; MAX_PACKET_SIZE];

        let len = self
            .encoder
            .encode_float(samples, &mut output)
            .map_err(|e| Error::Encoding(format!("Opus encoding failed: {:?}", e)))?;

        output.truncate(len);
        Ok(output)
    }
}

/// Opus decoder for inbound peer audio
pub struct AudioDecoder {
    channels: usize,
    decoder: opus::Decoder,
}

// SAFETY: each decoder instance is independent; one lives per RTP
// reader task.
unsafe impl Send for AudioDecoder {}
unsafe impl Sync for AudioDecoder {}

impl AudioDecoder {
    pub fn new(config: AudioCodecConfig) -> Result<Self> {
        let channels = config.validate()?;

        let decoder = opus::Decoder::new(config.sample_rate, channels)
            .map_err(|e| Error::Encoding(format!("failed to create Opus decoder: {:?}", e)))?;

        Ok(Self {
            channels: config.channels as usize,
            decoder,
        })
    }

    /// Decode one Opus packet into f32 samples.
    pub fn decode(&mut self, payload: &[u8]) -> Result<Vec<f32>> {
        // 120 ms at 48 kHz is the largest legal Opus frame
        const MAX_FRAME_SIZE: usize = 5760;
        let mut output = vec![0f32; MAX_FRAME_SIZE * self.channels];

        let len = self
            .decoder
            .decode_float(payload, &mut output, false)
            .map_err(|e| Error::Encoding(format!("Opus decoding failed: {:?}", e)))?;

        output.truncate(len * self.channels);
        Ok(output)
    }
}

/// Create the local Opus track that gets attached to every peer.
pub fn create_audio_track(
    track_id: &str,
    config: &AudioCodecConfig,
) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: config.sample_rate,
            channels: config.channels,
            ..Default::default()
        },
        track_id.to_string(),
        "jamroom-audio".to_string(),
    ))
}

/// Write one encoded frame to the shared track.
pub async fn write_frame(track: &TrackLocalStaticSample, packet: Vec<u8>) -> Result<()> {
    track
        .write_sample(&Sample {
            data: Bytes::from(packet),
            duration: Duration::from_millis(FRAME_DURATION_MS as u64),
            ..Default::default()
        })
        .await
        .map_err(|e| Error::MediaTrack(format!("failed to write audio sample: {}", e)))
}
