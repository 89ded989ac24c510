//! Lock-free audio level metering

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// RMS level meter shared between a decode task and status snapshots.
///
/// The writer is the per-peer RTP reader task; readers sample the
/// normalized level at status-poll cadence. Stored as the f32 bit
/// pattern in an atomic so neither side takes a lock.
#[derive(Debug, Default)]
pub struct LevelMeter {
    level_bits: AtomicU32,
}

impl LevelMeter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Update the meter from one decoded block.
    pub fn update(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
        let rms = (sum_sq / samples.len() as f32).sqrt();
        // Full-scale sine has rms ~0.707; normalize so it reads ~1.0
        let level = (rms * std::f32::consts::SQRT_2).clamp(0.0, 1.0);
        self.level_bits.store(level.to_bits(), Ordering::Relaxed);
    }

    /// Current level in [0, 1].
    pub fn level(&self) -> f32 {
        f32::from_bits(self.level_bits.load(Ordering::Relaxed))
    }

    /// Reset to silence.
    pub fn clear(&self) {
        self.level_bits.store(0.0_f32.to_bits(), Ordering::Relaxed);
    }
}
