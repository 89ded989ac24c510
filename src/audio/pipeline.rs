//! Outgoing audio processing chain
//!
//! Fixed stage order: high-pass, noise gate, compressor, low-pass,
//! output gain. The high-pass runs first so rumble cannot hold the gate
//! open. Stages are individually switchable and re-parameterizable at
//! runtime. A stage that fails to initialize degrades to pass-through
//! instead of aborting sharing.

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::dsp::{db_to_linear, Biquad, EnvelopeFollower};
use crate::config::{AudioProcessorConfig, AudioProcessorConfigUpdate};
use crate::{Error, Result};

/// Gate gain applied when fully closed (about -60 dB).
const GATE_FLOOR: f32 = 0.001;
/// Compressor threshold; the config exposes the ratio only.
const COMPRESSOR_THRESHOLD_DB: f32 = -24.0;
/// Soft-knee width around the compressor threshold.
const COMPRESSOR_KNEE_DB: f32 = 6.0;
/// Output gain slew time; fast enough to feel immediate, slow enough
/// to avoid zipper noise.
const GAIN_RAMP_MS: f32 = 10.0;

/// Downward expander that mutes the channel between phrases.
struct NoiseGate {
    threshold_linear: f32,
    envelope: EnvelopeFollower,
    gain: f32,
    attack_inc: f32,
    release_dec: f32,
}

impl NoiseGate {
    fn build(sample_rate: f32, threshold_db: f32) -> Result<Self> {
        if !threshold_db.is_finite() {
            return Err(Error::PipelineStage(format!(
                "non-finite gate threshold {}",
                threshold_db
            )));
        }
        Ok(Self {
            threshold_linear: db_to_linear(threshold_db),
            envelope: EnvelopeFollower::new(sample_rate, 2.0, 40.0),
            gain: GATE_FLOOR,
            // 5 ms open, 100 ms close
            attack_inc: 1.0 / (sample_rate * 0.005),
            release_dec: 1.0 / (sample_rate * 0.1),
        })
    }

    fn set_threshold(&mut self, threshold_db: f32) {
        self.threshold_linear = db_to_linear(threshold_db);
    }

    #[inline]
    fn process(&mut self, x: f32) -> f32 {
        let level = self.envelope.process(x);
        if level >= self.threshold_linear {
            self.gain = (self.gain + self.attack_inc).min(1.0);
        } else {
            self.gain = (self.gain - self.release_dec).max(GATE_FLOOR);
        }
        x * self.gain
    }
}

/// Soft-knee feed-forward compressor with fixed makeup gain.
struct Compressor {
    ratio: f32,
    envelope: EnvelopeFollower,
    makeup: f32,
}

impl Compressor {
    fn build(sample_rate: f32, ratio: f32) -> Result<Self> {
        if !ratio.is_finite() {
            return Err(Error::PipelineStage(format!(
                "non-finite compression ratio {}",
                ratio
            )));
        }
        let mut c = Self {
            ratio: 1.0,
            envelope: EnvelopeFollower::new(sample_rate, 5.0, 80.0),
            makeup: 1.0,
        };
        c.set_ratio(ratio);
        Ok(c)
    }

    fn set_ratio(&mut self, ratio: f32) {
        self.ratio = ratio.clamp(1.0, 20.0);
        // Makeup recovers half the gain reduction a 0 dBFS peak would see
        let max_reduction = -COMPRESSOR_THRESHOLD_DB * (1.0 - 1.0 / self.ratio);
        self.makeup = db_to_linear(max_reduction / 2.0);
    }

    /// Gain reduction in dB for a given input level in dB.
    fn reduction_db(&self, level_db: f32) -> f32 {
        let overshoot = level_db - COMPRESSOR_THRESHOLD_DB;
        let half_knee = COMPRESSOR_KNEE_DB / 2.0;
        if overshoot <= -half_knee {
            0.0
        } else if overshoot < half_knee {
            // Quadratic interpolation inside the knee
            let t = overshoot + half_knee;
            (1.0 / self.ratio - 1.0) * t * t / (2.0 * COMPRESSOR_KNEE_DB)
        } else {
            (1.0 / self.ratio - 1.0) * overshoot
        }
    }

    #[inline]
    fn process(&mut self, x: f32) -> f32 {
        let level = self.envelope.process(x);
        let level_db = super::dsp::linear_to_db(level);
        let gain = db_to_linear(self.reduction_db(level_db));
        x * gain * self.makeup
    }
}

/// Smoothed output gain; target is clamped to [0, 2].
struct Gain {
    current: f32,
    target: f32,
    step: f32,
}

impl Gain {
    fn new(sample_rate: f32) -> Self {
        Self {
            current: 1.0,
            target: 1.0,
            step: 1.0 / (sample_rate * GAIN_RAMP_MS / 1000.0),
        }
    }

    fn set_target(&mut self, gain: f32) {
        self.target = gain.clamp(0.0, 2.0);
    }

    #[inline]
    fn process(&mut self, x: f32) -> f32 {
        if self.current < self.target {
            self.current = (self.current + self.step).min(self.target);
        } else if self.current > self.target {
            self.current = (self.current - self.step).max(self.target);
        }
        x * self.current
    }
}

struct Stages {
    gate: Option<NoiseGate>,
    compressor: Option<Compressor>,
    low_cut: Option<Biquad>,
    high_cut: Option<Biquad>,
    gain: Gain,
    config: AudioProcessorConfig,
}

/// The per-session outgoing processing chain.
///
/// `process` mutates sample blocks in place between capture and the
/// Opus encoder. All stage state lives behind one lock; the audio pump
/// is the only steady-state caller, so contention is limited to config
/// updates.
pub struct AudioPipeline {
    sample_rate: f32,
    stages: Mutex<Option<Stages>>,
}

impl AudioPipeline {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate as f32,
            stages: Mutex::new(None),
        }
    }

    /// Build the stage chain from a config.
    ///
    /// A stage whose construction fails is left out (pass-through) and
    /// logged; a bad parameter degrades one stage, never the session.
    pub fn initialize(&self, config: AudioProcessorConfig) -> Result<()> {
        let gate = self.build_gate(config.enable_noise_gate, config.noise_gate_threshold_db);
        let compressor = self.build_compressor(config.enable_compression, config.compression_ratio);
        let (low_cut, high_cut) =
            self.build_filters(config.enable_filtering, config.low_cut_hz, config.high_cut_hz);

        let mut stages = self.stages.lock();
        *stages = Some(Stages {
            gate,
            compressor,
            low_cut,
            high_cut,
            gain: Gain::new(self.sample_rate),
            config,
        });

        debug!(
            gate = config.enable_noise_gate,
            compression = config.enable_compression,
            filtering = config.enable_filtering,
            "Audio pipeline initialized"
        );
        Ok(())
    }

    fn build_gate(&self, enabled: bool, threshold_db: f32) -> Option<NoiseGate> {
        if !enabled {
            return None;
        }
        match NoiseGate::build(self.sample_rate, threshold_db) {
            Ok(gate) => Some(gate),
            Err(e) => {
                warn!(error = %e, "Noise gate unavailable; running without it");
                None
            }
        }
    }

    fn build_compressor(&self, enabled: bool, ratio: f32) -> Option<Compressor> {
        if !enabled {
            return None;
        }
        match Compressor::build(self.sample_rate, ratio) {
            Ok(comp) => Some(comp),
            Err(e) => {
                warn!(error = %e, "Compressor unavailable; running without it");
                None
            }
        }
    }

    fn build_filters(
        &self,
        enabled: bool,
        low_cut_hz: f32,
        high_cut_hz: f32,
    ) -> (Option<Biquad>, Option<Biquad>) {
        if !enabled {
            return (None, None);
        }
        if !low_cut_hz.is_finite() || !high_cut_hz.is_finite() || low_cut_hz >= high_cut_hz {
            warn!(
                low_cut_hz,
                high_cut_hz,
                "Unusable band filter cutoffs; running filters as pass-through"
            );
            return (None, None);
        }
        (
            Some(Biquad::highpass(self.sample_rate, low_cut_hz)),
            Some(Biquad::lowpass(self.sample_rate, high_cut_hz)),
        )
    }

    /// Whether `initialize` has run and `dispose` has not.
    pub fn is_initialized(&self) -> bool {
        self.stages.lock().is_some()
    }

    /// Run one block through the chain in place.
    ///
    /// An uninitialized pipeline passes audio through untouched.
    pub fn process(&self, samples: &mut [f32]) {
        let mut guard = self.stages.lock();
        let Some(stages) = guard.as_mut() else {
            return;
        };

        for sample in samples.iter_mut() {
            let mut x = *sample;
            if let Some(f) = stages.low_cut.as_mut() {
                x = f.process(x);
            }
            if let Some(gate) = stages.gate.as_mut() {
                x = gate.process(x);
            }
            if let Some(comp) = stages.compressor.as_mut() {
                x = comp.process(x);
            }
            if let Some(f) = stages.high_cut.as_mut() {
                x = f.process(x);
            }
            x = stages.gain.process(x);
            *sample = x.clamp(-1.0, 1.0);
        }
    }

    /// Re-parameterize live stages from a partial update without
    /// rebuilding the chain; audio keeps flowing throughout.
    ///
    /// Toggling a stage on that was built disabled rebuilds just that
    /// stage.
    pub fn update_config(&self, update: &AudioProcessorConfigUpdate) -> Result<()> {
        let mut guard = self.stages.lock();
        let stages = guard
            .as_mut()
            .ok_or_else(|| Error::Internal("pipeline not initialized".to_string()))?;

        let merged = stages.config.merged(update);

        // A live stage with a sane new value is re-parameterized in
        // place (keeping its envelope state); anything else is rebuilt
        // or dropped through the same degradation path as initialize
        stages.gate = match (merged.enable_noise_gate, stages.gate.take()) {
            (true, Some(mut gate)) if merged.noise_gate_threshold_db.is_finite() => {
                gate.set_threshold(merged.noise_gate_threshold_db);
                Some(gate)
            }
            (true, _) => self.build_gate(true, merged.noise_gate_threshold_db),
            (false, _) => None,
        };

        stages.compressor = match (merged.enable_compression, stages.compressor.take()) {
            (true, Some(mut comp)) if merged.compression_ratio.is_finite() => {
                comp.set_ratio(merged.compression_ratio);
                Some(comp)
            }
            (true, _) => self.build_compressor(true, merged.compression_ratio),
            (false, _) => None,
        };

        let filters_usable = merged.low_cut_hz.is_finite()
            && merged.high_cut_hz.is_finite()
            && merged.low_cut_hz < merged.high_cut_hz;
        if merged.enable_filtering && filters_usable {
            match stages.low_cut.as_mut() {
                Some(f) => f.set_highpass(self.sample_rate, merged.low_cut_hz),
                None => stages.low_cut = Some(Biquad::highpass(self.sample_rate, merged.low_cut_hz)),
            }
            match stages.high_cut.as_mut() {
                Some(f) => f.set_lowpass(self.sample_rate, merged.high_cut_hz),
                None => stages.high_cut = Some(Biquad::lowpass(self.sample_rate, merged.high_cut_hz)),
            }
        } else {
            if merged.enable_filtering {
                warn!(
                    low_cut_hz = merged.low_cut_hz,
                    high_cut_hz = merged.high_cut_hz,
                    "Unusable band filter cutoffs; disabling filters"
                );
            }
            stages.low_cut = None;
            stages.high_cut = None;
        }

        stages.config = merged;
        debug!("Audio pipeline reconfigured");
        Ok(())
    }

    /// Set the output gain target; clamped to [0, 2] and slewed over a
    /// few milliseconds.
    pub fn set_gain(&self, gain: f32) {
        if let Some(stages) = self.stages.lock().as_mut() {
            stages.gain.set_target(gain);
        }
    }

    /// Snapshot of the live config, if initialized.
    pub fn config(&self) -> Option<AudioProcessorConfig> {
        self.stages.lock().as_ref().map(|s| s.config)
    }

    /// Tear down all stages. Idempotent; a disposed pipeline passes
    /// audio through.
    pub fn dispose(&self) {
        let mut stages = self.stages.lock();
        if stages.take().is_some() {
            debug!("Audio pipeline disposed");
        }
    }
}
