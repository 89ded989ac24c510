//! Single-note render path: oscillator, tone filter, amplitude envelope

use crate::audio::dsp::Biquad;

use super::instrument::{EnvelopeParams, InstrumentPreset, ToneFilter, Waveform};

/// Band-limiting correction for sawtooth and square discontinuities.
#[inline]
fn poly_blep(t: f32, dt: f32) -> f32 {
    if t < dt {
        let t = t / dt;
        2.0 * t - t * t - 1.0
    } else if t > 1.0 - dt {
        let t = (t - 1.0) / dt;
        t * t + 2.0 * t + 1.0
    } else {
        0.0
    }
}

struct Oscillator {
    waveform: Waveform,
    phase: f32,
    phase_inc: f32,
    noise_state: u32,
}

impl Oscillator {
    fn new(waveform: Waveform, frequency: f32, sample_rate: f32) -> Self {
        Self {
            waveform,
            phase: 0.0,
            phase_inc: frequency / sample_rate,
            noise_state: 0x2545_F491,
        }
    }

    #[inline]
    fn next(&mut self) -> f32 {
        let t = self.phase;
        let dt = self.phase_inc;

        let sample = match self.waveform {
            Waveform::Sine => (2.0 * std::f32::consts::PI * t).sin(),
            Waveform::Triangle => {
                if t < 0.5 {
                    4.0 * t - 1.0
                } else {
                    3.0 - 4.0 * t
                }
            }
            Waveform::Sawtooth => 2.0 * t - 1.0 - poly_blep(t, dt),
            Waveform::Square => {
                let raw = if t < 0.5 { 1.0 } else { -1.0 };
                raw + poly_blep(t, dt) - poly_blep((t + 0.5) % 1.0, dt)
            }
            Waveform::Noise => {
                // xorshift32
                let mut x = self.noise_state;
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                self.noise_state = x;
                (x as f32 / u32::MAX as f32) * 2.0 - 1.0
            }
        };

        self.phase += dt;
        if self.phase >= 1.0 {
            self.phase -= 1.0;
        }
        sample
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnvStage {
    Attack,
    Decay,
    Sustain,
    Release,
    Done,
}

/// Linear-attack, exponential decay/release amplitude envelope.
struct Adsr {
    stage: EnvStage,
    level: f32,
    attack_inc: f32,
    decay_coeff: f32,
    sustain: f32,
    release_coeff: f32,
    sample_rate: f32,
}

impl Adsr {
    fn new(params: EnvelopeParams, sample_rate: f32) -> Self {
        Self {
            stage: EnvStage::Attack,
            level: 0.0,
            attack_inc: 1.0 / Self::samples(params.attack_ms, sample_rate),
            decay_coeff: Self::coeff(params.decay_ms, sample_rate),
            sustain: params.sustain.clamp(0.0, 1.0),
            release_coeff: Self::coeff(params.release_ms, sample_rate),
            sample_rate,
        }
    }

    fn samples(time_ms: f32, sample_rate: f32) -> f32 {
        (time_ms.max(0.1) / 1000.0) * sample_rate
    }

    fn coeff(time_ms: f32, sample_rate: f32) -> f32 {
        // Reaches roughly -60 dB of the distance in time_ms
        (-6.91 / Self::samples(time_ms, sample_rate)).exp()
    }

    /// Enter release, overriding the preset release time.
    fn release_with(&mut self, release_ms: f32) {
        if self.stage != EnvStage::Done {
            self.release_coeff = Self::coeff(release_ms, self.sample_rate);
            self.stage = EnvStage::Release;
        }
    }

    fn release(&mut self) {
        if self.stage != EnvStage::Done {
            self.stage = EnvStage::Release;
        }
    }

    fn is_done(&self) -> bool {
        self.stage == EnvStage::Done
    }

    #[inline]
    fn next(&mut self) -> f32 {
        match self.stage {
            EnvStage::Attack => {
                self.level += self.attack_inc;
                if self.level >= 1.0 {
                    self.level = 1.0;
                    self.stage = EnvStage::Decay;
                }
            }
            EnvStage::Decay => {
                self.level = self.sustain + (self.level - self.sustain) * self.decay_coeff;
                if self.level - self.sustain < 1e-4 {
                    self.level = self.sustain;
                    self.stage = if self.sustain > 0.0 {
                        EnvStage::Sustain
                    } else {
                        EnvStage::Done
                    };
                }
            }
            EnvStage::Sustain => {}
            EnvStage::Release => {
                self.level *= self.release_coeff;
                if self.level < 1e-4 {
                    self.level = 0.0;
                    self.stage = EnvStage::Done;
                }
            }
            EnvStage::Done => {}
        }
        self.level
    }
}

/// One sounding note.
pub struct Voice {
    oscillator: Oscillator,
    filter: Option<Biquad>,
    envelope: Adsr,
    amplitude: f32,
}

impl Voice {
    /// Build a voice from a preset at a given pitch and velocity.
    ///
    /// Percussion presets override the pitch with their fixed frequency.
    pub fn new(preset: &InstrumentPreset, frequency: f32, velocity: f32, sample_rate: f32) -> Self {
        let frequency = preset.fixed_frequency_hz.unwrap_or(frequency);
        Self {
            oscillator: Oscillator::new(preset.waveform, frequency, sample_rate),
            filter: match preset.filter {
                ToneFilter::None => None,
                ToneFilter::Lowpass { cutoff_hz } => {
                    Some(Biquad::lowpass(sample_rate, cutoff_hz))
                }
                ToneFilter::Bandpass { center_hz, q } => {
                    Some(Biquad::bandpass(sample_rate, center_hz, q))
                }
            },
            envelope: Adsr::new(preset.envelope, sample_rate),
            amplitude: preset.gain * velocity.clamp(0.0, 1.0),
        }
    }

    /// Render one block, adding into `out`.
    pub fn render(&mut self, out: &mut [f32]) {
        for slot in out.iter_mut() {
            let mut x = self.oscillator.next();
            if let Some(f) = self.filter.as_mut() {
                x = f.process(x);
            }
            *slot += x * self.envelope.next() * self.amplitude;
        }
    }

    /// Enter the preset's natural release.
    pub fn note_off(&mut self) {
        self.envelope.release();
    }

    /// Enter a forced fade-out over `fade_ms`.
    pub fn fade_out(&mut self, fade_ms: f32) {
        self.envelope.release_with(fade_ms);
    }

    /// Whether the envelope has fully decayed.
    pub fn is_finished(&self) -> bool {
        self.envelope.is_done()
    }
}
