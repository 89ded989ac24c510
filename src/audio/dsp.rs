//! Sample-level DSP primitives shared by the pipeline and synthesizer

use std::f32::consts::PI;

/// Convert decibels to linear amplitude.
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Convert linear amplitude to decibels, floored at -100 dB.
#[inline]
pub fn linear_to_db(linear: f32) -> f32 {
    if linear <= 1e-5 {
        -100.0
    } else {
        20.0 * linear.log10()
    }
}

/// Second-order IIR filter, Direct Form I.
///
/// Coefficients follow the Audio EQ Cookbook; each `set_*` call is a
/// full re-parameterization and can run between blocks without
/// resetting state, so cutoff changes are click-free.
#[derive(Debug, Clone)]
pub struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl Biquad {
    /// Identity (pass-through) filter.
    pub fn identity() -> Self {
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    /// Butterworth-Q low-pass at `cutoff_hz`.
    pub fn lowpass(sample_rate: f32, cutoff_hz: f32) -> Self {
        let mut f = Self::identity();
        f.set_lowpass(sample_rate, cutoff_hz);
        f
    }

    /// Butterworth-Q high-pass at `cutoff_hz`.
    pub fn highpass(sample_rate: f32, cutoff_hz: f32) -> Self {
        let mut f = Self::identity();
        f.set_highpass(sample_rate, cutoff_hz);
        f
    }

    /// Band-pass centered on `center_hz` with 0 dB peak gain.
    pub fn bandpass(sample_rate: f32, center_hz: f32, q: f32) -> Self {
        let mut f = Self::identity();
        f.set_bandpass(sample_rate, center_hz, q);
        f
    }

    /// Re-parameterize as a low-pass, keeping filter state.
    pub fn set_lowpass(&mut self, sample_rate: f32, cutoff_hz: f32) {
        let (sin_w0, cos_w0, alpha) = Self::intermediates(sample_rate, cutoff_hz);
        let b1 = 1.0 - cos_w0;
        let b0 = b1 / 2.0;
        self.normalize(b0, b1, b0, cos_w0, alpha, sin_w0);
    }

    /// Re-parameterize as a high-pass, keeping filter state.
    pub fn set_highpass(&mut self, sample_rate: f32, cutoff_hz: f32) {
        let (sin_w0, cos_w0, alpha) = Self::intermediates(sample_rate, cutoff_hz);
        let b0 = (1.0 + cos_w0) / 2.0;
        let b1 = -(1.0 + cos_w0);
        self.normalize(b0, b1, b0, cos_w0, alpha, sin_w0);
    }

    /// Re-parameterize as a band-pass, keeping filter state.
    pub fn set_bandpass(&mut self, sample_rate: f32, center_hz: f32, q: f32) {
        let (sin_w0, cos_w0, alpha) =
            Self::intermediates_q(sample_rate, center_hz, q.max(0.1));
        self.normalize(alpha, 0.0, -alpha, cos_w0, alpha, sin_w0);
    }

    fn intermediates(sample_rate: f32, cutoff_hz: f32) -> (f32, f32, f32) {
        Self::intermediates_q(sample_rate, cutoff_hz, std::f32::consts::FRAC_1_SQRT_2)
    }

    fn intermediates_q(sample_rate: f32, cutoff_hz: f32, q: f32) -> (f32, f32, f32) {
        // Clamp below Nyquist so extreme configs stay stable
        let cutoff = cutoff_hz.clamp(10.0, sample_rate * 0.49);
        let w0 = 2.0 * PI * cutoff / sample_rate;
        (w0.sin(), w0.cos(), w0.sin() / (2.0 * q))
    }

    fn normalize(&mut self, b0: f32, b1: f32, b2: f32, cos_w0: f32, alpha: f32, _sin_w0: f32) {
        let a0 = 1.0 + alpha;
        self.b0 = b0 / a0;
        self.b1 = b1 / a0;
        self.b2 = b2 / a0;
        self.a1 = (-2.0 * cos_w0) / a0;
        self.a2 = (1.0 - alpha) / a0;
    }

    /// Process one sample.
    #[inline]
    pub fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }

    /// Clear filter memory.
    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }
}

/// Peak envelope follower with independent attack and release times.
#[derive(Debug, Clone)]
pub struct EnvelopeFollower {
    attack_coeff: f32,
    release_coeff: f32,
    envelope: f32,
}

impl EnvelopeFollower {
    pub fn new(sample_rate: f32, attack_ms: f32, release_ms: f32) -> Self {
        Self {
            attack_coeff: Self::coeff(sample_rate, attack_ms),
            release_coeff: Self::coeff(sample_rate, release_ms),
            envelope: 0.0,
        }
    }

    fn coeff(sample_rate: f32, time_ms: f32) -> f32 {
        let samples = (time_ms.max(0.01) / 1000.0) * sample_rate;
        (-1.0 / samples).exp()
    }

    /// Track the rectified input, returning the current envelope.
    #[inline]
    pub fn process(&mut self, x: f32) -> f32 {
        let rectified = x.abs();
        let coeff = if rectified > self.envelope {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.envelope = coeff * self.envelope + (1.0 - coeff) * rectified;
        self.envelope
    }

    pub fn value(&self) -> f32 {
        self.envelope
    }

    pub fn reset(&mut self) {
        self.envelope = 0.0;
    }
}
