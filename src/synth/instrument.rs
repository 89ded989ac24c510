//! Instrument presets and pitch mapping

use tracing::warn;

/// Oscillator waveforms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Triangle,
    Sawtooth,
    Square,
    /// White noise; pitch-insensitive, used by percussion
    Noise,
}

/// Amplitude envelope timing, in milliseconds and a sustain fraction.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeParams {
    pub attack_ms: f32,
    pub decay_ms: f32,
    pub sustain: f32,
    pub release_ms: f32,
}

/// Tone-shaping filter applied after the oscillator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ToneFilter {
    /// Raw oscillator output
    None,
    Lowpass { cutoff_hz: f32 },
    Bandpass { center_hz: f32, q: f32 },
}

/// Timbre definition for one instrument
#[derive(Debug, Clone, Copy)]
pub struct InstrumentPreset {
    pub waveform: Waveform,
    pub envelope: EnvelopeParams,
    pub filter: ToneFilter,
    /// Preset output level in [0, 1]
    pub gain: f32,
    /// Percussion ignores the requested pitch and uses this instead
    pub fixed_frequency_hz: Option<f32>,
}

/// Resolve an instrument name to its preset; unknown names fall back to
/// piano after a warning.
pub fn preset_for(instrument: &str) -> InstrumentPreset {
    match instrument {
        "piano" => PIANO,
        "guitar" => GUITAR,
        "violin" => VIOLIN,
        "flute" => FLUTE,
        "drums" => DRUMS,
        other => {
            warn!(instrument = other, "Unknown instrument, using piano");
            PIANO
        }
    }
}

const PIANO: InstrumentPreset = InstrumentPreset {
    waveform: Waveform::Triangle,
    envelope: EnvelopeParams {
        attack_ms: 5.0,
        decay_ms: 350.0,
        sustain: 0.3,
        release_ms: 200.0,
    },
    filter: ToneFilter::Lowpass { cutoff_hz: 5000.0 },
    gain: 0.8,
    fixed_frequency_hz: None,
};

const GUITAR: InstrumentPreset = InstrumentPreset {
    waveform: Waveform::Sawtooth,
    envelope: EnvelopeParams {
        attack_ms: 8.0,
        decay_ms: 450.0,
        sustain: 0.2,
        release_ms: 150.0,
    },
    filter: ToneFilter::Lowpass { cutoff_hz: 3500.0 },
    gain: 0.7,
    fixed_frequency_hz: None,
};

const VIOLIN: InstrumentPreset = InstrumentPreset {
    waveform: Waveform::Sawtooth,
    envelope: EnvelopeParams {
        attack_ms: 120.0,
        decay_ms: 100.0,
        sustain: 0.8,
        release_ms: 300.0,
    },
    filter: ToneFilter::Lowpass { cutoff_hz: 6000.0 },
    gain: 0.6,
    fixed_frequency_hz: None,
};

const FLUTE: InstrumentPreset = InstrumentPreset {
    waveform: Waveform::Sine,
    envelope: EnvelopeParams {
        attack_ms: 60.0,
        decay_ms: 50.0,
        sustain: 0.9,
        release_ms: 150.0,
    },
    filter: ToneFilter::None,
    gain: 0.75,
    fixed_frequency_hz: None,
};

const DRUMS: InstrumentPreset = InstrumentPreset {
    waveform: Waveform::Noise,
    envelope: EnvelopeParams {
        attack_ms: 1.0,
        decay_ms: 150.0,
        sustain: 0.0,
        release_ms: 50.0,
    },
    // Noise through a band-pass reads as a snare-like hit
    filter: ToneFilter::Bandpass {
        center_hz: 2000.0,
        q: 0.8,
    },
    gain: 0.9,
    fixed_frequency_hz: Some(180.0),
};

/// Map a scientific pitch name ("C4", "F#3", "Bb5") to its equal-
/// temperament frequency, A4 = 440 Hz.
///
/// Unparseable names fall back to 440 Hz after a warning so one bad
/// event cannot silence a whole phrase.
pub fn note_to_frequency(note: &str) -> f32 {
    match parse_note(note) {
        Some(midi) => 440.0 * 2.0_f32.powf((midi as f32 - 69.0) / 12.0),
        None => {
            warn!(note, "Unparseable note name, using A4");
            440.0
        }
    }
}

/// Parse a note name into its MIDI number.
fn parse_note(note: &str) -> Option<i32> {
    let mut chars = note.chars();

    let letter = chars.next()?;
    let base = match letter.to_ascii_uppercase() {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };

    let rest: String = chars.collect();
    let (accidental, octave_str) = match rest.chars().next() {
        Some('#') => (1, &rest[1..]),
        Some('b') => (-1, &rest[1..]),
        _ => (0, rest.as_str()),
    };

    let octave: i32 = octave_str.parse().ok()?;
    if !(-1..=9).contains(&octave) {
        return None;
    }

    Some((octave + 1) * 12 + base + accidental)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_a4_is_440() {
        assert!((note_to_frequency("A4") - 440.0).abs() < 0.001);
    }

    #[test]
    fn test_middle_c() {
        assert!((note_to_frequency("C4") - 261.626).abs() < 0.01);
    }

    #[test]
    fn test_accidentals() {
        // F#3 and Gb3 are enharmonic
        let sharp = note_to_frequency("F#3");
        let flat = note_to_frequency("Gb3");
        assert!((sharp - flat).abs() < 0.001);
        assert!((sharp - 184.997).abs() < 0.01);
    }

    #[test]
    fn test_octave_doubles_frequency() {
        let a4 = note_to_frequency("A4");
        let a5 = note_to_frequency("A5");
        assert!((a5 / a4 - 2.0).abs() < 0.001);
    }

    #[test]
    fn test_garbage_falls_back_to_a4() {
        assert_eq!(note_to_frequency(""), 440.0);
        assert_eq!(note_to_frequency("H4"), 440.0);
        assert_eq!(note_to_frequency("C"), 440.0);
        assert_eq!(note_to_frequency("C99"), 440.0);
    }

    #[test]
    fn test_known_presets() {
        assert_eq!(preset_for("violin").waveform, Waveform::Sawtooth);
        assert_eq!(preset_for("drums").fixed_frequency_hz, Some(180.0));
        assert!(matches!(preset_for("drums").filter, ToneFilter::Bandpass { .. }));
        // Unknown names resolve to piano
        assert_eq!(preset_for("theremin").waveform, preset_for("piano").waveform);
    }
}
