//! Oscillator-based note synthesizer
//!
//! Each played voice runs as its own paced render task pushing 10 ms
//! blocks into a [`NoteSink`]. Voices are keyed by a caller-supplied
//! id, so the same pitch can sound more than once at a time. Stopping
//! a voice triggers a short forced fade rather than a hard cut; a
//! voice that is never stopped releases itself when its duration
//! elapses.

mod instrument;
mod voice;

pub use instrument::{note_to_frequency, preset_for, InstrumentPreset, ToneFilter, Waveform};
pub use voice::Voice;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::audio::AudioEngine;
use crate::Result;

/// Render block length; 10 ms keeps stop latency inaudible.
const BLOCK_MS: u64 = 10;
/// Forced fade length when a note is stopped early.
const STOP_FADE_MS: f32 = 50.0;

/// Velocity clamp range for incoming play requests.
const VELOCITY_RANGE: (f32, f32) = (0.1, 1.0);
/// Duration clamp range in milliseconds.
const DURATION_RANGE_MS: (u64, u64) = (100, 3000);

/// Consumer of rendered note audio.
///
/// The production sink mixes blocks into the outbound frame buffer;
/// tests collect them.
pub trait NoteSink: Send + Sync + 'static {
    fn write(&self, block: &[f32]);
}

struct VoiceHandle {
    generation: u64,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Plays and stops notes against a shared sink.
pub struct NoteSynthesizer {
    engine: Arc<AudioEngine>,
    sink: Arc<dyn NoteSink>,
    sample_rate: u32,
    voices: Arc<Mutex<HashMap<String, VoiceHandle>>>,
    next_generation: Mutex<u64>,
}

impl NoteSynthesizer {
    pub fn new(engine: Arc<AudioEngine>, sink: Arc<dyn NoteSink>) -> Self {
        let sample_rate = engine.sample_rate();
        Self {
            engine,
            sink,
            sample_rate,
            voices: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Mutex::new(0),
        }
    }

    /// Start a note under the caller's `voice_id`. Velocity and
    /// duration are clamped to their legal ranges; replaying a sounding
    /// voice id retriggers it, while distinct ids for the same note
    /// name sound side by side (two players can hold the same note).
    ///
    /// Fails with [`crate::Error::NotReady`] until the audio engine has
    /// been resumed.
    pub fn play(
        &self,
        voice_id: &str,
        note: &str,
        instrument: &str,
        velocity: f32,
        duration_ms: u64,
    ) -> Result<()> {
        self.engine.ensure_resumed()?;

        let velocity = velocity.clamp(VELOCITY_RANGE.0, VELOCITY_RANGE.1);
        let duration_ms = duration_ms.clamp(DURATION_RANGE_MS.0, DURATION_RANGE_MS.1);

        let preset = preset_for(instrument);
        let frequency = note_to_frequency(note);
        let mut voice = Voice::new(&preset, frequency, velocity, self.sample_rate as f32);

        let generation = {
            let mut next = self.next_generation.lock();
            *next += 1;
            *next
        };

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let block_len = (self.sample_rate as usize / 1000) * BLOCK_MS as usize;
        let blocks_until_release = duration_ms / BLOCK_MS;

        let sink = Arc::clone(&self.sink);
        let voices = Arc::clone(&self.voices);
        let voice_key = voice_id.to_string();
        let task_key = voice_key.clone();

        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(BLOCK_MS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);

            let mut block = vec![0.0f32; block_len];
            let mut elapsed_blocks: u64 = 0;
            let mut released = false;

            loop {
                tick.tick().await;

                if !released && *stop_rx.borrow_and_update() {
                    voice.fade_out(STOP_FADE_MS);
                    released = true;
                } else if !released && elapsed_blocks >= blocks_until_release {
                    voice.note_off();
                    released = true;
                }

                block.fill(0.0);
                voice.render(&mut block);
                sink.write(&block);
                elapsed_blocks += 1;

                if voice.is_finished() {
                    break;
                }
            }

            let mut voices = voices.lock();
            if voices
                .get(&task_key)
                .map(|h| h.generation == generation)
                .unwrap_or(false)
            {
                voices.remove(&task_key);
            }
        });

        let mut voices = self.voices.lock();
        if let Some(previous) = voices.insert(
            voice_key.clone(),
            VoiceHandle {
                generation,
                stop_tx,
                task,
            },
        ) {
            // Retrigger: fade the superseded voice; its task exits on
            // its own and skips the registry cleanup (stale generation)
            let _ = previous.stop_tx.send(true);
        }

        debug!(voice_id = %voice_key, note, instrument, velocity, duration_ms, "Note started");
        Ok(())
    }

    /// Fade out one voice. Unknown ids are a no-op.
    pub fn stop(&self, voice_id: &str) {
        let voices = self.voices.lock();
        if let Some(handle) = voices.get(voice_id) {
            let _ = handle.stop_tx.send(true);
        }
    }

    /// Fade out every sounding voice.
    pub fn stop_all(&self) {
        let voices = self.voices.lock();
        for handle in voices.values() {
            let _ = handle.stop_tx.send(true);
        }
    }

    /// Ids of the voices currently sounding (including fading ones).
    pub fn active_voices(&self) -> Vec<String> {
        self.voices.lock().keys().cloned().collect()
    }

    /// Abort all render tasks immediately. Idempotent.
    pub fn dispose(&self) {
        let mut voices = self.voices.lock();
        let count = voices.len();
        for (_, handle) in voices.drain() {
            handle.task.abort();
        }
        if count > 0 {
            warn!(voices = count, "Synthesizer disposed with active voices");
        }
    }
}

impl Drop for NoteSynthesizer {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[derive(Default)]
    struct CollectingSink {
        blocks: Mutex<Vec<Vec<f32>>>,
    }

    impl NoteSink for CollectingSink {
        fn write(&self, block: &[f32]) {
            self.blocks.lock().push(block.to_vec());
        }
    }

    impl CollectingSink {
        fn peak(&self) -> f32 {
            self.blocks
                .lock()
                .iter()
                .flatten()
                .fold(0.0_f32, |p, s| p.max(s.abs()))
        }
    }

    fn resumed_engine() -> Arc<AudioEngine> {
        let engine = Arc::new(AudioEngine::new(48000));
        engine.resume().unwrap();
        engine
    }

    #[tokio::test]
    async fn test_play_requires_resumed_engine() {
        let engine = Arc::new(AudioEngine::new(48000));
        let sink = Arc::new(CollectingSink::default());
        let synth = NoteSynthesizer::new(engine.clone(), sink.clone());

        let result = synth.play("v1", "C4", "piano", 0.8, 500);
        assert!(matches!(result, Err(Error::NotReady)));
        assert!(sink.blocks.lock().is_empty());

        engine.resume().unwrap();
        assert!(synth.play("v1", "C4", "piano", 0.8, 500).is_ok());
        synth.dispose();
    }

    #[tokio::test]
    async fn test_note_renders_into_sink() {
        let sink = Arc::new(CollectingSink::default());
        let synth = NoteSynthesizer::new(resumed_engine(), sink.clone());

        synth.play("v1", "A4", "piano", 1.0, 100).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(sink.peak() > 0.05);
        synth.dispose();
    }

    #[tokio::test]
    async fn test_stop_removes_note_after_fade() {
        let sink = Arc::new(CollectingSink::default());
        let synth = NoteSynthesizer::new(resumed_engine(), sink);

        synth.play("v1", "E3", "violin", 0.9, 3000).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(synth.active_voices(), vec!["v1".to_string()]);

        synth.stop("v1");
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(synth.active_voices().is_empty());
    }

    #[tokio::test]
    async fn test_stop_all_silences_everything() {
        let sink = Arc::new(CollectingSink::default());
        let synth = NoteSynthesizer::new(resumed_engine(), sink);

        synth.play("v1", "C4", "piano", 0.8, 3000).unwrap();
        synth.play("v2", "E4", "guitar", 0.8, 3000).unwrap();
        synth.play("v3", "G4", "flute", 0.8, 3000).unwrap();
        assert_eq!(synth.active_voices().len(), 3);

        synth.stop_all();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(synth.active_voices().is_empty());
    }

    #[tokio::test]
    async fn test_note_expires_on_its_own() {
        let sink = Arc::new(CollectingSink::default());
        let synth = NoteSynthesizer::new(resumed_engine(), sink);

        // Duration clamps up to 100 ms minimum
        synth.play("v1", "D4", "drums", 0.5, 10).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(synth.active_voices().is_empty());
    }

    #[tokio::test]
    async fn test_retrigger_replaces_voice() {
        let sink = Arc::new(CollectingSink::default());
        let synth = NoteSynthesizer::new(resumed_engine(), sink);

        synth.play("v1", "C4", "piano", 0.8, 3000).unwrap();
        synth.play("v1", "C4", "piano", 0.8, 3000).unwrap();
        assert_eq!(synth.active_voices().len(), 1);
        synth.dispose();
    }

    #[tokio::test]
    async fn test_same_note_under_distinct_ids_coexists() {
        let sink = Arc::new(CollectingSink::default());
        let synth = NoteSynthesizer::new(resumed_engine(), sink);

        // Two players holding the same pitch must not steal each other
        synth.play("alice:C4", "C4", "piano", 0.8, 3000).unwrap();
        synth.play("bob:C4", "C4", "piano", 0.8, 3000).unwrap();
        assert_eq!(synth.active_voices().len(), 2);

        synth.stop("alice:C4");
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(synth.active_voices(), vec!["bob:C4".to_string()]);
        synth.dispose();
    }
}
