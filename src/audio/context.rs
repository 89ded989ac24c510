//! Audio engine lifecycle
//!
//! Platform audio output starts suspended and may only begin after an
//! explicit user action. Callers that produce sound check
//! [`AudioEngine::ensure_resumed`] and surface [`Error::NotReady`]
//! instead of silently resuming, so the embedding surface decides when
//! the resume gesture happens.

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{Error, Result};

/// Engine lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Created but not yet resumed; sound-producing calls fail with
    /// [`Error::NotReady`]
    Suspended,
    /// Resumed and able to produce sound
    Running,
    /// Disposed; terminal
    Closed,
}

/// Owns the suspended/running/closed state of the audio output.
pub struct AudioEngine {
    sample_rate: u32,
    state: Mutex<EngineState>,
}

impl AudioEngine {
    /// Create a suspended engine at the given sample rate.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            state: Mutex::new(EngineState::Suspended),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Transition to `Running`. Idempotent; fails on a closed engine.
    pub fn resume(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            EngineState::Suspended => {
                *state = EngineState::Running;
                info!("Audio engine resumed");
                Ok(())
            }
            EngineState::Running => Ok(()),
            EngineState::Closed => Err(Error::Internal(
                "cannot resume a closed audio engine".to_string(),
            )),
        }
    }

    /// Fail with [`Error::NotReady`] unless the engine is running.
    pub fn ensure_resumed(&self) -> Result<()> {
        match self.state() {
            EngineState::Running => Ok(()),
            EngineState::Suspended => Err(Error::NotReady),
            EngineState::Closed => Err(Error::Internal(
                "audio engine is closed".to_string(),
            )),
        }
    }

    /// Close the engine. Idempotent; terminal.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if *state != EngineState::Closed {
            *state = EngineState::Closed;
            debug!("Audio engine closed");
        }
    }
}
