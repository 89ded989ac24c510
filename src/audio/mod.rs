//! Audio engine, processing pipeline, and metering

mod context;
pub mod dsp;
mod level;
mod pipeline;

pub use context::{AudioEngine, EngineState};
pub use level::LevelMeter;
pub use pipeline::AudioPipeline;
