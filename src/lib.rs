//! Latest-frame dispatch of captured video frames to isolated inference
//! workers, with per-model throttling and fan-in of their results.

pub mod aggregator;
pub mod capture;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod recognizer;
pub mod types;

#[cfg(test)]
mod test_support;

pub use aggregator::{AggregatedState, ResultAggregator};
pub use config::{ModelConfig, PipelineConfig, WorkerConfig};
pub use error::DetectError;
pub use pipeline::{VisionPipeline, WorkerEvent};
pub use types::{DetectionResult, Frame, FrameBuffer, ModelOutput, ModelType};
