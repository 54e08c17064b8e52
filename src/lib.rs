// src/lib.rs

pub mod config;
pub mod contrast;
pub mod encoder;
pub mod error;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod line_extractor;
pub mod pipeline;
pub mod preprocessing;
pub mod sampler;
pub mod segmentation;
pub mod stability;
pub mod types;
pub mod video;
pub mod visualizer;

pub use error::PipelineError;
pub use pipeline::{IntervalOutcome, IntervalProcessor, ProcessorOptions};
pub use types::{Config, Interval, IntervalStat, LineSegment, Rect, NO_DATA};
