// src/pipeline/mod.rs

pub mod interval;
pub mod metrics;
pub mod stats;

pub use interval::{ImageMeasurement, IntervalOutcome, IntervalProcessor, ProcessorOptions};
pub use metrics::{MetricsSummary, PipelineMetrics};
pub use stats::{aggregate_interval, output_file_name, IntervalAggregate};
