// src/error.rs
//
// Typed failure kinds that callers may want to branch on. Everything else is
// carried as anyhow context; these variants survive `downcast_ref`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("dimension mismatch: expected {expected_w}x{expected_h}, got {got_w}x{got_h}")]
    DimensionMismatch {
        expected_w: u32,
        expected_h: u32,
        got_w: u32,
        got_h: u32,
    },

    #[error("cannot open video source {path}: {reason}")]
    SourceOpen { path: String, reason: String },

    #[error("failed to start encoder `{program}`: {reason}")]
    EncoderSpawn { program: String, reason: String },

    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("segmentation failed: {0}")]
    Segmentation(String),
}

impl PipelineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        PipelineError::InvalidConfig(msg.into())
    }

    pub fn mismatch(expected: (u32, u32), got: (u32, u32)) -> Self {
        PipelineError::DimensionMismatch {
            expected_w: expected.0,
            expected_h: expected.1,
            got_w: got.0,
            got_h: got.1,
        }
    }
}
