//! Error types for blend sessions.

use std::path::PathBuf;

use crate::config::ConfigError;
use crate::control::ControlMode;
use crate::models::stable_diffusion::WeightsError;

/// Errors that abort a blend session.
///
/// Nothing in the crate retries: every variant propagates to the caller, which
/// is expected to restart the session once the cause is fixed.
#[derive(Debug, thiserror::Error)]
pub enum BlendError {
    #[error("invalid timestep order: t1={t1}, t2={t2} ({reason})")]
    InvalidTimestepOrder {
        t1: usize,
        t2: usize,
        reason: &'static str,
    },

    #[error("scheduling invariant violated at slot {slot}: {reason}")]
    SchedulingInvariantViolation { slot: usize, reason: &'static str },

    #[error("no conditioning mode selected")]
    ModeNotSet,

    #[error("failed to prepare output directory: {path}")]
    OutputDirectoryError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no feature extractor available for mode {0}")]
    ExtractorUnavailable(ControlMode),

    #[error("invalid pose: {0}")]
    InvalidPose(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("model weights error: {0}")]
    Weights(#[from] WeightsError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BlendError>;
