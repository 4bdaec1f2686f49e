//! Candle-Morph: pose-guided latent-diffusion frame interpolation for Candle.
//!
//! Given two images of a subject and their body poses, a blend session fills
//! in the frames between them by repeatedly halving the timeline. Each new
//! frame starts from a spherical blend of its neighbours' latents and is
//! partially re-denoised under a control map rendered from the interpolated
//! pose.

pub mod canny;
pub mod config;
pub mod control;
pub mod denoiser;
pub mod error;
pub mod frame_scheduler;
pub mod io;
pub mod ladder;
pub mod models;
pub mod noise;
pub mod pose;
pub mod sampler;
pub mod session;
pub mod slerp;
pub mod stub;
pub mod utils;

pub use config::{BlendConfig, ConfigError, NoiseScheduleConfig};
pub use control::{ControlMode, ControlState};
pub use error::{BlendError, Result};
pub use frame_scheduler::{BlendOutcome, FrameSchedule, FrameScheduler};
pub use noise::NoiseSchedule;
pub use pose::{Keypoint, Pose};
pub use session::BlendSession;
pub use slerp::slerp;
