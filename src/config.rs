//! Configuration structures for blend sessions

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Upper bound on subdivision levels (2^8 + 1 = 257 output frames).
pub const MAX_LEVELS: usize = 8;

/// Noise schedule configuration (Stable Diffusion 1.5 defaults)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoiseScheduleConfig {
    /// Number of training timesteps (typically 1000)
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,
    /// First beta of the schedule
    pub beta_start: f64,
    /// Last beta of the schedule
    pub beta_end: f64,
    /// Beta schedule type: "scaled_linear" or "linear"
    pub beta_schedule: String,
}

fn default_num_train_timesteps() -> usize {
    1000
}

impl Default for NoiseScheduleConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: "scaled_linear".to_string(),
        }
    }
}

/// Blend session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlendConfig {
    /// Sampler steps consumed per subdivision level
    pub steps_per_frame: usize,
    /// Total DDIM steps; `ddim_steps / steps_per_frame` is the level count
    pub ddim_steps: usize,
    /// Classifier-free guidance scale
    pub guidance_scale: f64,
    /// ControlNet residual scale
    pub control_strength: f64,
    /// Fraction of the DDIM schedule each img2img call runs
    #[serde(default = "default_time_fraction")]
    pub time_fraction: f64,
    /// Fraction nudge applied to slots adjacent to an endpoint
    #[serde(default = "default_edge_bias")]
    pub edge_bias: f64,
    /// Timestep increment between noise ladder rungs
    #[serde(default = "default_ladder_stride")]
    pub ladder_stride: usize,
    /// Output width (multiple of 8)
    #[serde(default = "default_resolution")]
    pub width: usize,
    /// Output height (multiple of 8)
    #[serde(default = "default_resolution")]
    pub height: usize,
    /// Seed for ladder noise
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Directory receiving the frames; cleared at session start
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_time_fraction() -> f64 {
    0.3
}

fn default_edge_bias() -> f64 {
    0.15
}

fn default_ladder_stride() -> usize {
    100
}

fn default_resolution() -> usize {
    512
}

fn default_seed() -> u64 {
    42
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("blend")
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self {
            steps_per_frame: 20,
            ddim_steps: 50,
            guidance_scale: 7.5,
            control_strength: 1.0,
            time_fraction: 0.3,
            edge_bias: 0.15,
            ladder_stride: 100,
            width: 512,
            height: 512,
            seed: default_seed(),
            output_dir: default_output_dir(),
        }
    }
}

impl BlendConfig {
    /// Create a configuration with validation
    pub fn new(
        steps_per_frame: usize,
        ddim_steps: usize,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            steps_per_frame,
            ddim_steps,
            output_dir: output_dir.into(),
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::JsonParse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.steps_per_frame == 0 || self.ddim_steps < self.steps_per_frame {
            return Err(ConfigError::NoLevels {
                steps_per_frame: self.steps_per_frame,
                ddim_steps: self.ddim_steps,
            });
        }
        let levels = self.levels();
        if levels > MAX_LEVELS {
            return Err(ConfigError::TooManyLevels(levels));
        }
        if !self.height.is_multiple_of(8) || !self.width.is_multiple_of(8) || self.height == 0 || self.width == 0
        {
            return Err(ConfigError::InvalidDimensions {
                height: self.height,
                width: self.width,
            });
        }
        if !(self.time_fraction > 0.0 && self.time_fraction <= 1.0) {
            return Err(ConfigError::InvalidTimeFraction(self.time_fraction));
        }
        if !(0.0..0.5).contains(&self.edge_bias) {
            return Err(ConfigError::InvalidEdgeBias(self.edge_bias));
        }
        Ok(())
    }

    /// Number of subdivision levels
    pub fn levels(&self) -> usize {
        self.ddim_steps.checked_div(self.steps_per_frame).unwrap_or(0)
    }

    /// Set the seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the output resolution
    pub fn with_resolution(mut self, width: usize, height: usize) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the guidance scale
    pub fn with_guidance_scale(mut self, scale: f64) -> Self {
        self.guidance_scale = scale;
        self
    }

    /// Latent shape `(channels, height/8, width/8)` for a 4-channel latent space
    pub fn latent_shape(&self) -> (usize, usize, usize) {
        (4, self.height / 8, self.width / 8)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "steps_per_frame={steps_per_frame} with ddim_steps={ddim_steps} gives no subdivision level"
    )]
    NoLevels {
        steps_per_frame: usize,
        ddim_steps: usize,
    },
    #[error("{0} subdivision levels requested, at most {MAX_LEVELS} are supported")]
    TooManyLevels(usize),
    #[error("Invalid dimensions: height={height}, width={width}. Must be non-zero multiples of 8")]
    InvalidDimensions { height: usize, width: usize },
    #[error("time_fraction must be in (0, 1], got {0}")]
    InvalidTimeFraction(f64),
    #[error("edge_bias must be in [0, 0.5), got {0}")]
    InvalidEdgeBias(f64),
    #[error("Failed to read config: {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse JSON config: {path}")]
    JsonParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BlendConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.levels(), 2);
        assert_eq!(config.latent_shape(), (4, 64, 64));
    }

    #[test]
    fn test_config_validation() {
        assert!(BlendConfig::new(1, 2, "out").is_ok());
        assert!(matches!(
            BlendConfig::new(0, 2, "out"),
            Err(ConfigError::NoLevels { .. })
        ));
        assert!(matches!(
            BlendConfig::new(30, 20, "out"),
            Err(ConfigError::NoLevels { .. })
        ));
        assert!(matches!(
            BlendConfig::new(1, 9, "out"),
            Err(ConfigError::TooManyLevels(9))
        ));

        let bad = BlendConfig::default().with_resolution(500, 512);
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn test_json_defaults() -> serde_json::Result<()> {
        let config: BlendConfig = serde_json::from_str(
            r#"{"steps_per_frame": 10, "ddim_steps": 30, "guidance_scale": 9.0, "control_strength": 1.0}"#,
        )?;
        assert_eq!(config.levels(), 3);
        assert_eq!(config.ladder_stride, 100);
        assert_eq!(config.width, 512);
        assert!((config.time_fraction - 0.3).abs() < 1e-12);
        Ok(())
    }
}
