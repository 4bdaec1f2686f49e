//! Forward-diffusion noise math.
//!
//! Holds the cumulative noise coefficients of the denoiser's training schedule
//! and uses them to noise latents, either from clean (`add_noise`) or from an
//! already-noised timestep to a later one (`reschedule_noise`).

use candle_core::Tensor;

use crate::config::NoiseScheduleConfig;
use crate::error::{BlendError, Result};

/// Cumulative-noise coefficient tables indexed by diffusion timestep.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    alphas_cumprod: Vec<f64>,
    sqrt_alpha: Vec<f64>,
    sqrt_one_minus_alpha: Vec<f64>,
}

impl NoiseSchedule {
    /// Build the schedule from a beta schedule.
    pub fn from_config(config: &NoiseScheduleConfig) -> Self {
        let n = config.num_train_timesteps.max(2);
        let ramp = |i: usize| i as f64 / (n - 1) as f64;

        let betas: Vec<f64> = match config.beta_schedule.as_str() {
            "scaled_linear" => {
                let start = config.beta_start.sqrt();
                let end = config.beta_end.sqrt();
                (0..n)
                    .map(|i| {
                        let b = start + ramp(i) * (end - start);
                        b * b
                    })
                    .collect()
            }
            _ => (0..n)
                .map(|i| config.beta_start + ramp(i) * (config.beta_end - config.beta_start))
                .collect(),
        };

        let mut cumprod = 1.0;
        let alphas_cumprod = betas
            .iter()
            .map(|b| {
                cumprod *= 1.0 - b;
                cumprod
            })
            .collect();
        Self::from_alphas_cumprod(alphas_cumprod)
    }

    /// Build the schedule from explicit cumulative alphas (must be non-increasing).
    pub fn from_alphas_cumprod(alphas_cumprod: Vec<f64>) -> Self {
        let sqrt_alpha = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alpha = alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();
        Self {
            alphas_cumprod,
            sqrt_alpha,
            sqrt_one_minus_alpha,
        }
    }

    pub fn num_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    pub fn max_timestep(&self) -> usize {
        self.alphas_cumprod.len().saturating_sub(1)
    }

    pub fn alpha_cumprod(&self, t: usize) -> f64 {
        self.alphas_cumprod[t.min(self.max_timestep())]
    }

    pub fn sqrt_alpha(&self, t: usize) -> f64 {
        self.sqrt_alpha[t.min(self.max_timestep())]
    }

    pub fn sqrt_one_minus_alpha(&self, t: usize) -> f64 {
        self.sqrt_one_minus_alpha[t.min(self.max_timestep())]
    }

    fn check_in_range(&self, t1: usize, t2: usize) -> Result<()> {
        if t1 > self.max_timestep() || t2 > self.max_timestep() {
            return Err(BlendError::InvalidTimestepOrder {
                t1,
                t2,
                reason: "timestep beyond the end of the schedule",
            });
        }
        Ok(())
    }

    /// `sqrt_alpha[t] * latent + sqrt_one_minus_alpha[t] * noise`
    pub fn add_noise(&self, latent: &Tensor, noise: &Tensor, t: usize) -> Result<Tensor> {
        self.check_in_range(t, t)?;
        let signal = latent.affine(self.sqrt_alpha[t], 0.0)?;
        let noise = noise.affine(self.sqrt_one_minus_alpha[t], 0.0)?;
        Ok(signal.add(&noise)?)
    }

    /// Re-noise a latent already consistent with `t1` so it is consistent with `t2`.
    ///
    /// Only the variance missing between the two timesteps is added, so with
    /// independent noise `t1 -> t2 -> t3` has the same signal scale and noise
    /// variance as `t1 -> t3`.
    pub fn reschedule_noise(
        &self,
        latent_at_t1: &Tensor,
        noise: &Tensor,
        t1: usize,
        t2: usize,
    ) -> Result<Tensor> {
        let (scale, sigma) = self.reschedule_coefficients(t1, t2)?;
        let signal = latent_at_t1.affine(scale, 0.0)?;
        let noise = noise.affine(sigma, 0.0)?;
        Ok(signal.add(&noise)?)
    }

    /// `(scale, sigma)` used by [`reschedule_noise`](Self::reschedule_noise).
    pub fn reschedule_coefficients(&self, t1: usize, t2: usize) -> Result<(f64, f64)> {
        if t2 < t1 {
            return Err(BlendError::InvalidTimestepOrder {
                t1,
                t2,
                reason: "target timestep precedes source timestep",
            });
        }
        self.check_in_range(t1, t2)?;

        let scale = self.sqrt_alpha[t2] / self.sqrt_alpha[t1];
        let radicand =
            self.sqrt_one_minus_alpha[t2].powi(2) - (scale * self.sqrt_one_minus_alpha[t1]).powi(2);
        // Equal timesteps produce a radicand that is zero up to rounding.
        let radicand = if radicand < 0.0 && radicand > -1e-12 {
            0.0
        } else {
            radicand
        };
        if radicand < 0.0 || !radicand.is_finite() {
            return Err(BlendError::InvalidTimestepOrder {
                t1,
                t2,
                reason: "schedule is not monotone between the timesteps",
            });
        }
        Ok((scale, radicand.sqrt()))
    }
}

impl Default for NoiseSchedule {
    fn default() -> Self {
        Self::from_config(&NoiseScheduleConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_is_monotone() {
        let schedule = NoiseSchedule::default();
        assert_eq!(schedule.num_timesteps(), 1000);
        for t in 1..schedule.num_timesteps() {
            assert!(schedule.alpha_cumprod(t) < schedule.alpha_cumprod(t - 1));
        }
        // SD 1.5 final alpha_cumprod is ~0.0047
        assert!((schedule.alpha_cumprod(999) - 0.0047).abs() < 1e-3);
    }

    #[test]
    fn test_reschedule_same_timestep_is_identity() -> Result<()> {
        let schedule = NoiseSchedule::default();
        let (scale, sigma) = schedule.reschedule_coefficients(400, 400)?;
        assert!((scale - 1.0).abs() < 1e-12);
        assert!(sigma.abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_inconsistent_schedule_is_rejected() {
        // Increasing alphas: noise would have to be removed.
        let schedule = NoiseSchedule::from_alphas_cumprod(vec![0.5, 0.9]);
        assert!(matches!(
            schedule.reschedule_coefficients(0, 1),
            Err(BlendError::InvalidTimestepOrder { .. })
        ));
    }
}
