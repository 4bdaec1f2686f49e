//! Noise ladders: progressively re-noised copies of the two endpoint latents.

use candle_core::Tensor;
use tracing::debug;

use crate::error::{BlendError, Result};
use crate::noise::NoiseSchedule;
use crate::utils::NoiseSource;

/// Latents for one endpoint; rung 0 is clean, rung `k` sits at `timesteps[k]`.
#[derive(Debug, Clone)]
pub struct NoiseLadder {
    rungs: Vec<Tensor>,
    timesteps: Vec<usize>,
}

impl NoiseLadder {
    pub fn len(&self) -> usize {
        self.rungs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rungs.is_empty()
    }

    /// Rung `index`, clamped to the noisiest rung.
    pub fn rung(&self, index: usize) -> &Tensor {
        &self.rungs[index.min(self.rungs.len() - 1)]
    }

    /// Diffusion timestep of each rung (0 for the clean rung).
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    pub fn rungs(&self) -> &[Tensor] {
        &self.rungs
    }
}

/// Builds a pair of ladders that share one noise draw per rung.
pub struct LatentStackBuilder<'a> {
    schedule: &'a NoiseSchedule,
    stride: usize,
}

impl<'a> LatentStackBuilder<'a> {
    pub fn new(schedule: &'a NoiseSchedule, stride: usize) -> Self {
        Self { schedule, stride }
    }

    /// Produce ladders of `num_frames` rungs for both endpoints.
    ///
    /// Rung `i` is noised to `min(i * stride, max_timestep)`. The same noise
    /// tensor extends both ladders at each rung.
    pub fn build(
        &self,
        latent_a: &Tensor,
        latent_b: &Tensor,
        num_frames: usize,
        noise_source: &mut dyn NoiseSource,
    ) -> Result<(NoiseLadder, NoiseLadder)> {
        if num_frames == 0 {
            return Err(BlendError::SchedulingInvariantViolation {
                slot: 0,
                reason: "noise ladder needs at least one rung",
            });
        }
        if latent_a.dims() != latent_b.dims() {
            return Err(candle_core::Error::Msg(format!(
                "endpoint latents differ in shape: {:?} vs {:?}",
                latent_a.dims(),
                latent_b.dims()
            ))
            .into());
        }

        let mut ladder_a = Vec::with_capacity(num_frames);
        let mut ladder_b = Vec::with_capacity(num_frames);
        let mut timesteps = Vec::with_capacity(num_frames);
        ladder_a.push(latent_a.clone());
        ladder_b.push(latent_b.clone());
        timesteps.push(0);

        let max_t = self.schedule.max_timestep();
        let mut t_prev = 0;
        for i in 1..num_frames {
            let t_now = (t_prev + self.stride).min(max_t);
            let noise = noise_source.randn(latent_a.shape(), latent_a.dtype(), latent_a.device())?;

            // Rung 0 is the clean latent, not a sample at t = 0.
            let (next_a, next_b) = if i == 1 {
                (
                    self.schedule.add_noise(latent_a, &noise, t_now)?,
                    self.schedule.add_noise(latent_b, &noise, t_now)?,
                )
            } else {
                (
                    self.schedule
                        .reschedule_noise(&ladder_a[i - 1], &noise, t_prev, t_now)?,
                    self.schedule
                        .reschedule_noise(&ladder_b[i - 1], &noise, t_prev, t_now)?,
                )
            };
            debug!(rung = i, t_prev, t_now, "extended noise ladders");
            ladder_a.push(next_a);
            ladder_b.push(next_b);
            timesteps.push(t_now);
            t_prev = t_now;
        }

        Ok((
            NoiseLadder {
                rungs: ladder_a,
                timesteps: timesteps.clone(),
            },
            NoiseLadder {
                rungs: ladder_b,
                timesteps,
            },
        ))
    }
}
