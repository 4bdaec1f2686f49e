//! Deterministic DDIM sampler with classifier-free guidance.
//!
//! The noise prediction network (UNet plus ControlNet branch) is reached
//! through [`NoisePredictor`]; this module only owns the update rule.

use candle_core::{DType, Tensor};
use tracing::debug;

use crate::control::ControlWeights;
use crate::error::Result;
use crate::noise::NoiseSchedule;

/// Number of ControlNet residuals (12 down blocks + mid block).
pub const CONTROL_SCALE_COUNT: usize = 13;

/// Predicts the noise component of `latents` at `timestep`.
pub trait NoisePredictor: ControlWeights {
    /// `latents`: `[B, C, h, w]`, `text_embeddings`: `[B, L, D]`,
    /// `control`: `[B, 3, H, W]` in `[0, 1]`, one scale per ControlNet residual.
    fn predict_noise(
        &mut self,
        latents: &Tensor,
        timestep: usize,
        text_embeddings: &Tensor,
        control: &Tensor,
        control_scales: &[f64],
    ) -> Result<Tensor>;
}

/// Paired positive/negative conditioning for one sampler run.
#[derive(Debug, Clone)]
pub struct Conditioning {
    pub control: Tensor,
    pub text: Tensor,
    pub uncond_text: Tensor,
    pub control_scales: Vec<f64>,
}

impl Conditioning {
    pub fn new(control: Tensor, text: Tensor, uncond_text: Tensor, control_strength: f64) -> Self {
        Self {
            control,
            text,
            uncond_text,
            control_scales: vec![control_strength; CONTROL_SCALE_COUNT],
        }
    }
}

#[derive(Debug, Clone)]
pub struct DdimSampler {
    schedule: NoiseSchedule,
}

impl DdimSampler {
    pub fn new(schedule: NoiseSchedule) -> Self {
        Self { schedule }
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    /// Uniformly spaced timesteps, ascending: `i * (T / steps) + 1`.
    pub fn timesteps(&self, ddim_steps: usize) -> Vec<usize> {
        let n = self.schedule.num_timesteps();
        let steps = ddim_steps.clamp(1, n);
        let stride = n / steps;
        (0..steps)
            .map(|i| (i * stride + 1).min(self.schedule.max_timestep()))
            .collect()
    }

    /// Number of steps a partial run of `time_fraction` performs.
    pub fn partial_steps(ddim_steps: usize, time_fraction: f64) -> usize {
        ((time_fraction * ddim_steps as f64).ceil() as usize).clamp(1, ddim_steps.max(1))
    }

    /// Denoise `x_t` through the first `steps_to_run` entries of the DDIM schedule.
    ///
    /// `x_t` is treated as the latent at `timesteps[steps_to_run - 1]`; a full
    /// run (`steps_to_run == ddim_steps`) starts from pure noise.
    pub fn sample_from(
        &self,
        predictor: &mut dyn NoisePredictor,
        conditioning: &Conditioning,
        x_t: &Tensor,
        ddim_steps: usize,
        steps_to_run: usize,
        guidance_scale: f64,
    ) -> Result<Tensor> {
        let timesteps = self.timesteps(ddim_steps);
        let run = steps_to_run.clamp(1, timesteps.len());
        let do_cfg = guidance_scale != 1.0;

        let original_dtype = x_t.dtype();
        let mut latents = x_t.to_dtype(DType::F32)?;
        let batch = latents.dim(0)?;

        let (text, control) = if do_cfg {
            (
                Tensor::cat(&[&conditioning.uncond_text, &conditioning.text], 0)?,
                Tensor::cat(&[&conditioning.control, &conditioning.control], 0)?,
            )
        } else {
            (conditioning.text.clone(), conditioning.control.clone())
        };

        for i in (0..run).rev() {
            let t = timesteps[i];
            let alpha_t = self.schedule.alpha_cumprod(t);
            let alpha_prev = if i == 0 {
                self.schedule.alpha_cumprod(0)
            } else {
                self.schedule.alpha_cumprod(timesteps[i - 1])
            };
            debug!(step = run - i, of = run, timestep = t, "DDIM step");

            let noise_pred = if do_cfg {
                let input = Tensor::cat(&[&latents, &latents], 0)?;
                let pred = predictor
                    .predict_noise(&input, t, &text, &control, &conditioning.control_scales)?
                    .to_dtype(DType::F32)?;
                let uncond = pred.narrow(0, 0, batch)?;
                let cond = pred.narrow(0, batch, batch)?;
                let diff = cond.sub(&uncond)?;
                uncond.add(&diff.affine(guidance_scale, 0.0)?)?
            } else {
                predictor
                    .predict_noise(&latents, t, &text, &control, &conditioning.control_scales)?
                    .to_dtype(DType::F32)?
            };

            latents = ddim_step(&latents, &noise_pred, alpha_t, alpha_prev)?;
        }

        Ok(latents.to_dtype(original_dtype)?)
    }
}

/// `x_prev = sqrt(a_prev) * x0_hat + sqrt(1 - a_prev) * eps` (eta = 0).
fn ddim_step(x_t: &Tensor, eps: &Tensor, alpha_t: f64, alpha_prev: f64) -> Result<Tensor> {
    let pred_x0 = x_t
        .sub(&eps.affine((1.0 - alpha_t).sqrt(), 0.0)?)?
        .affine(1.0 / alpha_t.sqrt(), 0.0)?;
    let dir_xt = eps.affine((1.0 - alpha_prev).sqrt(), 0.0)?;
    Ok(pred_x0.affine(alpha_prev.sqrt(), 0.0)?.add(&dir_xt)?)
}
