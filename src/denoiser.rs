//! Conditional denoiser adapter: control map + prompts + latent -> RGB frame.

use std::collections::HashMap;

use candle_core::{DType, Device, Shape, Tensor};
use image::RgbImage;
use tracing::{debug, info};

use crate::control::{ControlMode, ControlWeights};
use crate::error::Result;
use crate::io::{image_to_tensor, tensor_to_image};
use crate::noise::NoiseSchedule;
use crate::pose::control_tensor;
use crate::sampler::{Conditioning, DdimSampler, NoisePredictor};
use crate::utils::NoiseSource;

/// Image <-> latent codec (the diffusion model's first stage).
pub trait LatentCodec {
    /// `[B, 3, H, W]` in `[-1, 1]` -> scaled latents `[B, C, H/8, W/8]`.
    fn encode(&self, image: &Tensor) -> Result<Tensor>;
    /// Scaled latents -> `[B, 3, H, W]` in `[-1, 1]`.
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;
}

/// Text prompt -> conditioning embedding `[1, L, D]`.
pub trait PromptEncoder {
    fn encode_prompt(&mut self, prompt: &str) -> Result<Tensor>;
}

pub struct ConditionalDenoiser<'a> {
    pub codec: Box<dyn LatentCodec + 'a>,
    pub prompt_encoder: Box<dyn PromptEncoder + 'a>,
    pub predictor: Box<dyn NoisePredictor + 'a>,
    sampler: DdimSampler,
    noise: Box<dyn NoiseSource + 'a>,
    prompt_cache: HashMap<String, Tensor>,
    device: Device,
    dtype: DType,
}

impl<'a> ConditionalDenoiser<'a> {
    pub fn new(
        codec: Box<dyn LatentCodec + 'a>,
        prompt_encoder: Box<dyn PromptEncoder + 'a>,
        predictor: Box<dyn NoisePredictor + 'a>,
        schedule: NoiseSchedule,
        noise: Box<dyn NoiseSource + 'a>,
        device: Device,
        dtype: DType,
    ) -> Self {
        Self {
            codec,
            prompt_encoder,
            predictor,
            sampler: DdimSampler::new(schedule),
            noise,
            prompt_cache: HashMap::new(),
            device,
            dtype,
        }
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        self.sampler.schedule()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn noise_source(&mut self) -> &mut dyn NoiseSource {
        self.noise.as_mut()
    }

    /// Encode an RGB image into the latent space.
    pub fn encode_image(&self, image: &RgbImage) -> Result<Tensor> {
        let pixels = image_to_tensor(image, &self.device, self.dtype)?;
        self.codec.encode(&pixels)
    }

    fn prompt_embedding(&mut self, prompt: &str) -> Result<Tensor> {
        if let Some(embedding) = self.prompt_cache.get(prompt) {
            return Ok(embedding.clone());
        }
        let embedding = self.prompt_encoder.encode_prompt(prompt)?;
        debug!(prompt, dims = ?embedding.dims(), "encoded prompt");
        self.prompt_cache
            .insert(prompt.to_string(), embedding.clone());
        Ok(embedding)
    }

    fn conditioning(
        &mut self,
        control_map: &RgbImage,
        prompt: &str,
        negative_prompt: &str,
        batch: usize,
        control_strength: f64,
    ) -> Result<Conditioning> {
        let control = control_tensor(control_map, &self.device)?
            .to_dtype(self.dtype)?
            .repeat((batch, 1, 1, 1))?;
        let text = self.prompt_embedding(prompt)?.repeat((batch, 1, 1))?;
        let uncond = self.prompt_embedding(negative_prompt)?.repeat((batch, 1, 1))?;
        Ok(Conditioning::new(control, text, uncond, control_strength))
    }

    /// Partially denoise `starting_latent` under the control map.
    ///
    /// Runs `ceil(time_fraction * ddim_steps)` DDIM steps, treating the latent
    /// as noised to the matching point of the schedule, and decodes the result.
    #[allow(clippy::too_many_arguments)]
    pub fn img2img(
        &mut self,
        control_map: &RgbImage,
        prompt: &str,
        negative_prompt: &str,
        starting_latent: &Tensor,
        control_strength: f64,
        guidance_scale: f64,
        ddim_steps: usize,
        time_fraction: f64,
    ) -> Result<RgbImage> {
        let conditioning =
            self.conditioning(control_map, prompt, negative_prompt, 1, control_strength)?;
        let steps = DdimSampler::partial_steps(ddim_steps, time_fraction);
        debug!(steps, ddim_steps, time_fraction, "img2img");

        let latents = self.sampler.sample_from(
            self.predictor.as_mut(),
            &conditioning,
            starting_latent,
            ddim_steps,
            steps,
            guidance_scale,
        )?;
        let decoded = self.codec.decode(&latents)?;
        tensor_to_image(&decoded)
    }

    /// img2img from an RGB image instead of a prepared latent.
    ///
    /// The image is encoded and noised to `floor(time_fraction * T)`.
    #[allow(clippy::too_many_arguments)]
    pub fn img2img_from_image(
        &mut self,
        control_map: &RgbImage,
        prompt: &str,
        negative_prompt: &str,
        init_image: &RgbImage,
        control_strength: f64,
        guidance_scale: f64,
        ddim_steps: usize,
        time_fraction: f64,
    ) -> Result<RgbImage> {
        let latents = self.encode_image(init_image)?;
        let schedule = self.sampler.schedule();
        let t = ((time_fraction * schedule.num_timesteps() as f64) as usize).min(schedule.max_timestep());
        let noise = self
            .noise
            .randn(latents.shape(), latents.dtype(), latents.device())?;
        let noisy = self.sampler.schedule().add_noise(&latents, &noise, t)?;
        self.img2img(
            control_map,
            prompt,
            negative_prompt,
            &noisy,
            control_strength,
            guidance_scale,
            ddim_steps,
            time_fraction,
        )
    }

    /// Full control-to-image generation of `num_samples` frames from noise.
    ///
    /// Zero samples yields no frames and does not touch the predictor.
    #[allow(clippy::too_many_arguments)]
    pub fn generate(
        &mut self,
        control_map: &RgbImage,
        prompt: &str,
        negative_prompt: &str,
        num_samples: usize,
        guidance_scale: f64,
        ddim_steps: usize,
        control_strength: f64,
    ) -> Result<Vec<RgbImage>> {
        if num_samples == 0 {
            return Ok(Vec::new());
        }
        let conditioning =
            self.conditioning(control_map, prompt, negative_prompt, num_samples, control_strength)?;
        let (w, h) = control_map.dimensions();
        let shape = Shape::from((num_samples, 4, h as usize / 8, w as usize / 8));
        let x_t = self.noise.randn(&shape, self.dtype, &self.device)?;
        info!(num_samples, ddim_steps, "generating from noise");

        let latents = self.sampler.sample_from(
            self.predictor.as_mut(),
            &conditioning,
            &x_t,
            ddim_steps,
            ddim_steps,
            guidance_scale,
        )?;
        let decoded = self.codec.decode(&latents)?;
        (0..num_samples)
            .map(|i| tensor_to_image(&decoded.narrow(0, i, 1)?))
            .collect()
    }
}

impl ControlWeights for ConditionalDenoiser<'_> {
    fn load_control(&mut self, mode: ControlMode) -> Result<()> {
        self.predictor.load_control(mode)
    }
}
