//! Lightweight collaborators for running a session without model weights.
//!
//! Used by the integration tests and the CLI's `--mock` mode.

use candle_core::{DType, Device, Tensor};

use crate::control::{ControlMode, ControlWeights};
use crate::denoiser::{LatentCodec, PromptEncoder};
use crate::error::Result;
use crate::noise::NoiseSchedule;
use crate::sampler::NoisePredictor;

const BLOCK: usize = 8;

/// 8x8 average-pool "VAE".
///
/// Latent channels 0..3 are the block means of R, G, B; channel 3 is their
/// mean. Decoding repeats each block mean over its 8x8 block, so images that
/// are constant on 8x8 blocks survive a round trip exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockCodec;

impl LatentCodec for BlockCodec {
    fn encode(&self, image: &Tensor) -> Result<Tensor> {
        let pooled = image.avg_pool2d(BLOCK)?;
        let luma = pooled.mean_keepdim(1)?;
        Ok(Tensor::cat(&[&pooled, &luma], 1)?)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = latents.dims4()?;
        Ok(latents
            .narrow(1, 0, 3)?
            .upsample_nearest2d(h * BLOCK, w * BLOCK)?)
    }
}

/// Returns all-zero embeddings of a fixed shape.
#[derive(Debug, Clone)]
pub struct ZeroPromptEncoder {
    seq_len: usize,
    hidden: usize,
    device: Device,
}

impl ZeroPromptEncoder {
    pub fn new(seq_len: usize, hidden: usize, device: Device) -> Self {
        Self {
            seq_len,
            hidden,
            device,
        }
    }
}

impl PromptEncoder for ZeroPromptEncoder {
    fn encode_prompt(&mut self, _prompt: &str) -> Result<Tensor> {
        Ok(Tensor::zeros(
            (1, self.seq_len, self.hidden),
            DType::F32,
            &self.device,
        )?)
    }
}

/// Predicts no noise; each DDIM step only rescales the latent.
#[derive(Debug, Clone, Default)]
pub struct ZeroPredictor {
    pub loaded: Vec<ControlMode>,
    pub calls: usize,
}

impl ControlWeights for ZeroPredictor {
    fn load_control(&mut self, mode: ControlMode) -> Result<()> {
        self.loaded.push(mode);
        Ok(())
    }
}

impl NoisePredictor for ZeroPredictor {
    fn predict_noise(
        &mut self,
        latents: &Tensor,
        _timestep: usize,
        _text_embeddings: &Tensor,
        _control: &Tensor,
        _control_scales: &[f64],
    ) -> Result<Tensor> {
        self.calls += 1;
        Ok(latents.zeros_like()?)
    }
}

/// Predicts exactly the noise separating the input from a known clean latent,
/// so every DDIM step estimates `clean` as its `x0`.
#[derive(Debug, Clone)]
pub struct OraclePredictor {
    clean: Tensor,
    schedule: NoiseSchedule,
    pub loaded: Vec<ControlMode>,
    pub calls: usize,
}

impl OraclePredictor {
    pub fn new(clean: Tensor, schedule: NoiseSchedule) -> Self {
        Self {
            clean,
            schedule,
            loaded: Vec::new(),
            calls: 0,
        }
    }
}

impl ControlWeights for OraclePredictor {
    fn load_control(&mut self, mode: ControlMode) -> Result<()> {
        self.loaded.push(mode);
        Ok(())
    }
}

impl NoisePredictor for OraclePredictor {
    fn predict_noise(
        &mut self,
        latents: &Tensor,
        timestep: usize,
        _text_embeddings: &Tensor,
        _control: &Tensor,
        _control_scales: &[f64],
    ) -> Result<Tensor> {
        self.calls += 1;
        let clean = self
            .clean
            .to_dtype(latents.dtype())?
            .broadcast_as(latents.shape())?;
        let a = self.schedule.alpha_cumprod(timestep);
        Ok(latents
            .sub(&clean.affine(a.sqrt(), 0.0)?)?
            .affine(1.0 / (1.0 - a).sqrt(), 0.0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{image_to_tensor, tensor_to_image};
    use image::RgbImage;

    #[test]
    fn test_block_codec_roundtrips_blocky_images() -> Result<()> {
        let image = RgbImage::from_fn(32, 16, |x, y| {
            let v = ((x / 8) * 60 + (y / 8) * 30) as u8;
            image::Rgb([v, 255 - v, 128])
        });
        let codec = BlockCodec;
        let pixels = image_to_tensor(&image, &Device::Cpu, DType::F32)?;
        let latents = codec.encode(&pixels)?;
        assert_eq!(latents.dims(), &[1, 4, 2, 4]);
        let back = tensor_to_image(&codec.decode(&latents)?)?;
        for (a, b) in image.pixels().zip(back.pixels()) {
            for c in 0..3 {
                assert!((a.0[c] as i32 - b.0[c] as i32).abs() <= 1);
            }
        }
        Ok(())
    }
}
