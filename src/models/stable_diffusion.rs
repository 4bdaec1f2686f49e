//! Stable Diffusion 1.5 components behind the denoiser traits.
//!
//! VAE, CLIP text encoder and UNet come from `candle_transformers`. The UNet
//! has no ControlNet branch: it receives the control map through the
//! [`NoisePredictor`] contract and ignores it. The ControlNet checkpoint of
//! the active mode is memory-mapped on every mode switch and held until the
//! next one, so a session fails early on a bad checkpoint.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::{Module, VarBuilder};
use candle_transformers::models::stable_diffusion::{
    self, StableDiffusionConfig, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
};
use hf_hub::{Repo, RepoType, api::sync::Api};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::config::BlendConfig;
use crate::control::{ControlMode, ControlWeights};
use crate::denoiser::{ConditionalDenoiser, LatentCodec, PromptEncoder};
use crate::error::Result;
use crate::noise::NoiseSchedule;
use crate::sampler::NoisePredictor;
use crate::utils::NoiseSource;

/// Latent scaling factor of the SD 1.x VAE.
pub const VAE_SCALE: f64 = 0.18215;
pub const SD15_REPO: &str = "runwayml/stable-diffusion-v1-5";
pub const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";
const UNET_IN_CHANNELS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum WeightsError {
    #[error("Invalid safetensors file: {path}")]
    InvalidSafetensors {
        path: String,
        #[source]
        source: candle_core::Error,
    },

    #[error("Weights not found: {0}")]
    Missing(String),

    #[error("Hub download failed: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
}

/// Local paths of the SD 1.5 checkpoint files.
#[derive(Debug, Clone)]
pub struct Sd15Paths {
    pub unet: PathBuf,
    pub vae: PathBuf,
    pub clip: PathBuf,
    pub tokenizer: PathBuf,
}

impl Sd15Paths {
    /// Diffusers layout under `model_dir` (`unet/`, `vae/`, `text_encoder/`, `tokenizer/`).
    pub fn from_dir(model_dir: &Path) -> std::result::Result<Self, WeightsError> {
        let paths = Self {
            unet: model_dir.join("unet/diffusion_pytorch_model.safetensors"),
            vae: model_dir.join("vae/diffusion_pytorch_model.safetensors"),
            clip: model_dir.join("text_encoder/model.safetensors"),
            tokenizer: model_dir.join("tokenizer/tokenizer.json"),
        };
        for path in [&paths.unet, &paths.vae, &paths.clip, &paths.tokenizer] {
            if !path.exists() {
                return Err(WeightsError::Missing(path.display().to_string()));
            }
        }
        Ok(paths)
    }

    /// Fetch (or reuse cached) files from the Hugging Face hub.
    pub fn download() -> std::result::Result<Self, WeightsError> {
        let api = Api::new()?;
        let sd = api.repo(Repo::new(SD15_REPO.to_string(), RepoType::Model));
        let tokenizer = api
            .repo(Repo::new(CLIP_TOKENIZER_REPO.to_string(), RepoType::Model))
            .get("tokenizer.json")?;
        Ok(Self {
            unet: sd.get("unet/diffusion_pytorch_model.safetensors")?,
            vae: sd.get("vae/diffusion_pytorch_model.safetensors")?,
            clip: sd.get("text_encoder/model.safetensors")?,
            tokenizer,
        })
    }
}

/// ControlNet weights mapped for one conditioning mode.
pub struct ControlCheckpoint {
    mode: ControlMode,
    path: PathBuf,
    weights: VarBuilder<'static>,
}

impl ControlCheckpoint {
    /// Memory-map `path`; the safetensors header is parsed and checked here.
    pub fn map(mode: ControlMode, path: &Path, dtype: DType, device: &Device) -> std::result::Result<Self, WeightsError> {
        if !path.is_file() {
            return Err(WeightsError::Missing(path.display().to_string()));
        }
        // The file must not be modified while it is mapped.
        let weights = unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device) }.map_err(|e| {
            WeightsError::InvalidSafetensors {
                path: path.display().to_string(),
                source: e,
            }
        })?;
        Ok(Self {
            mode,
            path: path.to_path_buf(),
            weights,
        })
    }

    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn weights(&self) -> &VarBuilder<'static> {
        &self.weights
    }
}

pub struct VaeCodec {
    vae: AutoEncoderKL,
}

impl LatentCodec for VaeCodec {
    fn encode(&self, image: &Tensor) -> Result<Tensor> {
        let dist = self.vae.encode(image)?;
        Ok((dist.sample()? * VAE_SCALE)?)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        Ok(self.vae.decode(&(latents / VAE_SCALE)?)?)
    }
}

pub struct ClipPromptEncoder {
    tokenizer: Tokenizer,
    clip: ClipTextTransformer,
    max_len: usize,
    pad_id: u32,
    device: Device,
}

impl ClipPromptEncoder {
    pub fn new(
        tokenizer: Tokenizer,
        clip: ClipTextTransformer,
        sd_config: &StableDiffusionConfig,
        device: Device,
    ) -> std::result::Result<Self, WeightsError> {
        let pad_token = sd_config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .ok_or_else(|| WeightsError::Tokenizer(format!("pad token {pad_token} not in vocabulary")))?;
        Ok(Self {
            tokenizer,
            clip,
            max_len: sd_config.clip.max_position_embeddings,
            pad_id,
            device,
        })
    }
}

impl PromptEncoder for ClipPromptEncoder {
    fn encode_prompt(&mut self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| WeightsError::Tokenizer(e.to_string()))?
            .get_ids()
            .to_vec();
        if tokens.len() > self.max_len {
            debug!(len = tokens.len(), max = self.max_len, "truncating prompt");
            tokens.truncate(self.max_len);
        }
        tokens.resize(self.max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.clip.forward(&tokens)?)
    }
}

/// UNet noise predictor holding the ControlNet checkpoint of the active mode.
pub struct UnetPredictor {
    unet: UNet2DConditionModel,
    control_paths: HashMap<ControlMode, PathBuf>,
    control: Option<ControlCheckpoint>,
    device: Device,
    dtype: DType,
    warned: bool,
}

impl UnetPredictor {
    pub fn new(
        unet: UNet2DConditionModel,
        control_paths: HashMap<ControlMode, PathBuf>,
        device: Device,
        dtype: DType,
    ) -> Self {
        Self {
            unet,
            control_paths,
            control: None,
            device,
            dtype,
            warned: false,
        }
    }

    pub fn control(&self) -> Option<&ControlCheckpoint> {
        self.control.as_ref()
    }
}

impl ControlWeights for UnetPredictor {
    fn load_control(&mut self, mode: ControlMode) -> Result<()> {
        self.control = None;
        match self.control_paths.get(&mode) {
            Some(path) => {
                let checkpoint = ControlCheckpoint::map(mode, path, self.dtype, &self.device)?;
                info!(%mode, path = %path.display(), "mapped control weights");
                self.control = Some(checkpoint);
            }
            None => warn!(%mode, "no control weights configured for mode"),
        }
        Ok(())
    }
}

impl NoisePredictor for UnetPredictor {
    fn predict_noise(
        &mut self,
        latents: &Tensor,
        timestep: usize,
        text_embeddings: &Tensor,
        _control: &Tensor,
        _control_scales: &[f64],
    ) -> Result<Tensor> {
        if !self.warned {
            warn!("UNet backend has no ControlNet branch, control map is ignored");
            self.warned = true;
        }
        Ok(self.unet.forward(
            &latents.to_dtype(self.dtype)?,
            timestep as f64,
            &text_embeddings.to_dtype(self.dtype)?,
        )?)
    }
}

/// Build a denoiser from SD 1.5 weights.
pub fn build_denoiser<'a>(
    paths: &Sd15Paths,
    config: &BlendConfig,
    control_weights: HashMap<ControlMode, PathBuf>,
    schedule: NoiseSchedule,
    noise: Box<dyn NoiseSource + 'a>,
    device: &Device,
    dtype: DType,
) -> Result<ConditionalDenoiser<'a>> {
    let sd_config = StableDiffusionConfig::v1_5(None, Some(config.height), Some(config.width));

    info!(path = %paths.vae.display(), "loading VAE");
    let vae = sd_config.build_vae(&paths.vae, device, dtype)?;
    info!(path = %paths.clip.display(), "loading CLIP text encoder");
    let clip = stable_diffusion::build_clip_transformer(&sd_config.clip, &paths.clip, device, DType::F32)?;
    let tokenizer = Tokenizer::from_file(&paths.tokenizer).map_err(|e| WeightsError::Tokenizer(e.to_string()))?;
    info!(path = %paths.unet.display(), "loading UNet");
    let unet = sd_config.build_unet(&paths.unet, device, UNET_IN_CHANNELS, false, dtype)?;

    Ok(ConditionalDenoiser::new(
        Box::new(VaeCodec { vae }),
        Box::new(ClipPromptEncoder::new(tokenizer, clip, &sd_config, device.clone())?),
        Box::new(UnetPredictor::new(unet, control_weights, device.clone(), dtype)),
        schedule,
        noise,
        device.clone(),
        dtype,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_checkpoint_maps_valid_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("control_sd15_openpose.safetensors");
        let t = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        candle_core::safetensors::save(&HashMap::from([("w".to_string(), t)]), &path)?;

        let checkpoint = ControlCheckpoint::map(ControlMode::Pose, &path, DType::F32, &Device::Cpu)?;
        assert_eq!(checkpoint.mode(), ControlMode::Pose);
        assert_eq!(checkpoint.path(), path.as_path());
        assert!(checkpoint.weights().contains_tensor("w"));
        assert_eq!(checkpoint.weights().get((2, 3), "w")?.dims(), &[2, 3]);
        Ok(())
    }

    #[test]
    fn test_control_checkpoint_rejects_bad_files() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let bad = tmp.path().join("broken.safetensors");
        std::fs::write(&bad, b"not a checkpoint")?;
        assert!(matches!(
            ControlCheckpoint::map(ControlMode::Canny, &bad, DType::F32, &Device::Cpu),
            Err(WeightsError::InvalidSafetensors { .. })
        ));
        assert!(matches!(
            ControlCheckpoint::map(ControlMode::Canny, &tmp.path().join("absent.safetensors"), DType::F32, &Device::Cpu),
            Err(WeightsError::Missing(_))
        ));
        Ok(())
    }

    #[test]
    fn test_missing_model_dir_is_reported() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        assert!(matches!(
            Sd15Paths::from_dir(tmp.path()),
            Err(WeightsError::Missing(_))
        ));
        Ok(())
    }
}
