//! Blend session: conditioning-mode state, the denoiser and the frame schedule.

use candle_core::Tensor;
use image::{RgbImage, imageops};
use tracing::info;

use crate::canny::CannyDetector;
use crate::config::BlendConfig;
use crate::control::{ControlContext, ControlMode, ControlOutput, FeatureExtractor};
use crate::denoiser::ConditionalDenoiser;
use crate::error::Result;
use crate::frame_scheduler::{BlendOutcome, FrameRenderer, FrameSchedule, FrameScheduler, SlotTask};
use crate::io::prepare_output_dir;
use crate::ladder::LatentStackBuilder;
use crate::pose::Pose;

/// Extractors the crate can build without external networks.
pub fn builtin_extractors(mode: ControlMode) -> Option<Box<dyn FeatureExtractor>> {
    match mode {
        ControlMode::Canny => Some(Box::new(CannyDetector::default())),
        ControlMode::Pose | ControlMode::Segmentation => None,
    }
}

pub struct BlendSession<'a> {
    config: BlendConfig,
    control: ControlContext,
    denoiser: ConditionalDenoiser<'a>,
}

impl<'a> BlendSession<'a> {
    pub fn new(config: BlendConfig, denoiser: ConditionalDenoiser<'a>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            control: ControlContext::new(builtin_extractors),
            denoiser,
        })
    }

    pub fn config(&self) -> &BlendConfig {
        &self.config
    }

    pub fn control(&self) -> &ControlContext {
        &self.control
    }

    pub fn denoiser_mut(&mut self) -> &mut ConditionalDenoiser<'a> {
        &mut self.denoiser
    }

    /// Install an extractor for `mode` (pose and segmentation have no built-in one).
    pub fn register_extractor(&mut self, mode: ControlMode, extractor: Box<dyn FeatureExtractor>) {
        self.control.register(mode, extractor);
    }

    /// Switch the conditioning mode; returns whether weights were reloaded.
    pub fn change_mode(&mut self, mode: ControlMode) -> Result<bool> {
        self.control.enter(mode, &mut self.denoiser)
    }

    /// Enter `mode` if given, otherwise require that a mode is already active.
    fn resolve_mode(&mut self, mode: Option<ControlMode>) -> Result<ControlMode> {
        match mode {
            Some(mode) => {
                self.change_mode(mode)?;
                Ok(mode)
            }
            None => self.control.active_mode(),
        }
    }

    /// Run the extractor for `mode` on `image`, switching mode first.
    ///
    /// A mode without an extractor fails before any weights are reloaded.
    pub fn extract(&mut self, mode: ControlMode, image: &RgbImage) -> Result<ControlOutput> {
        self.control.extractor(mode)?;
        self.change_mode(mode)?;
        self.control.extractor(mode)?.extract(image)
    }

    /// Pose control map and keypoints for `image`.
    pub fn get_pose(&mut self, image: &RgbImage) -> Result<ControlOutput> {
        self.extract(ControlMode::Pose, image)
    }

    /// Edge control map with explicit hysteresis thresholds.
    pub fn get_canny(&mut self, image: &RgbImage, low_threshold: f32, high_threshold: f32) -> Result<RgbImage> {
        self.change_mode(ControlMode::Canny)?;
        let mut detector = CannyDetector::new(low_threshold, high_threshold);
        Ok(detector.extract(image)?.map)
    }

    /// img2img from a prepared latent with the session's knobs.
    ///
    /// Fails with `ModeNotSet` when `mode` is `None` and no mode was entered.
    pub fn img2img(
        &mut self,
        mode: Option<ControlMode>,
        control_map: &RgbImage,
        prompt: &str,
        negative_prompt: &str,
        starting_latent: &Tensor,
    ) -> Result<RgbImage> {
        self.resolve_mode(mode)?;
        let c = &self.config;
        self.denoiser.img2img(
            control_map,
            prompt,
            negative_prompt,
            starting_latent,
            c.control_strength,
            c.guidance_scale,
            c.ddim_steps,
            c.time_fraction,
        )
    }

    /// img2img from an RGB init image.
    pub fn img2img_from_image(
        &mut self,
        mode: Option<ControlMode>,
        control_map: &RgbImage,
        prompt: &str,
        negative_prompt: &str,
        init_image: &RgbImage,
    ) -> Result<RgbImage> {
        self.resolve_mode(mode)?;
        let init_image = self.fit_to_output(init_image);
        let c = &self.config;
        self.denoiser.img2img_from_image(
            control_map,
            prompt,
            negative_prompt,
            &init_image,
            c.control_strength,
            c.guidance_scale,
            c.ddim_steps,
            c.time_fraction,
        )
    }

    /// Generate `num_samples` images from noise under the control map.
    pub fn generate(
        &mut self,
        mode: Option<ControlMode>,
        control_map: &RgbImage,
        prompt: &str,
        negative_prompt: &str,
        num_samples: usize,
    ) -> Result<Vec<RgbImage>> {
        self.resolve_mode(mode)?;
        let c = &self.config;
        self.denoiser.generate(
            control_map,
            prompt,
            negative_prompt,
            num_samples,
            c.guidance_scale,
            c.ddim_steps,
            c.control_strength,
        )
    }

    /// Synthesize the in-between frames of a pose transition.
    ///
    /// The output directory is cleared before any weights are loaded. Frames
    /// are written as `<output_dir>/NN.png` keyed by timeline slot; the
    /// endpoint slots are not written.
    pub fn interpolate_pose(
        &mut self,
        image_a: &RgbImage,
        pose_a: &Pose,
        image_b: &RgbImage,
        pose_b: &Pose,
        prompt: &str,
        negative_prompt: &str,
    ) -> Result<BlendOutcome> {
        prepare_output_dir(&self.config.output_dir)?;
        self.change_mode(ControlMode::Pose)?;

        let image_a = self.fit_to_output(image_a);
        let image_b = self.fit_to_output(image_b);
        let latent_a = self.denoiser.encode_image(&image_a)?;
        let latent_b = self.denoiser.encode_image(&image_b)?;

        let frame_schedule = FrameSchedule::from_config(&self.config);
        info!(
            levels = frame_schedule.levels(),
            total_frames = frame_schedule.total_frames(),
            ladder_rungs = frame_schedule.num_frames(),
            "interpolating pose"
        );

        let schedule = self.denoiser.schedule().clone();
        let builder = LatentStackBuilder::new(&schedule, self.config.ladder_stride);
        let (ladder_a, ladder_b) = builder.build(
            &latent_a,
            &latent_b,
            frame_schedule.num_frames(),
            self.denoiser.noise_source(),
        )?;

        let scheduler = FrameScheduler::new(&self.config);
        let mut renderer = SessionRenderer {
            denoiser: &mut self.denoiser,
            config: &self.config,
            prompt,
            negative_prompt,
        };
        let outcome = scheduler.run(&ladder_a, &ladder_b, pose_a, pose_b, &mut renderer)?;
        info!(frames = outcome.order.len(), dir = %self.config.output_dir.display(), "blend complete");
        Ok(outcome)
    }

    fn fit_to_output(&self, image: &RgbImage) -> RgbImage {
        let (w, h) = (self.config.width as u32, self.config.height as u32);
        if image.dimensions() == (w, h) {
            image.clone()
        } else {
            imageops::resize(image, w, h, imageops::FilterType::Lanczos3)
        }
    }
}

/// Feeds scheduler slots through the session's denoiser.
struct SessionRenderer<'s, 'a> {
    denoiser: &'s mut ConditionalDenoiser<'a>,
    config: &'s BlendConfig,
    prompt: &'s str,
    negative_prompt: &'s str,
}

impl FrameRenderer for SessionRenderer<'_, '_> {
    fn render_frame(&mut self, _task: &SlotTask, prior: &Tensor, control: &RgbImage) -> Result<RgbImage> {
        let c = self.config;
        self.denoiser.img2img(
            control,
            self.prompt,
            self.negative_prompt,
            prior,
            c.control_strength,
            c.guidance_scale,
            c.ddim_steps,
            c.time_fraction,
        )
    }
}
