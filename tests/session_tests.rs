//! End-to-end blend session tests with stub models

use std::cell::Cell;
use std::rc::Rc;

use candle_core::{DType, Device, Tensor};
use candle_morph::control::ControlWeights;
use candle_morph::denoiser::{ConditionalDenoiser, LatentCodec};
use candle_morph::io::{image_to_tensor, prepare_output_dir};
use candle_morph::pose::KeypointPoseExtractor;
use candle_morph::sampler::NoisePredictor;
use candle_morph::stub::{BlockCodec, OraclePredictor, ZeroPredictor, ZeroPromptEncoder};
use candle_morph::utils::Pcg32;
use candle_morph::{
    BlendConfig, BlendError, BlendSession, ControlMode, ControlState, Keypoint, NoiseSchedule, Pose,
    Result,
};
use image::RgbImage;

/// 16x16 image made of four flat 8x8 blocks.
fn blocky_image() -> RgbImage {
    RgbImage::from_fn(16, 16, |x, y| match (x / 8, y / 8) {
        (0, 0) => image::Rgb([200, 40, 40]),
        (1, 0) => image::Rgb([40, 200, 40]),
        (0, 1) => image::Rgb([40, 40, 200]),
        _ => image::Rgb([220, 220, 220]),
    })
}

/// Zero predictor that reports its call count through a shared cell.
struct CountingPredictor {
    calls: Rc<Cell<usize>>,
}

impl ControlWeights for CountingPredictor {
    fn load_control(&mut self, _mode: ControlMode) -> Result<()> {
        Ok(())
    }
}

impl NoisePredictor for CountingPredictor {
    fn predict_noise(
        &mut self,
        latents: &Tensor,
        _timestep: usize,
        _text_embeddings: &Tensor,
        _control: &Tensor,
        _control_scales: &[f64],
    ) -> Result<Tensor> {
        self.calls.set(self.calls.get() + 1);
        Ok(latents.zeros_like()?)
    }
}

fn session(config: BlendConfig, predictor: Box<dyn NoisePredictor>) -> Result<BlendSession<'static>> {
    let denoiser = ConditionalDenoiser::new(
        Box::new(BlockCodec),
        Box::new(ZeroPromptEncoder::new(4, 8, Device::Cpu)),
        predictor,
        NoiseSchedule::default(),
        Box::new(Pcg32::from_seed(config.seed)),
        Device::Cpu,
        DType::F32,
    );
    BlendSession::new(config, denoiser)
}

fn counting_session(config: BlendConfig) -> Result<(BlendSession<'static>, Rc<Cell<usize>>)> {
    let calls = Rc::new(Cell::new(0));
    let predictor = CountingPredictor { calls: calls.clone() };
    Ok((session(config, Box::new(predictor))?, calls))
}

fn small_config(dir: &std::path::Path) -> Result<BlendConfig> {
    Ok(BlendConfig::new(1, 2, dir)?.with_resolution(16, 16))
}

fn standing_pose(x: f32) -> Pose {
    let mut pose = Pose::default();
    pose.set(candle_morph::pose::Joint::Neck, Some(Keypoint::new(x, 4.0)));
    pose.set(candle_morph::pose::Joint::RightHip, Some(Keypoint::new(x, 12.0)));
    pose
}

#[test]
fn test_identical_endpoints_reproduce_the_image() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let out = tmp.path().join("blend");
    let config = BlendConfig::new(25, 50, &out)?.with_resolution(16, 16);

    let image = blocky_image();
    let pixels = image_to_tensor(&image, &Device::Cpu, DType::F32)?;
    let clean = BlockCodec.encode(&pixels)?;
    let oracle = OraclePredictor::new(clean, NoiseSchedule::default());

    let mut session = session(config, Box::new(oracle))?;
    let pose = standing_pose(8.0);
    let outcome = session.interpolate_pose(&image, &pose, &image, &pose, "a dancer", "")?;

    assert_eq!(outcome.order, vec![2, 1, 3]);
    for name in ["01.png", "02.png", "03.png"] {
        let frame = image::open(out.join(name))?.to_rgb8();
        assert_eq!(frame.dimensions(), (16, 16));
        let total: u64 = frame
            .pixels()
            .zip(image.pixels())
            .flat_map(|(a, b)| (0..3).map(move |c| (a.0[c] as i64 - b.0[c] as i64).unsigned_abs()))
            .sum();
        let mean = total as f64 / (16.0 * 16.0 * 3.0);
        assert!(mean < 10.0, "{name}: mean abs diff {mean}");
    }
    Ok(())
}

#[test]
fn test_repeated_img2img_in_one_mode_reloads_once() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut session = session(small_config(tmp.path())?, Box::new(ZeroPredictor::default()))?;
    let control = RgbImage::new(16, 16);
    let latent = Tensor::zeros((1, 4, 2, 2), DType::F32, &Device::Cpu)?;

    for _ in 0..4 {
        session.img2img(Some(ControlMode::Pose), &control, "p", "n", &latent)?;
    }
    assert_eq!(session.control().reloads(), 1);
    assert_eq!(session.control().state(), ControlState::Active(ControlMode::Pose));

    // No mode given: the active one is reused.
    session.img2img(None, &control, "p", "n", &latent)?;
    assert_eq!(session.control().reloads(), 1);

    session.img2img(Some(ControlMode::Canny), &control, "p", "n", &latent)?;
    assert_eq!(session.control().reloads(), 2);
    Ok(())
}

#[test]
fn test_img2img_without_mode_fails() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut session = session(small_config(tmp.path())?, Box::new(ZeroPredictor::default()))?;
    let control = RgbImage::new(16, 16);
    let latent = Tensor::zeros((1, 4, 2, 2), DType::F32, &Device::Cpu)?;

    let result = session.img2img(None, &control, "p", "n", &latent);
    assert!(matches!(result, Err(BlendError::ModeNotSet)));
    assert_eq!(session.control().state(), ControlState::Unset);
    assert_eq!(session.control().reloads(), 0);

    let result = session.generate(None, &control, "p", "n", 1);
    assert!(matches!(result, Err(BlendError::ModeNotSet)));
    Ok(())
}

#[test]
fn test_interpolation_clears_previous_output() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let out = tmp.path().join("blend");
    std::fs::create_dir_all(&out)?;
    std::fs::write(out.join("99.png"), b"stale")?;

    let mut session = session(small_config(&out)?, Box::new(ZeroPredictor::default()))?;
    let image = blocky_image();
    session.interpolate_pose(&image, &standing_pose(4.0), &image, &standing_pose(12.0), "p", "n")?;

    assert!(!out.join("99.png").exists());
    let mut names = Vec::new();
    for entry in std::fs::read_dir(&out)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    assert_eq!(names, vec!["01.png", "02.png", "03.png"]);
    assert_eq!(session.control().state(), ControlState::Active(ControlMode::Pose));
    Ok(())
}

#[test]
fn test_output_path_that_is_a_file_aborts_before_denoising() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let out = tmp.path().join("blend");
    std::fs::write(&out, b"occupied")?;

    assert!(matches!(
        prepare_output_dir(&out),
        Err(BlendError::OutputDirectoryError { .. })
    ));

    let (mut session, calls) = counting_session(small_config(&out)?)?;
    let image = blocky_image();
    let pose = standing_pose(8.0);
    let result = session.interpolate_pose(&image, &pose, &image, &pose, "p", "n");

    assert!(matches!(result, Err(BlendError::OutputDirectoryError { .. })));
    assert_eq!(calls.get(), 0);
    assert_eq!(session.control().reloads(), 0);
    assert_eq!(session.control().state(), ControlState::Unset);
    Ok(())
}

#[test]
fn test_generate_and_img2img_from_image() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut session = session(small_config(tmp.path())?, Box::new(ZeroPredictor::default()))?;
    let control = RgbImage::new(16, 16);

    let frames = session.generate(Some(ControlMode::Canny), &control, "p", "n", 2)?;
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| f.dimensions() == (16, 16)));

    let frame = session.img2img_from_image(None, &control, "p", "n", &blocky_image())?;
    assert_eq!(frame.dimensions(), (16, 16));
    assert_eq!(session.control().reloads(), 1);
    Ok(())
}

#[test]
fn test_generate_zero_samples_returns_no_frames() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (mut session, calls) = counting_session(small_config(tmp.path())?)?;
    let control = RgbImage::new(16, 16);

    let frames = session.generate(Some(ControlMode::Pose), &control, "p", "n", 0)?;
    assert!(frames.is_empty());
    assert_eq!(calls.get(), 0);
    Ok(())
}

#[test]
fn test_extractor_helpers_switch_mode() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut session = session(small_config(tmp.path())?, Box::new(ZeroPredictor::default()))?;
    let image = blocky_image();

    let edges = session.get_canny(&image, 220.0, 255.0)?;
    assert_eq!(edges.dimensions(), (16, 16));
    assert_eq!(session.control().state(), ControlState::Active(ControlMode::Canny));

    let pose = standing_pose(8.0);
    session.register_extractor(ControlMode::Pose, Box::new(KeypointPoseExtractor::new(pose.clone())));
    let out = session.get_pose(&image)?;
    assert_eq!(out.pose, Some(pose));
    assert_eq!(session.control().state(), ControlState::Active(ControlMode::Pose));
    Ok(())
}

#[test]
fn test_missing_extractor_leaves_mode_untouched() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut session = session(small_config(tmp.path())?, Box::new(ZeroPredictor::default()))?;
    let image = blocky_image();

    assert!(matches!(
        session.get_pose(&image),
        Err(BlendError::ExtractorUnavailable(ControlMode::Pose))
    ));
    assert_eq!(session.control().state(), ControlState::Unset);
    assert_eq!(session.control().reloads(), 0);

    session.get_canny(&image, 100.0, 200.0)?;
    assert!(session.extract(ControlMode::Segmentation, &image).is_err());
    assert_eq!(session.control().state(), ControlState::Active(ControlMode::Canny));
    assert_eq!(session.control().reloads(), 1);
    Ok(())
}
