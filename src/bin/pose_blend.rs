//! Pose Blend: synthesize the frames between two posed images.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin pose_blend -- \
//!     --image-a a.png --pose-a a.json \
//!     --image-b b.png --pose-b b.json \
//!     --prompt "a dancer, studio lighting" \
//!     --model-dir ./stable-diffusion-v1-5 \
//!     --control-weights ./control_sd15_openpose.safetensors
//! ```
//!
//! Pose files are JSON arrays of 18 OpenPose-ordered joints, each
//! `{"x": .., "y": ..}` in pixels of the output resolution, or `null`.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use clap::Parser;
use tracing::{info, warn};

use candle_morph::{
    BlendConfig, BlendSession, ControlMode, NoiseSchedule, Pose,
    denoiser::ConditionalDenoiser,
    io::load_rgb,
    models::stable_diffusion::{Sd15Paths, build_denoiser},
    pose::KeypointPoseExtractor,
    stub::{BlockCodec, ZeroPredictor, ZeroPromptEncoder},
    utils::Pcg32,
};

const DEFAULT_NEGATIVE_PROMPT: &str = "long body, lowres, bad anatomy, bad hands, missing fingers, extra digit, fewer digits, cropped, bad art, poorly drawn, low quality";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Interpolate between two posed images with pose-conditioned diffusion"
)]
struct Args {
    /// First endpoint image
    #[arg(long)]
    image_a: PathBuf,

    /// Second endpoint image
    #[arg(long)]
    image_b: PathBuf,

    /// Keypoints of the first image (JSON)
    #[arg(long)]
    pose_a: PathBuf,

    /// Keypoints of the second image (JSON)
    #[arg(long)]
    pose_b: PathBuf,

    #[arg(short, long)]
    prompt: String,

    #[arg(long, default_value = DEFAULT_NEGATIVE_PROMPT)]
    negative_prompt: String,

    /// JSON blend configuration; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    steps_per_frame: Option<usize>,

    #[arg(long)]
    ddim_steps: Option<usize>,

    #[arg(long)]
    guidance_scale: Option<f64>,

    #[arg(long)]
    control_strength: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    /// Output directory (cleared before frames are written)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Stable Diffusion 1.5 directory in diffusers layout; downloaded when omitted
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// OpenPose ControlNet checkpoint (safetensors)
    #[arg(long)]
    control_weights: Option<PathBuf>,

    /// Also write the endpoint pose maps next to the frames
    #[arg(long)]
    save_controls: bool,

    /// Use CPU instead of CUDA
    #[arg(long)]
    cpu: bool,

    /// Use float16 precision
    #[arg(long)]
    f16: bool,

    /// Run with stub models (no weights needed)
    #[arg(long)]
    mock: bool,
}

fn build_config(args: &Args) -> Result<BlendConfig> {
    let mut config = match &args.config {
        Some(path) => BlendConfig::from_json_file(path)?,
        None => BlendConfig::default(),
    };
    if let Some(v) = args.steps_per_frame {
        config.steps_per_frame = v;
    }
    if let Some(v) = args.ddim_steps {
        config.ddim_steps = v;
    }
    if let Some(v) = args.guidance_scale {
        config.guidance_scale = v;
    }
    if let Some(v) = args.control_strength {
        config.control_strength = v;
    }
    if let Some(v) = args.seed {
        config.seed = v;
    }
    if let Some(dir) = &args.output {
        config.output_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_morph=info".parse()?)
                .add_directive("pose_blend=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = build_config(&args).context("Invalid blend configuration")?;

    info!("Pose Blend");
    info!("Prompt: {}", args.prompt);
    info!(
        "{}x{}, {} levels, {} frames",
        config.width,
        config.height,
        config.levels(),
        (1usize << config.levels()) + 1
    );

    let device = if args.cpu {
        info!("Using CPU");
        Device::Cpu
    } else {
        match Device::cuda_if_available(0) {
            Ok(device) => device,
            Err(e) => {
                warn!("CUDA not available: {}, falling back to CPU", e);
                Device::Cpu
            }
        }
    };
    let dtype = if args.f16 && !args.mock { DType::F16 } else { DType::F32 };

    let image_a = load_rgb(&args.image_a, config.width, config.height)
        .with_context(|| format!("Failed to load {}", args.image_a.display()))?;
    let image_b = load_rgb(&args.image_b, config.width, config.height)
        .with_context(|| format!("Failed to load {}", args.image_b.display()))?;
    let pose_a = Pose::from_json_file(&args.pose_a).context("Failed to read pose A")?;
    let pose_b = Pose::from_json_file(&args.pose_b).context("Failed to read pose B")?;

    let schedule = NoiseSchedule::default();
    let noise = Box::new(Pcg32::from_seed(config.seed));
    let denoiser = if args.mock {
        info!("Running in mock mode (no model loading)");
        ConditionalDenoiser::new(
            Box::new(BlockCodec),
            Box::new(ZeroPromptEncoder::new(77, 768, device.clone())),
            Box::new(ZeroPredictor::default()),
            schedule,
            noise,
            device.clone(),
            dtype,
        )
    } else {
        let paths = match &args.model_dir {
            Some(dir) => Sd15Paths::from_dir(dir)?,
            None => Sd15Paths::download()?,
        };
        let mut control_weights = HashMap::new();
        if let Some(path) = &args.control_weights {
            control_weights.insert(ControlMode::Pose, path.clone());
        }
        build_denoiser(&paths, &config, control_weights, schedule, noise, &device, dtype)
            .context("Failed to load Stable Diffusion weights")?
    };

    let output_dir = config.output_dir.clone();
    let mut session = BlendSession::new(config, denoiser)?;
    let start = std::time::Instant::now();
    let outcome = session.interpolate_pose(
        &image_a,
        &pose_a,
        &image_b,
        &pose_b,
        &args.prompt,
        &args.negative_prompt,
    )?;
    info!(
        "Synthesized {} frames in {:.2}s",
        outcome.order.len(),
        start.elapsed().as_secs_f64()
    );

    if args.save_controls {
        for (name, image, pose) in [("pose_a", &image_a, &pose_a), ("pose_b", &image_b, &pose_b)] {
            session.register_extractor(ControlMode::Pose, Box::new(KeypointPoseExtractor::new(pose.clone())));
            let control = session.get_pose(image)?;
            control.map.save(output_dir.join(format!("{name}.png")))?;
        }
    }

    info!("Frames saved to {}/", output_dir.display());
    Ok(())
}
