//! Image loading, frame persistence and output-directory handling.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, IndexOp, Tensor};
use image::RgbImage;
use tracing::info;

use crate::error::{BlendError, Result};

/// Load an image, resize it and convert it to RGB.
pub fn load_rgb(path: impl AsRef<Path>, width: usize, height: usize) -> Result<RgbImage> {
    let img = image::open(path)?;
    Ok(img
        .resize_exact(width as u32, height as u32, image::imageops::FilterType::Lanczos3)
        .to_rgb8())
}

/// RGB image -> `[1, 3, H, W]` tensor in `[-1, 1]`.
pub fn image_to_tensor(image: &RgbImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let (w, h) = image.dimensions();
    let tensor = Tensor::from_vec(image.as_raw().clone(), (h as usize, w as usize, 3), device)?
        .permute((2, 0, 1))?
        .unsqueeze(0)?
        .to_dtype(DType::F32)?
        .affine(1.0 / 127.5, -1.0)?
        .to_dtype(dtype)?;
    Ok(tensor)
}

/// `[1, 3, H, W]` or `[3, H, W]` tensor in `[-1, 1]` -> RGB image.
pub fn tensor_to_image(tensor: &Tensor) -> Result<RgbImage> {
    let tensor = match tensor.rank() {
        4 => tensor.i(0)?,
        _ => tensor.clone(),
    };
    let (_, h, w) = tensor.dims3()?;
    let pixels: Vec<u8> = tensor
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .affine(127.5, 127.5)?
        .clamp(0f32, 255f32)?
        .to_dtype(DType::U8)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1()?;
    RgbImage::from_raw(w as u32, h as u32, pixels)
        .ok_or_else(|| candle_core::Error::Msg("decoded frame has wrong size".to_string()).into())
}

/// Remove and recreate the session output directory.
pub fn prepare_output_dir(dir: &Path) -> Result<()> {
    let wrap = |source| BlendError::OutputDirectoryError {
        path: dir.to_path_buf(),
        source,
    };
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(wrap(e)),
    }
    std::fs::create_dir_all(dir).map_err(wrap)?;
    info!(dir = %dir.display(), "prepared output directory");
    Ok(())
}

/// Zero padding wide enough for the largest slot index, at least two digits.
pub fn frame_index_width(total_frames: usize) -> usize {
    total_frames.saturating_sub(1).max(1).to_string().len().max(2)
}

pub fn frame_path(dir: &Path, index: usize, total_frames: usize) -> PathBuf {
    let width = frame_index_width(total_frames);
    dir.join(format!("{index:0width$}.png"))
}

/// Write a frame as `<dir>/<zero-padded index>.png`.
pub fn save_frame(dir: &Path, index: usize, total_frames: usize, frame: &RgbImage) -> Result<PathBuf> {
    let path = frame_path(dir, index, total_frames);
    frame.save(&path)?;
    Ok(path)
}
