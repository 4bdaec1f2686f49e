//! Canny edge detector producing edge control maps.

use image::{GrayImage, Luma, RgbImage, imageops};

use crate::control::{ControlOutput, FeatureExtractor};
use crate::error::Result;

const BLUR_SIGMA: f32 = 1.4;

#[derive(Debug, Clone, Copy)]
pub struct CannyDetector {
    pub low_threshold: f32,
    pub high_threshold: f32,
}

impl Default for CannyDetector {
    fn default() -> Self {
        Self {
            low_threshold: 100.0,
            high_threshold: 200.0,
        }
    }
}

impl CannyDetector {
    pub fn new(low_threshold: f32, high_threshold: f32) -> Self {
        Self {
            low_threshold: low_threshold.min(high_threshold),
            high_threshold: high_threshold.max(low_threshold),
        }
    }

    /// Binary edge map: 255 on edges, 0 elsewhere.
    pub fn detect(&self, image: &RgbImage) -> GrayImage {
        let gray = imageops::grayscale(image);
        let smoothed = imageops::blur(&gray, BLUR_SIGMA);
        let (w, h) = smoothed.dimensions();
        let (w, h) = (w as usize, h as usize);
        let mut edges = GrayImage::new(w as u32, h as u32);
        if w < 3 || h < 3 {
            return edges;
        }

        let px = |x: usize, y: usize| smoothed.get_pixel(x as u32, y as u32).0[0] as f32;
        let mut magnitude = vec![0f32; w * h];
        let mut direction = vec![0u8; w * h];
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let gx = px(x + 1, y - 1) + 2.0 * px(x + 1, y) + px(x + 1, y + 1)
                    - px(x - 1, y - 1)
                    - 2.0 * px(x - 1, y)
                    - px(x - 1, y + 1);
                let gy = px(x - 1, y + 1) + 2.0 * px(x, y + 1) + px(x + 1, y + 1)
                    - px(x - 1, y - 1)
                    - 2.0 * px(x, y - 1)
                    - px(x + 1, y - 1);
                magnitude[y * w + x] = gx.hypot(gy);
                direction[y * w + x] = quantize_direction(gy.atan2(gx));
            }
        }

        // Non-maximum suppression, then classify into strong/weak.
        let mut strength = vec![0u8; w * h];
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let i = y * w + x;
                let m = magnitude[i];
                let (a, b) = match direction[i] {
                    0 => (magnitude[i - 1], magnitude[i + 1]),
                    1 => (magnitude[i - w + 1], magnitude[i + w - 1]),
                    2 => (magnitude[i - w], magnitude[i + w]),
                    _ => (magnitude[i - w - 1], magnitude[i + w + 1]),
                };
                if m < a || m < b {
                    continue;
                }
                strength[i] = if m >= self.high_threshold {
                    2
                } else if m >= self.low_threshold {
                    1
                } else {
                    0
                };
            }
        }

        // Hysteresis: weak pixels survive when connected to a strong one.
        let mut stack: Vec<usize> = (0..w * h).filter(|&i| strength[i] == 2).collect();
        while let Some(i) = stack.pop() {
            let (x, y) = (i % w, i / w);
            edges.put_pixel(x as u32, y as u32, Luma([255]));
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let nx = x as i64 + dx;
                    let ny = y as i64 + dy;
                    if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                        continue;
                    }
                    let j = ny as usize * w + nx as usize;
                    if strength[j] == 1 {
                        strength[j] = 2;
                        stack.push(j);
                    }
                }
            }
        }
        edges
    }
}

/// Map a gradient angle to one of four neighbour axes (0°, 45°, 90°, 135°).
fn quantize_direction(angle: f32) -> u8 {
    let deg = angle.to_degrees().rem_euclid(180.0);
    if !(22.5..157.5).contains(&deg) {
        0
    } else if deg < 67.5 {
        1
    } else if deg < 112.5 {
        2
    } else {
        3
    }
}

impl FeatureExtractor for CannyDetector {
    fn extract(&mut self, image: &RgbImage) -> Result<ControlOutput> {
        let edges = self.detect(image);
        let map = RgbImage::from_fn(edges.width(), edges.height(), |x, y| {
            let v = edges.get_pixel(x, y).0[0];
            image::Rgb([v, v, v])
        });
        Ok(ControlOutput { map, pose: None })
    }
}
