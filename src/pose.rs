//! Keypoint poses: blending and control-map rasterization.
//!
//! Poses use the 18-joint OpenPose body layout. A joint is either detected
//! (`Some(Keypoint)`) or missing (`None`).

use candle_core::{DType, Device, Tensor};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::control::{ControlOutput, FeatureExtractor};
use crate::error::{BlendError, Result};

pub const NUM_JOINTS: usize = 18;

/// Joint slots in OpenPose body order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Joint {
    Nose = 0,
    Neck,
    RightShoulder,
    RightElbow,
    RightWrist,
    LeftShoulder,
    LeftElbow,
    LeftWrist,
    RightHip,
    RightKnee,
    RightAnkle,
    LeftHip,
    LeftKnee,
    LeftAnkle,
    RightEye,
    LeftEye,
    RightEar,
    LeftEar,
}

/// Limbs as pairs of joint indices, in drawing order.
pub const LIMBS: [(usize, usize); 17] = [
    (1, 2),
    (1, 5),
    (2, 3),
    (3, 4),
    (5, 6),
    (6, 7),
    (1, 8),
    (8, 9),
    (9, 10),
    (1, 11),
    (11, 12),
    (12, 13),
    (1, 0),
    (0, 14),
    (14, 16),
    (0, 15),
    (15, 17),
];

/// One color per joint; limb `i` reuses color `i`.
pub const COLORS: [[u8; 3]; NUM_JOINTS] = [
    [255, 0, 0],
    [255, 85, 0],
    [255, 170, 0],
    [255, 255, 0],
    [170, 255, 0],
    [85, 255, 0],
    [0, 255, 0],
    [0, 255, 85],
    [0, 255, 170],
    [0, 255, 255],
    [0, 170, 255],
    [0, 85, 255],
    [0, 0, 255],
    [85, 0, 255],
    [170, 0, 255],
    [255, 0, 255],
    [255, 0, 170],
    [255, 0, 85],
];

const JOINT_RADIUS: f32 = 4.0;
const LIMB_HALF_WIDTH: f32 = 4.0;
/// Limbs are drawn at 60% intensity, joints at full.
const LIMB_INTENSITY: f32 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// An 18-joint body pose in pixel coordinates.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pose {
    joints: [Option<Keypoint>; NUM_JOINTS],
}

impl Pose {
    pub fn new(joints: [Option<Keypoint>; NUM_JOINTS]) -> Self {
        Self { joints }
    }

    pub fn joint(&self, joint: Joint) -> Option<Keypoint> {
        self.joints[joint as usize]
    }

    pub fn joints(&self) -> &[Option<Keypoint>; NUM_JOINTS] {
        &self.joints
    }

    pub fn set(&mut self, joint: Joint, keypoint: Option<Keypoint>) {
        self.joints[joint as usize] = keypoint;
    }

    pub fn present_count(&self) -> usize {
        self.joints.iter().filter(|j| j.is_some()).count()
    }

    /// Import OpenPose detector metadata.
    ///
    /// `candidate` rows are `[x, y, score, id]`; `subset[i]` is the candidate
    /// index for joint `i` or a negative value when the joint was not found.
    pub fn from_openpose(candidate: &[[f32; 4]], subset: &[f32]) -> Result<Self> {
        if subset.len() < NUM_JOINTS {
            return Err(BlendError::InvalidPose(format!(
                "subset has {} entries, expected at least {NUM_JOINTS}",
                subset.len()
            )));
        }
        let mut joints = [None; NUM_JOINTS];
        for (i, slot) in joints.iter_mut().enumerate() {
            if subset[i] < 0.0 {
                continue;
            }
            let row = candidate.get(subset[i] as usize).ok_or_else(|| {
                BlendError::InvalidPose(format!(
                    "joint {i} references missing candidate {}",
                    subset[i]
                ))
            })?;
            *slot = Some(Keypoint::new(row[0], row[1]));
        }
        Ok(Self { joints })
    }

    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Interpolate two poses joint by joint.
///
/// `alpha` weights `a`: the result is `a * alpha + b * (1 - alpha)`. A joint
/// missing from either pose is missing from the result.
pub fn blend_poses(a: &Pose, b: &Pose, alpha: f32) -> Pose {
    let mut joints = [None; NUM_JOINTS];
    for (i, slot) in joints.iter_mut().enumerate() {
        *slot = match (a.joints[i], b.joints[i]) {
            (Some(pa), Some(pb)) => Some(Keypoint::new(
                pa.x * alpha + pb.x * (1.0 - alpha),
                pa.y * alpha + pb.y * (1.0 - alpha),
            )),
            _ => None,
        };
    }
    Pose { joints }
}

/// Draw the pose skeleton onto a black canvas.
pub fn render_pose(pose: &Pose, width: u32, height: u32) -> RgbImage {
    let mut canvas = RgbImage::new(width, height);

    for (i, &(from, to)) in LIMBS.iter().enumerate() {
        let (Some(p), Some(q)) = (pose.joints[from], pose.joints[to]) else {
            continue;
        };
        let color = COLORS[i].map(|c| (c as f32 * LIMB_INTENSITY) as u8);
        draw_segment(&mut canvas, p, q, LIMB_HALF_WIDTH, Rgb(color));
    }
    for (i, joint) in pose.joints.iter().enumerate() {
        if let Some(p) = joint {
            draw_segment(&mut canvas, *p, *p, JOINT_RADIUS, Rgb(COLORS[i]));
        }
    }
    canvas
}

/// Blend two poses and rasterize the result.
pub fn blended_control_image(a: &Pose, b: &Pose, alpha: f32, width: u32, height: u32) -> RgbImage {
    render_pose(&blend_poses(a, b, alpha), width, height)
}

/// Convert an RGB control image into a `[1, 3, H, W]` tensor in `[0, 1]`.
pub fn control_tensor(image: &RgbImage, device: &Device) -> candle_core::Result<Tensor> {
    let (w, h) = image.dimensions();
    Tensor::from_vec(image.as_raw().clone(), (h as usize, w as usize, 3), device)?
        .permute((2, 0, 1))?
        .unsqueeze(0)?
        .to_dtype(DType::F32)?
        .affine(1.0 / 255.0, 0.0)
}

/// Fill every pixel within `radius` of the segment `p`-`q` (a disc when `p == q`).
fn draw_segment(canvas: &mut RgbImage, p: Keypoint, q: Keypoint, radius: f32, color: Rgb<u8>) {
    let (w, h) = canvas.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let x0 = (p.x.min(q.x) - radius).floor().max(0.0) as u32;
    let y0 = (p.y.min(q.y) - radius).floor().max(0.0) as u32;
    let x1 = ((p.x.max(q.x) + radius).ceil().max(0.0) as u32).min(w - 1);
    let y1 = ((p.y.max(q.y) + radius).ceil().max(0.0) as u32).min(h - 1);

    let (dx, dy) = (q.x - p.x, q.y - p.y);
    let len_sq = dx * dx + dy * dy;
    for y in y0..=y1 {
        for x in x0..=x1 {
            let (px, py) = (x as f32 - p.x, y as f32 - p.y);
            let t = if len_sq > 0.0 {
                ((px * dx + py * dy) / len_sq).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let (ex, ey) = (px - t * dx, py - t * dy);
            if ex * ex + ey * ey <= radius * radius {
                canvas.put_pixel(x, y, color);
            }
        }
    }
}

/// Pose "detector" backed by known keypoints.
///
/// Stands in for a keypoint network: `extract` ignores the pixels and renders
/// the stored pose at the image's size.
#[derive(Debug, Clone, Default)]
pub struct KeypointPoseExtractor {
    pose: Pose,
}

impl KeypointPoseExtractor {
    pub fn new(pose: Pose) -> Self {
        Self { pose }
    }

    pub fn set_pose(&mut self, pose: Pose) {
        self.pose = pose;
    }
}

impl FeatureExtractor for KeypointPoseExtractor {
    fn extract(&mut self, image: &RgbImage) -> Result<ControlOutput> {
        let (w, h) = image.dimensions();
        Ok(ControlOutput {
            map: render_pose(&self.pose, w, h),
            pose: Some(self.pose.clone()),
        })
    }
}
