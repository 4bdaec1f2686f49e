//! Binary-subdivision frame scheduler.
//!
//! The output timeline has `2^levels + 1` slots. Slot 0 and the last slot hold
//! the two endpoints; each level halves the subdivision step and resolves the
//! slots at odd multiples of it, from the two already-known neighbours one
//! step away on either side. At the start of every level the endpoint slots
//! are refreshed from the next rung of their noise ladders.

use std::path::PathBuf;

use candle_core::Tensor;
use image::RgbImage;
use tracing::{debug, info, warn};

use crate::config::{BlendConfig, MAX_LEVELS};
use crate::error::{BlendError, Result};
use crate::io::save_frame;
use crate::ladder::NoiseLadder;
use crate::pose::{Pose, blended_control_image};
use crate::slerp::slerp;

/// Level index at which the midpoint is re-seeded from the quarter points.
const MIDPOINT_RESEED_LEVEL: usize = 2;

/// Frame-count arithmetic for a subdivision depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSchedule {
    levels: usize,
    steps_per_frame: usize,
}

impl FrameSchedule {
    /// `levels = ddim_steps / steps_per_frame`, capped at [`MAX_LEVELS`].
    pub fn new(ddim_steps: usize, steps_per_frame: usize) -> Self {
        let levels = ddim_steps.checked_div(steps_per_frame).unwrap_or(0);
        if levels > MAX_LEVELS {
            warn!(levels, max = MAX_LEVELS, "capping subdivision depth");
        }
        Self {
            levels: levels.min(MAX_LEVELS),
            steps_per_frame,
        }
    }

    pub fn from_config(config: &BlendConfig) -> Self {
        Self::new(config.ddim_steps, config.steps_per_frame)
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    /// `2^levels + 1`
    pub fn total_frames(&self) -> usize {
        (1usize << self.levels) + 1
    }

    /// `steps_per_frame * sum_{x=1}^{levels} (2^x - 1)`; the noise ladder length.
    pub fn num_frames(&self) -> usize {
        self.steps_per_frame * (1..=self.levels).map(|x| (1usize << x) - 1).sum::<usize>()
    }

    /// Number of img2img invocations a full run performs.
    pub fn denoiser_calls(&self) -> usize {
        self.total_frames() - 2
    }

    /// The explicit work list: one entry per level, coarse to fine.
    pub fn plan(&self, edge_bias: f64) -> Vec<LevelPlan> {
        let total = self.total_frames();
        let last = total - 1;
        let mut step = last;
        (0..self.levels)
            .map(|level| {
                step /= 2;
                let slots = (step..last)
                    .step_by(2 * step)
                    .map(|index| {
                        let (left, right) = (index - step, index + step);
                        let mut fraction = 0.5;
                        if left == 0 {
                            fraction -= edge_bias;
                        }
                        if right == last {
                            fraction += edge_bias;
                        }
                        SlotTask {
                            index,
                            left,
                            right,
                            fraction,
                        }
                    })
                    .collect();
                LevelPlan {
                    level,
                    step,
                    ladder_rung: level + 1,
                    reseed_midpoint: level == MIDPOINT_RESEED_LEVEL,
                    slots,
                }
            })
            .collect()
    }
}

/// Work for one subdivision level.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelPlan {
    pub level: usize,
    /// Distance from each new slot to its neighbours.
    pub step: usize,
    /// Ladder rung loaded into the endpoint slots for this level.
    pub ladder_rung: usize,
    /// Refresh the midpoint prior from the quarter points before resolving.
    pub reseed_midpoint: bool,
    pub slots: Vec<SlotTask>,
}

/// One slot to synthesize.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotTask {
    pub index: usize,
    pub left: usize,
    pub right: usize,
    /// Position between `left` (0) and `right` (1).
    pub fraction: f64,
}

/// Latent priors for every slot of the timeline.
#[derive(Debug, Clone)]
pub struct FrameSlots {
    latents: Vec<Option<Tensor>>,
    resolutions: Vec<usize>,
}

impl FrameSlots {
    pub fn new(total_frames: usize) -> Self {
        Self {
            latents: vec![None; total_frames],
            resolutions: vec![0; total_frames],
        }
    }

    pub fn len(&self) -> usize {
        self.latents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latents.is_empty()
    }

    pub fn is_resolved(&self, index: usize) -> bool {
        self.latents.get(index).is_some_and(|s| s.is_some())
    }

    /// How many times each slot went from unresolved to resolved.
    pub fn resolutions(&self) -> &[usize] {
        &self.resolutions
    }

    pub fn get(&self, index: usize) -> Result<&Tensor> {
        self.latents
            .get(index)
            .and_then(|s| s.as_ref())
            .ok_or(BlendError::SchedulingInvariantViolation {
                slot: index,
                reason: "neighbour slot read before it was resolved",
            })
    }

    /// Resolve an interior slot; resolving twice is a scheduling bug.
    pub fn resolve(&mut self, index: usize, latent: Tensor) -> Result<()> {
        match self.latents.get_mut(index) {
            Some(slot @ None) => {
                *slot = Some(latent);
                self.resolutions[index] += 1;
                Ok(())
            }
            Some(Some(_)) => Err(BlendError::SchedulingInvariantViolation {
                slot: index,
                reason: "slot already resolved",
            }),
            None => Err(BlendError::SchedulingInvariantViolation {
                slot: index,
                reason: "slot index outside the timeline",
            }),
        }
    }

    /// Load an endpoint latent; endpoints are refreshed once per level.
    pub fn set_anchor(&mut self, index: usize, latent: Tensor) -> Result<()> {
        let slot = self
            .latents
            .get_mut(index)
            .ok_or(BlendError::SchedulingInvariantViolation {
                slot: index,
                reason: "slot index outside the timeline",
            })?;
        if slot.is_none() {
            self.resolutions[index] += 1;
        }
        *slot = Some(latent);
        Ok(())
    }

    /// Replace the prior of an already-resolved slot without re-resolving it.
    pub fn reseed(&mut self, index: usize, latent: Tensor) -> Result<()> {
        match self.latents.get_mut(index) {
            Some(slot @ Some(_)) => {
                *slot = Some(latent);
                Ok(())
            }
            _ => Err(BlendError::SchedulingInvariantViolation {
                slot: index,
                reason: "re-seeding a slot that was never resolved",
            }),
        }
    }
}

/// Turns a slot's latent prior and control map into a pixel frame.
pub trait FrameRenderer {
    fn render_frame(&mut self, task: &SlotTask, prior: &Tensor, control: &RgbImage) -> Result<RgbImage>;
}

/// What a scheduler run produced.
#[derive(Debug, Clone)]
pub struct BlendOutcome {
    pub slots: FrameSlots,
    /// Slot indices in the order their frames were synthesized.
    pub order: Vec<usize>,
    pub saved: Vec<PathBuf>,
}

pub struct FrameScheduler {
    schedule: FrameSchedule,
    edge_bias: f64,
    width: u32,
    height: u32,
    output_dir: Option<PathBuf>,
}

impl FrameScheduler {
    pub fn new(config: &BlendConfig) -> Self {
        Self {
            schedule: FrameSchedule::from_config(config),
            edge_bias: config.edge_bias,
            width: config.width as u32,
            height: config.height as u32,
            output_dir: Some(config.output_dir.clone()),
        }
    }

    /// Keep frames in memory only.
    pub fn without_output(mut self) -> Self {
        self.output_dir = None;
        self
    }

    pub fn schedule(&self) -> &FrameSchedule {
        &self.schedule
    }

    /// Resolve every slot of the timeline.
    pub fn run(
        &self,
        ladder_a: &NoiseLadder,
        ladder_b: &NoiseLadder,
        pose_a: &Pose,
        pose_b: &Pose,
        renderer: &mut dyn FrameRenderer,
    ) -> Result<BlendOutcome> {
        let total = self.schedule.total_frames();
        let last = total - 1;
        let mut slots = FrameSlots::new(total);
        let mut order = Vec::with_capacity(self.schedule.denoiser_calls());
        let mut saved = Vec::new();

        info!(
            levels = self.schedule.levels(),
            total_frames = total,
            ladder_len = ladder_a.len(),
            "starting frame schedule"
        );

        for plan in self.schedule.plan(self.edge_bias) {
            slots.set_anchor(0, ladder_a.rung(plan.ladder_rung).clone())?;
            slots.set_anchor(last, ladder_b.rung(plan.ladder_rung).clone())?;
            debug!(level = plan.level, step = plan.step, rung = plan.ladder_rung, "level start");

            if plan.reseed_midpoint {
                let seeded = slerp(slots.get(total / 4)?, slots.get(3 * total / 4)?, 0.5)?;
                slots.reseed(total / 2, seeded)?;
                debug!(slot = total / 2, "re-seeded midpoint from quarter points");
            }

            for task in &plan.slots {
                if slots.is_resolved(task.index) {
                    return Err(BlendError::SchedulingInvariantViolation {
                        slot: task.index,
                        reason: "slot already resolved",
                    });
                }
                let prior = slerp(slots.get(task.left)?, slots.get(task.right)?, task.fraction)?;
                // Pose weights are "weight of A", fractions run from A toward B.
                let control = blended_control_image(
                    pose_a,
                    pose_b,
                    (1.0 - task.fraction) as f32,
                    self.width,
                    self.height,
                );
                slots.resolve(task.index, prior.clone())?;

                info!(
                    level = plan.level,
                    slot = task.index,
                    step = plan.step,
                    fraction = task.fraction,
                    "synthesizing frame"
                );
                let frame = renderer.render_frame(task, &prior, &control)?;
                if let Some(dir) = &self.output_dir {
                    saved.push(save_frame(dir, task.index, total, &frame)?);
                }
                order.push(task.index);
            }
        }

        Ok(BlendOutcome {
            slots,
            order,
            saved,
        })
    }
}
