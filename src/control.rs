//! Conditioning modes and their feature extractors.
//!
//! The active mode decides which ControlNet weights the denoiser carries.
//! Entering a different mode reloads weights; re-entering the current mode is
//! free.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{BlendError, Result};
use crate::pose::Pose;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    Pose,
    Canny,
    Segmentation,
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlMode::Pose => "pose",
            ControlMode::Canny => "canny",
            ControlMode::Segmentation => "seg",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlState {
    #[default]
    Unset,
    Active(ControlMode),
}

/// Result of running an extractor on an image.
#[derive(Debug, Clone)]
pub struct ControlOutput {
    pub map: RgbImage,
    /// Keypoints, for extractors that detect a pose.
    pub pose: Option<Pose>,
}

/// Image -> control map.
pub trait FeatureExtractor {
    fn extract(&mut self, image: &RgbImage) -> Result<ControlOutput>;
}

/// Something that holds ControlNet weights for one mode at a time.
pub trait ControlWeights {
    fn load_control(&mut self, mode: ControlMode) -> Result<()>;
}

type ExtractorFactory = Box<dyn FnMut(ControlMode) -> Option<Box<dyn FeatureExtractor>>>;

/// Mode state machine plus a lazily filled extractor cache.
pub struct ControlContext {
    state: ControlState,
    extractors: HashMap<ControlMode, Box<dyn FeatureExtractor>>,
    factory: ExtractorFactory,
    reloads: usize,
}

impl ControlContext {
    /// `factory` creates an extractor the first time a mode needs one.
    pub fn new(factory: impl FnMut(ControlMode) -> Option<Box<dyn FeatureExtractor>> + 'static) -> Self {
        Self {
            state: ControlState::Unset,
            extractors: HashMap::new(),
            factory: Box::new(factory),
            reloads: 0,
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn active_mode(&self) -> Result<ControlMode> {
        match self.state {
            ControlState::Active(mode) => Ok(mode),
            ControlState::Unset => Err(BlendError::ModeNotSet),
        }
    }

    /// Number of weight reloads performed so far.
    pub fn reloads(&self) -> usize {
        self.reloads
    }

    /// Transition to `mode`, reloading weights only when the state changes.
    ///
    /// Returns whether a reload happened. The state is left unchanged if the
    /// reload fails.
    pub fn enter(&mut self, mode: ControlMode, weights: &mut dyn ControlWeights) -> Result<bool> {
        if self.state == ControlState::Active(mode) {
            debug!(%mode, "conditioning mode unchanged");
            return Ok(false);
        }
        info!(from = ?self.state, to = %mode, "switching conditioning mode");
        weights.load_control(mode)?;
        self.state = ControlState::Active(mode);
        self.reloads += 1;
        Ok(true)
    }

    /// Install an extractor for `mode`, replacing any cached one.
    pub fn register(&mut self, mode: ControlMode, extractor: Box<dyn FeatureExtractor>) {
        self.extractors.insert(mode, extractor);
    }

    /// Extractor for `mode`, creating it on first use.
    pub fn extractor(&mut self, mode: ControlMode) -> Result<&mut dyn FeatureExtractor> {
        let extractor = match self.extractors.entry(mode) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let created = (self.factory)(mode).ok_or(BlendError::ExtractorUnavailable(mode))?;
                debug!(%mode, "created feature extractor");
                entry.insert(created)
            }
        };
        Ok(extractor.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingWeights {
        loaded: Vec<ControlMode>,
    }

    impl ControlWeights for CountingWeights {
        fn load_control(&mut self, mode: ControlMode) -> Result<()> {
            self.loaded.push(mode);
            Ok(())
        }
    }

    struct BlankExtractor;

    impl FeatureExtractor for BlankExtractor {
        fn extract(&mut self, image: &RgbImage) -> Result<ControlOutput> {
            Ok(ControlOutput {
                map: RgbImage::new(image.width(), image.height()),
                pose: None,
            })
        }
    }

    #[test]
    fn test_reload_only_on_state_change() -> Result<()> {
        let mut ctx = ControlContext::new(|_| None);
        let mut weights = CountingWeights::default();
        assert_eq!(ctx.state(), ControlState::Unset);
        assert!(matches!(ctx.active_mode(), Err(BlendError::ModeNotSet)));

        assert!(ctx.enter(ControlMode::Pose, &mut weights)?);
        assert!(!ctx.enter(ControlMode::Pose, &mut weights)?);
        assert!(ctx.enter(ControlMode::Canny, &mut weights)?);
        assert!(ctx.enter(ControlMode::Pose, &mut weights)?);

        assert_eq!(ctx.reloads(), 3);
        assert_eq!(
            weights.loaded,
            vec![ControlMode::Pose, ControlMode::Canny, ControlMode::Pose]
        );
        Ok(())
    }

    #[test]
    fn test_extractors_created_once() -> Result<()> {
        let created = std::rc::Rc::new(std::cell::Cell::new(0));
        let counter = created.clone();
        let mut ctx = ControlContext::new(move |mode| {
            counter.set(counter.get() + 1);
            match mode {
                ControlMode::Canny => Some(Box::new(BlankExtractor) as Box<dyn FeatureExtractor>),
                _ => None,
            }
        });
        let image = RgbImage::new(8, 8);
        ctx.extractor(ControlMode::Canny)?.extract(&image)?;
        ctx.extractor(ControlMode::Canny)?;
        assert_eq!(created.get(), 1);
        assert!(matches!(
            ctx.extractor(ControlMode::Segmentation),
            Err(BlendError::ExtractorUnavailable(ControlMode::Segmentation))
        ));
        Ok(())
    }
}
