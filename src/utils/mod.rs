pub mod deterministic_rng;

pub use deterministic_rng::{NoiseSource, Pcg32};
