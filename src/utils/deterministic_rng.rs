//! Seeded Gaussian noise for reproducible noise ladders.

use candle_core::{DType, Device, Result, Shape, Tensor};

/// Default PCG stream increment.
pub const PCG_DEFAULT_STREAM: u64 = 1442695040888963407;

/// Anything that can hand out standard-normal noise tensors.
///
/// Ladder construction draws through this trait so tests can substitute
/// fixed noise.
pub trait NoiseSource {
    fn randn(&mut self, shape: &Shape, dtype: DType, device: &Device) -> Result<Tensor>;
}

/// PCG32 (XSH-RR) generator.
#[derive(Debug, Clone)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
    spare: Option<f32>,
}

impl Pcg32 {
    pub fn new(seed: u64, stream: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: (stream << 1) | 1,
            spare: None,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    pub fn from_seed(seed: u64) -> Self {
        Self::new(seed, PCG_DEFAULT_STREAM)
    }

    pub fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.state = old.wrapping_mul(6364136223846793005).wrapping_add(self.inc);
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        let rot = (old >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Uniform sample in [0, 1) with 24 bits of mantissa.
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 * 5.9604645e-8
    }

    /// Standard normal sample (Box-Muller, second value cached).
    pub fn next_gaussian(&mut self) -> f32 {
        if let Some(z) = self.spare.take() {
            return z;
        }
        let u1 = loop {
            let x = self.next_f32();
            if x > 1e-7 {
                break x;
            }
        };
        let u2 = self.next_f32();
        let mag = (-2.0 * u1.ln()).sqrt();
        let angle = 2.0 * std::f32::consts::PI * u2;
        self.spare = Some(mag * angle.sin());
        mag * angle.cos()
    }
}

impl NoiseSource for Pcg32 {
    fn randn(&mut self, shape: &Shape, dtype: DType, device: &Device) -> Result<Tensor> {
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.next_gaussian())
            .collect();
        Tensor::from_vec(data, shape.clone(), device)?.to_dtype(dtype)
    }
}
