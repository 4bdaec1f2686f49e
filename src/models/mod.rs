//! Model backends for the denoiser adapter.

pub mod stable_diffusion;
