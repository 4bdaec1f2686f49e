//! Spherical linear interpolation between latents.

use candle_core::{DType, Result, Tensor};

const EPSILON: f64 = 1e-7;

/// Mix two tensors along the great circle through them.
///
/// `fraction = 0` returns `p0`, `fraction = 1` returns `p1`. The arithmetic
/// runs in `f64` and the result is cast back to `p0`'s dtype. When the inputs
/// are (anti)parallel or zero the angle is undefined and plain linear
/// interpolation is used instead.
pub fn slerp(p0: &Tensor, p1: &Tensor, fraction: f64) -> Result<Tensor> {
    let out_dtype = p0.dtype();
    let a = p0.to_dtype(DType::F64)?;
    let b = p1.to_dtype(DType::F64)?;

    let norm = l2_norm(&a)? * l2_norm(&b)?;
    let (s0, s1) = match spherical_weights(&a, &b, norm, fraction)? {
        Some(weights) => weights,
        None => (1.0 - fraction, fraction),
    };

    let mixed = a.affine(s0, 0.0)?.add(&b.affine(s1, 0.0)?)?;
    mixed.to_dtype(out_dtype)
}

fn l2_norm(t: &Tensor) -> Result<f64> {
    t.sqr()?.sum_all()?.to_scalar::<f64>().map(f64::sqrt)
}

/// Weights for `p0` and `p1`, or `None` when `sin(theta_0)` is too small.
fn spherical_weights(a: &Tensor, b: &Tensor, norm: f64, fraction: f64) -> Result<Option<(f64, f64)>> {
    if !(norm.is_finite() && norm > 0.0) {
        return Ok(None);
    }
    let dot = a.mul(b)?.sum_all()?.to_scalar::<f64>()? / norm;
    let dot = dot.clamp(-1.0 + EPSILON, 1.0 - EPSILON);

    let theta_0 = dot.acos();
    let sin_theta_0 = theta_0.sin();
    if sin_theta_0.abs() < EPSILON {
        return Ok(None);
    }
    let theta_t = theta_0 * fraction;
    Ok(Some((
        (theta_0 - theta_t).sin() / sin_theta_0,
        theta_t.sin() / sin_theta_0,
    )))
}
