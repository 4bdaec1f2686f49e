//! Tests for the noise algebra, spherical interpolation and pose blending

use candle_core::{DType, Device, Tensor};
use candle_morph::pose::{NUM_JOINTS, blend_poses};
use candle_morph::utils::{NoiseSource, Pcg32};
use candle_morph::{BlendError, Keypoint, NoiseSchedule, Pose, Result, slerp};

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a.sub(b)?.abs()?.max_all()?.to_scalar::<f32>()?)
}

fn randn(rng: &mut Pcg32, shape: (usize, usize, usize, usize)) -> Result<Tensor> {
    Ok(rng.randn(&shape.into(), DType::F32, &Device::Cpu)?)
}

// ============================================================================
// Noise rescheduling
// ============================================================================

#[test]
fn test_reschedule_composes_like_a_single_call() -> Result<()> {
    let schedule = NoiseSchedule::default();
    let (t1, t2, t3) = (100, 400, 800);

    let (s12, sig12) = schedule.reschedule_coefficients(t1, t2)?;
    let (s23, sig23) = schedule.reschedule_coefficients(t2, t3)?;
    let (s13, sig13) = schedule.reschedule_coefficients(t1, t3)?;
    assert!((s12 * s23 - s13).abs() < 1e-9);
    assert!(((s23 * sig12).powi(2) + sig23.powi(2) - sig13.powi(2)).abs() < 1e-9);

    // Two draws folded into the equivalent unit-variance draw of the direct call.
    let mut rng = Pcg32::from_seed(7);
    let latent = randn(&mut rng, (1, 4, 8, 8))?;
    let n1 = randn(&mut rng, (1, 4, 8, 8))?;
    let n2 = randn(&mut rng, (1, 4, 8, 8))?;
    let x1 = schedule.add_noise(&latent, &n1, t1)?;

    let mid = schedule.reschedule_noise(&x1, &n1, t1, t2)?;
    let two_step = schedule.reschedule_noise(&mid, &n2, t2, t3)?;

    let combined = n1
        .affine(s23 * sig12 / sig13, 0.0)?
        .add(&n2.affine(sig23 / sig13, 0.0)?)?;
    let direct = schedule.reschedule_noise(&x1, &combined, t1, t3)?;
    assert!(max_abs_diff(&two_step, &direct)? < 1e-4);
    Ok(())
}

#[test]
fn test_reschedule_rejects_backwards_timesteps() -> Result<()> {
    let schedule = NoiseSchedule::default();
    let latent = Tensor::zeros((1, 4, 2, 2), DType::F32, &Device::Cpu)?;
    let result = schedule.reschedule_noise(&latent, &latent, 500, 200);
    assert!(matches!(
        result,
        Err(BlendError::InvalidTimestepOrder { t1: 500, t2: 200, .. })
    ));
    assert!(schedule.reschedule_coefficients(10, 5000).is_err());
    Ok(())
}

#[test]
fn test_reschedule_same_timestep_is_identity() -> Result<()> {
    let schedule = NoiseSchedule::default();
    let mut rng = Pcg32::from_seed(3);
    let latent = randn(&mut rng, (1, 4, 4, 4))?;
    let noise = randn(&mut rng, (1, 4, 4, 4))?;
    let out = schedule.reschedule_noise(&latent, &noise, 300, 300)?;
    assert!(max_abs_diff(&out, &latent)? < 1e-5);
    Ok(())
}

// ============================================================================
// Slerp
// ============================================================================

#[test]
fn test_slerp_endpoints_and_identity() -> Result<()> {
    let mut rng = Pcg32::from_seed(11);
    let p = randn(&mut rng, (1, 4, 4, 4))?;
    let q = randn(&mut rng, (1, 4, 4, 4))?;

    assert!(max_abs_diff(&slerp(&p, &q, 0.0)?, &p)? < 1e-5);
    assert!(max_abs_diff(&slerp(&p, &q, 1.0)?, &q)? < 1e-5);
    for f in [0.0, 0.3, 0.5, 1.0] {
        assert!(max_abs_diff(&slerp(&p, &p, f)?, &p)? < 1e-5);
    }
    Ok(())
}

#[test]
fn test_slerp_preserves_norm_of_equal_norm_inputs() -> Result<()> {
    let device = Device::Cpu;
    let p = Tensor::new(&[3f32, 0.0, 0.0, 4.0], &device)?;
    let q = Tensor::new(&[0f32, 5.0, 0.0, 0.0], &device)?;
    let mid = slerp(&p, &q, 0.25)?;
    let norm = mid.sqr()?.sum_all()?.to_scalar::<f32>()?.sqrt();
    assert!((norm - 5.0).abs() < 1e-4, "norm {norm}");
    Ok(())
}

// ============================================================================
// Pose blending
// ============================================================================

#[test]
fn test_missing_joints_stay_missing_for_every_alpha() {
    let full = Pose::new([Some(Keypoint::new(10.0, 10.0)); NUM_JOINTS]);
    for missing in 0..NUM_JOINTS {
        let mut joints = [Some(Keypoint::new(50.0, 50.0)); NUM_JOINTS];
        joints[missing] = None;
        let partial = Pose::new(joints);
        for alpha in [0.0, 0.25, 0.5, 1.0] {
            let ab = blend_poses(&full, &partial, alpha);
            let ba = blend_poses(&partial, &full, alpha);
            assert!(ab.joints()[missing].is_none());
            assert!(ba.joints()[missing].is_none());
            assert_eq!(ab.present_count(), NUM_JOINTS - 1);
        }
    }
}

#[test]
fn test_blend_alpha_one_returns_first_pose() {
    let a = Pose::new([Some(Keypoint::new(1.0, 2.0)); NUM_JOINTS]);
    let b = Pose::new([Some(Keypoint::new(9.0, 8.0)); NUM_JOINTS]);
    assert_eq!(blend_poses(&a, &b, 1.0), a);
    assert_eq!(blend_poses(&a, &b, 0.0), b);
}
