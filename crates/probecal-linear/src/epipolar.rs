//! Epipolar matrices from a known relative pose.
//!
//! `E` relates normalized rays, `F` relates pixels: `x_bᵀ F x_a = 0`.

use probecal_core::{skew, Mat3, Vec3};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EpipolarError {
    #[error("intrinsics matrix is not invertible")]
    SingularIntrinsics,
    #[error("epipolar matrix vanished")]
    Degenerate,
}

/// Essential matrix `E = [t]x R` for the transform mapping camera A into camera B.
pub fn essential_from_rt(r_ab: &Mat3, t_ab: &Vec3) -> Mat3 {
    skew(t_ab) * r_ab
}

/// Fundamental matrix `F = K_B^{-T} E K_A^{-1}`, scaled so its largest
/// absolute entry is 1.
pub fn fundamental_from_essential(
    k_a: &Mat3,
    k_b: &Mat3,
    e: &Mat3,
) -> Result<Mat3, EpipolarError> {
    let k_a_inv = k_a.try_inverse().ok_or(EpipolarError::SingularIntrinsics)?;
    let k_b_inv = k_b.try_inverse().ok_or(EpipolarError::SingularIntrinsics)?;
    let f = k_b_inv.transpose() * e * k_a_inv;
    let scale = f.amax();
    if scale <= f64::EPSILON {
        return Err(EpipolarError::Degenerate);
    }
    Ok(f / scale)
}
