//! Least-squares rigid alignment of two point sets.

use probecal_core::{homogeneous_transform, Mat3, Mat4, Pt3, Real, Vec3};
use thiserror::Error;

/// Minimum number of correspondences accepted by [`fit_rigid_transform`]
/// is one more than this.
pub const RIGID_FIT_MIN_EXCLUSIVE: usize = 3;

#[derive(Debug, Error)]
pub enum RigidFitError {
    #[error("need more than {RIGID_FIT_MIN_EXCLUSIVE} correspondences, got {0}")]
    NotEnoughPoints(usize),
    #[error("mismatched point counts: {local} local vs {global} global")]
    CountMismatch { local: usize, global: usize },
    #[error("svd failed in rigid alignment")]
    SvdFailed,
}

/// Proper rigid transform `global ≈ R · local + t` with per-point residuals.
#[derive(Debug, Clone, PartialEq)]
pub struct RigidFit {
    pub rotation: Mat3,
    pub translation: Vec3,
    /// Euclidean residual of each correspondence after alignment.
    pub residuals: Vec<Real>,
    pub mean_error: Real,
}

impl RigidFit {
    /// 4x4 homogeneous form of the fitted transform.
    pub fn transform(&self) -> Mat4 {
        homogeneous_transform(&self.rotation, &self.translation)
    }

    pub fn apply(&self, p: &Pt3) -> Pt3 {
        Pt3::from(self.rotation * p.coords + self.translation)
    }
}

/// Fit `global ≈ R · local + t` in the least-squares sense (Kabsch).
///
/// The rotation is constrained to `det(R) = +1`; a reflection from the SVD is
/// corrected by flipping the last singular direction.
pub fn fit_rigid_transform(local: &[Pt3], global: &[Pt3]) -> Result<RigidFit, RigidFitError> {
    if local.len() != global.len() {
        return Err(RigidFitError::CountMismatch {
            local: local.len(),
            global: global.len(),
        });
    }
    if local.len() <= RIGID_FIT_MIN_EXCLUSIVE {
        return Err(RigidFitError::NotEnoughPoints(local.len()));
    }

    let n = local.len() as Real;
    let mut c_l = Vec3::zeros();
    let mut c_g = Vec3::zeros();
    for (pl, pg) in local.iter().zip(global.iter()) {
        c_l += pl.coords;
        c_g += pg.coords;
    }
    c_l /= n;
    c_g /= n;

    let mut h = Mat3::zeros();
    for (pl, pg) in local.iter().zip(global.iter()) {
        h += (pg.coords - c_g) * (pl.coords - c_l).transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u.ok_or(RigidFitError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(RigidFitError::SvdFailed)?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fix = u;
        u_fix.column_mut(2).neg_mut();
        r = u_fix * v_t;
    }
    let t = c_g - r * c_l;

    let residuals: Vec<Real> = local
        .iter()
        .zip(global.iter())
        .map(|(pl, pg)| (r * pl.coords + t - pg.coords).norm())
        .collect();
    let mean_error = residuals.iter().sum::<Real>() / n;

    log::trace!(
        "rigid fit over {} points, mean error {:.4}",
        local.len(),
        mean_error
    );

    Ok(RigidFit {
        rotation: r,
        translation: t,
        residuals,
        mean_error,
    })
}
