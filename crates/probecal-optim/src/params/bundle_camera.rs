//! 12-parameter camera block used by bundle adjustment.

use anyhow::{ensure, Result};
use nalgebra::{DVector, DVectorView};
use probecal_core::{BrownConrady5, CameraIntrinsics, CameraPose, FxFyCxCy, Real, Vec3};

/// Camera vector `[rx, ry, rz, tx, ty, tz, f, k1, k2, p1, p2, k3]`.
///
/// A single focal length is refined; the principal point is carried alongside
/// but never optimized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BundleCamera {
    pub rvec: Vec3,
    pub tvec: Vec3,
    pub focal: Real,
    /// Distortion in wire order `[k1, k2, p1, p2, k3]`.
    pub dist: [Real; 5],
    pub principal_point: [Real; 2],
}

impl BundleCamera {
    pub const DIM: usize = 12;

    /// Seed from an intrinsic calibration. `fx` is used as the shared focal length.
    pub fn from_calibration(intrinsics: &CameraIntrinsics, pose: &CameraPose) -> Self {
        Self {
            rvec: pose.rvec(),
            tvec: pose.tvec(),
            focal: intrinsics.k.fx,
            dist: intrinsics.dist.to_opencv(),
            principal_point: [intrinsics.k.cx, intrinsics.k.cy],
        }
    }

    pub fn to_dvec(&self) -> DVector<f64> {
        let mut v = DVector::zeros(Self::DIM);
        v.fixed_rows_mut::<3>(0).copy_from(&self.rvec);
        v.fixed_rows_mut::<3>(3).copy_from(&self.tvec);
        v[6] = self.focal;
        for (i, d) in self.dist.iter().enumerate() {
            v[7 + i] = *d;
        }
        v
    }

    /// Rebuild from a solved vector, keeping `self`'s principal point.
    pub fn with_dvec(&self, v: DVectorView<'_, f64>) -> Result<Self> {
        ensure!(
            v.len() == Self::DIM,
            "expected bundle camera vector of length {}, got {}",
            Self::DIM,
            v.len()
        );
        Ok(Self {
            rvec: Vec3::new(v[0], v[1], v[2]),
            tvec: Vec3::new(v[3], v[4], v[5]),
            focal: v[6],
            dist: [v[7], v[8], v[9], v[10], v[11]],
            principal_point: self.principal_point,
        })
    }

    pub fn pose(&self) -> CameraPose {
        CameraPose::from_rvec_tvec(&self.rvec, &self.tvec)
    }

    pub fn intrinsics(&self) -> CameraIntrinsics {
        CameraIntrinsics::new(
            FxFyCxCy {
                fx: self.focal,
                fy: self.focal,
                cx: self.principal_point[0],
                cy: self.principal_point[1],
            },
            BrownConrady5::from_opencv(self.dist),
        )
    }
}
