use crate::{CameraPose, Mat3, Pt2, Pt3, Real, Vec2, Vec3};
use serde::{Deserialize, Serialize};

use super::{BrownConrady5, DistortionModel, FxFyCxCy, IntrinsicsModel};

/// Nominal focal length of the instrument cameras in pixels.
pub const NOMINAL_FOCAL_PX: Real = 1.54e4;
/// Nominal sensor size in pixels.
pub const NOMINAL_IMAGE_SIZE: (u32, u32) = (4000, 3000);

/// Pinhole intrinsics with Brown-Conrady distortion.
///
/// `pixel = K(distort(x/z, y/z))`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub k: FxFyCxCy<Real>,
    pub dist: BrownConrady5<Real>,
}

impl CameraIntrinsics {
    pub fn new(k: FxFyCxCy<Real>, dist: BrownConrady5<Real>) -> Self {
        Self { k, dist }
    }

    /// Distortion-free intrinsics.
    pub fn pinhole(fx: Real, fy: Real, cx: Real, cy: Real) -> Self {
        Self::new(FxFyCxCy { fx, fy, cx, cy }, BrownConrady5::default())
    }

    /// The nominal instrument camera: principal point at the sensor centre,
    /// no distortion. Used as the seed when no guess is configured.
    pub fn nominal() -> Self {
        Self::pinhole(
            NOMINAL_FOCAL_PX,
            NOMINAL_FOCAL_PX,
            NOMINAL_IMAGE_SIZE.0 as Real / 2.0,
            NOMINAL_IMAGE_SIZE.1 as Real / 2.0,
        )
    }

    pub fn k_matrix(&self) -> Mat3 {
        self.k.k_matrix()
    }

    /// Project a camera-frame point. Points at or behind the camera give `None`.
    pub fn project_point_c(&self, p_c: &Vec3) -> Option<Pt2> {
        if p_c.z <= 0.0 {
            return None;
        }
        let n_u = Vec2::new(p_c.x / p_c.z, p_c.y / p_c.z);
        let n_d = self.dist.distort(&n_u);
        let px = self.k.to_pixel(&n_d);
        Some(Pt2::new(px.x, px.y))
    }

    /// Project a world (reticle) point through `pose`.
    pub fn project_world(&self, pose: &CameraPose, pw: &Pt3) -> Option<Pt2> {
        self.project_point_c(&pose.world_to_camera(pw).coords)
    }

    /// Remove lens distortion from a pixel, returning the ideal pinhole pixel.
    pub fn undistort_pixel(&self, px: &Pt2) -> Pt2 {
        if self.dist.is_zero() {
            return *px;
        }
        let n_d = self.k.from_pixel(&px.coords);
        let n_u = self.dist.undistort(&n_d);
        let ideal = self.k.to_pixel(&n_u);
        Pt2::new(ideal.x, ideal.y)
    }

    /// Unit-depth ray direction through a pixel.
    pub fn backproject_pixel(&self, px: &Pt2) -> Vec3 {
        let n_d = self.k.from_pixel(&px.coords);
        let n_u = self.dist.undistort(&n_d);
        Vec3::new(n_u.x, n_u.y, 1.0)
    }
}
