//! Deterministic synthetic scenes.
//!
//! Cameras are placed on a ring around the reticle origin and look at it; the
//! helpers here project the reticle and arbitrary world points into them. All
//! distances are millimetres.

use crate::{AxisDetections, CameraIntrinsics, CameraPose, Pt2, Pt3, Real, ReticleObjectPoints, Vec3};
use nalgebra::Matrix3;

pub use crate::models::{NOMINAL_FOCAL_PX, NOMINAL_IMAGE_SIZE};

/// Intrinsics of the nominal instrument camera.
pub fn nominal_intrinsics() -> CameraIntrinsics {
    CameraIntrinsics::nominal()
}

/// Pose of a camera at `eye` whose optical axis passes through `target`.
///
/// World +Z is used as the up hint, so `eye` must not lie directly above `target`.
pub fn look_at(eye: &Pt3, target: &Pt3) -> CameraPose {
    let up = Vec3::z();
    let z_c = (target - eye).normalize();
    let x_c = z_c.cross(&up).normalize();
    let y_c = z_c.cross(&x_c);
    let r = Matrix3::from_rows(&[x_c.transpose(), y_c.transpose(), z_c.transpose()]);
    let t = -(r * eye.coords);
    CameraPose::from_rotation_translation(&r, &t)
}

/// Pose on a sphere of `distance` around the origin.
pub fn orbit_pose(distance: Real, azimuth: Real, elevation: Real) -> CameraPose {
    let eye = Pt3::new(
        distance * elevation.cos() * azimuth.cos(),
        distance * elevation.cos() * azimuth.sin(),
        distance * elevation.sin(),
    );
    look_at(&eye, &Pt3::origin())
}

#[derive(Debug, Clone)]
pub struct SyntheticCamera {
    pub id: String,
    pub intrinsics: CameraIntrinsics,
    pub pose: CameraPose,
}

impl SyntheticCamera {
    pub fn project(&self, pw: &Pt3) -> Option<Pt2> {
        self.intrinsics.project_world(&self.pose, pw)
    }

    /// Noise-free axis detections of the reticle.
    pub fn detect_reticle(&self, reticle: &ReticleObjectPoints) -> Option<AxisDetections> {
        let x_axis = reticle
            .x_axis()
            .iter()
            .map(|p| self.project(p))
            .collect::<Option<Vec<_>>>()?;
        let y_axis = reticle
            .y_axis()
            .iter()
            .map(|p| self.project(p))
            .collect::<Option<Vec<_>>>()?;
        Some(AxisDetections::new(x_axis, y_axis))
    }
}

/// `n` nominal cameras evenly spaced in azimuth, ids `cam0`, `cam1`, ...
pub fn camera_ring(n: usize, distance: Real, elevation: Real) -> Vec<SyntheticCamera> {
    (0..n)
        .map(|i| {
            let azimuth = std::f64::consts::TAU * i as Real / n.max(1) as Real + 0.3;
            SyntheticCamera {
                id: format!("cam{i}"),
                intrinsics: nominal_intrinsics(),
                pose: orbit_pose(distance, azimuth, elevation),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn look_at_projects_target_to_principal_point() {
        let cams = camera_ring(3, 40.0, 0.9);
        for cam in &cams {
            let px = cam.project(&Pt3::origin()).unwrap();
            assert!((px.x - 2000.0).abs() < 1e-6, "{}: {px:?}", cam.id);
            assert!((px.y - 1500.0).abs() < 1e-6, "{}: {px:?}", cam.id);
        }
    }

    #[test]
    fn reticle_fits_in_image() {
        let reticle = ReticleObjectPoints::default();
        for cam in camera_ring(4, 40.0, 0.9) {
            let det = cam.detect_reticle(&reticle).unwrap();
            assert_eq!(det.len(), 42);
            for p in det.points() {
                assert!(p.x > 0.0 && p.x < 4000.0 && p.y > 0.0 && p.y < 3000.0);
            }
        }
    }
}
