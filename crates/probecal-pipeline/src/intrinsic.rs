//! Single-camera calibration against the reticle.

use anyhow::Context;
use probecal_core::{
    AxisDetections, CalibError, CalibResult, CameraIntrinsics, CameraPose, Pt2, Pt3, Real,
    ReticleObjectPoints,
};
use probecal_linear::{dlt_homography, estimate_planar_pose_from_h};
use probecal_optim::params::pose_se3::iso3_to_se3_dvec;
use probecal_optim::problems::intrinsics::{
    optimize_intrinsics, IntrinsicsInit, IntrinsicsSolveOptions, ReticleObservations,
};
use probecal_optim::BackendSolveOptions;
use serde::{Deserialize, Serialize};

use crate::config::IntrinsicConfig;

/// Result of calibrating one camera from one reticle image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicCalibration {
    pub camera_id: String,
    /// Pixel RMS of the reticle reprojection.
    pub rms_px: Real,
    pub intrinsics: CameraIntrinsics,
    /// Reticle frame expressed in the camera frame.
    pub pose: CameraPose,
    pub image_size: (u32, u32),
}

impl IntrinsicCalibration {
    /// Wire tuple `(rms, K, dist [k1, k2, p1, p2, k3], rvec, tvec)`.
    pub fn to_wire(&self) -> (Real, [[Real; 3]; 3], [Real; 5], [Real; 3], [Real; 3]) {
        let k = self.intrinsics.k_matrix();
        let rows = [
            [k[(0, 0)], k[(0, 1)], k[(0, 2)]],
            [k[(1, 0)], k[(1, 1)], k[(1, 2)]],
            [k[(2, 0)], k[(2, 1)], k[(2, 2)]],
        ];
        let r = self.pose.rvec();
        let t = self.pose.tvec();
        (
            self.rms_px,
            rows,
            self.intrinsics.dist.to_opencv(),
            [r.x, r.y, r.z],
            [t.x, t.y, t.z],
        )
    }
}

/// Pixel positions of the reticle origin and of points `axis_length` mm along
/// each reticle axis, for drawing an axis overlay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisOverlay {
    pub origin: Pt2,
    pub x: Pt2,
    pub y: Pt2,
    pub z: Pt2,
}

/// Project the reticle coordinate axes into the calibrated image.
///
/// Returns `None` if any of the four points falls behind the camera.
pub fn project_axes(calib: &IntrinsicCalibration, axis_length: Real) -> Option<AxisOverlay> {
    let project = |p: Pt3| calib.intrinsics.project_world(&calib.pose, &p);
    Some(AxisOverlay {
        origin: project(Pt3::origin())?,
        x: project(Pt3::new(axis_length, 0.0, 0.0))?,
        y: project(Pt3::new(0.0, axis_length, 0.0))?,
        z: project(Pt3::new(0.0, 0.0, axis_length))?,
    })
}

/// Calibrate one camera from its reticle axis detections.
///
/// The pose is seeded from a homography of the reticle plane and refined by
/// LM with the free parameters chosen by `config.mode`.
pub fn calibrate_intrinsics(
    camera_id: &str,
    detections: &AxisDetections,
    reticle: &ReticleObjectPoints,
    config: &IntrinsicConfig,
    solver: &BackendSolveOptions,
) -> CalibResult<IntrinsicCalibration> {
    detections.validate(reticle)?;

    let object = reticle.points();
    let pixels = detections.points();
    let seed = &config.guess;

    // homography works on undistorted pixels
    let plane: Vec<Pt2> = object.iter().map(|p| Pt2::new(p.x, p.y)).collect();
    let ideal: Vec<Pt2> = pixels.iter().map(|p| seed.undistort_pixel(p)).collect();
    let init_pose = dlt_homography(&plane, &ideal)
        .context("reticle homography")
        .and_then(|h| {
            estimate_planar_pose_from_h(&seed.k_matrix(), &h).context("pose from homography")
        })
        .map_err(|e| CalibError::solver(e, None))?;

    let dataset = ReticleObservations::new(object, pixels)
        .map_err(|e| CalibError::solver(e, None))?;
    let init = IntrinsicsInit {
        intrinsics: *seed,
        pose: init_pose,
    };
    let opts = IntrinsicsSolveOptions {
        mode: config.mode,
        robust_loss: config.robust_loss,
    };
    let result = optimize_intrinsics(&dataset, &init, &opts, solver)
        .with_context(|| format!("reticle calibration of camera {camera_id}"))
        .map_err(|e| {
            CalibError::solver(e, Some(iso3_to_se3_dvec(&init_pose).as_slice().to_vec()))
        })?;

    log::info!(
        "camera {camera_id}: reticle calibration rms {:.3} px",
        result.rms_px
    );

    Ok(IntrinsicCalibration {
        camera_id: camera_id.to_string(),
        rms_px: result.rms_px,
        intrinsics: result.intrinsics,
        pose: CameraPose::new(result.pose),
        image_size: config.image_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use probecal_core::synthetic;

    #[test]
    fn calibrates_synthetic_camera() {
        let reticle = ReticleObjectPoints::default();
        let cam = synthetic::camera_ring(3, 40.0, 0.9).remove(1);
        let det = cam.detect_reticle(&reticle).unwrap();

        let calib = calibrate_intrinsics(
            &cam.id,
            &det,
            &reticle,
            &IntrinsicConfig::default(),
            &BackendSolveOptions::default(),
        )
        .unwrap();

        assert!(calib.rms_px < 1e-3, "rms {}", calib.rms_px);
        assert!((calib.pose.center() - cam.pose.center()).norm() < 1e-3);
        let (_, k, dist, _, tvec) = calib.to_wire();
        assert_eq!(k[0][0], 1.54e4);
        assert_eq!(k[2][2], 1.0);
        assert_eq!(dist, [0.0; 5]);
        assert!((tvec[2] - cam.pose.tvec().z).abs() < 1e-3);
    }

    #[test]
    fn short_axis_is_a_shape_error() {
        let reticle = ReticleObjectPoints::default();
        let cam = synthetic::camera_ring(1, 40.0, 0.9).remove(0);
        let mut det = cam.detect_reticle(&reticle).unwrap();
        det.x_axis.pop();
        let err = calibrate_intrinsics(
            "cam0",
            &det,
            &reticle,
            &IntrinsicConfig::default(),
            &BackendSolveOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CalibError::InputShape { .. }), "{err:?}");
    }

    #[test]
    fn axis_overlay_starts_at_principal_point() {
        let reticle = ReticleObjectPoints::default();
        let cam = synthetic::camera_ring(1, 40.0, 0.9).remove(0);
        let det = cam.detect_reticle(&reticle).unwrap();
        let calib = calibrate_intrinsics(
            "cam0",
            &det,
            &reticle,
            &IntrinsicConfig::default(),
            &BackendSolveOptions::default(),
        )
        .unwrap();

        let overlay = project_axes(&calib, 5.0).unwrap();
        assert!((overlay.origin - Pt2::new(2000.0, 1500.0)).norm() < 1e-2);
        assert!((overlay.x - overlay.origin).norm() > 100.0);
    }
}
