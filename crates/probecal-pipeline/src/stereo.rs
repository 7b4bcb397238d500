//! Stereo calibration of a camera pair and the operations on a calibrated pair.

use anyhow::Context;
use probecal_core::{
    projection_matrix, AxisDetections, CalibError, CalibResult, CameraIntrinsics, CameraPose,
    Iso3, Mat3, Mat34, Pt2, Pt3, Real, ReticleObjectPoints, Vec3,
};
use probecal_linear::{
    essential_from_rt, fundamental_from_essential, triangulate_point_linear, TriangulationError,
};
use probecal_optim::params::pose_se3::iso3_to_se3_dvec;
use probecal_optim::problems::stereo::{
    optimize_stereo, StereoDataset, StereoInit, StereoSolveOptions,
};
use probecal_optim::{BackendSolveOptions, RobustLoss};
use serde::{Deserialize, Serialize};

use crate::intrinsic::IntrinsicCalibration;

/// A calibrated camera pair.
///
/// Camera A always has the lexicographically smaller id. Both projection
/// matrices are built from the same `r_ab`/`t_ab`, with camera A at the origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StereoPair {
    pub camera_a: String,
    pub camera_b: String,
    pub intrinsics_a: CameraIntrinsics,
    pub intrinsics_b: CameraIntrinsics,
    /// Reticle frame in camera A.
    pub pose_a: CameraPose,
    pub r_ab: Mat3,
    pub t_ab: Vec3,
    pub essential: Mat3,
    /// Scaled so the largest absolute entry is 1.
    pub fundamental: Mat3,
    pub p_a: Mat34,
    pub p_b: Mat34,
    /// Reprojection RMS over both cameras, in pixels.
    pub rms_px: Real,
}

/// Accuracy of a pair measured on the reticle it was calibrated on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelfTestReport {
    /// Mean distance between triangulated and true reticle points, in mm.
    pub mean_error_mm: Real,
    /// Per-axis RMS of the triangulation error, in mm.
    pub rms_per_axis_mm: [Real; 3],
    /// Mean pixel distance between projected reticle points and camera A detections.
    pub mean_px_error_a: Real,
    pub mean_px_error_b: Real,
}

impl StereoPair {
    /// Assemble a pair from refined geometry.
    pub fn from_geometry(
        camera_a: &str,
        camera_b: &str,
        intrinsics_a: CameraIntrinsics,
        intrinsics_b: CameraIntrinsics,
        pose_a: CameraPose,
        a_to_b: &Iso3,
        rms_px: Real,
    ) -> CalibResult<Self> {
        let r_ab = a_to_b.rotation.to_rotation_matrix().into_inner();
        let t_ab = a_to_b.translation.vector;
        let essential = essential_from_rt(&r_ab, &t_ab);
        let fundamental = fundamental_from_essential(
            &intrinsics_a.k_matrix(),
            &intrinsics_b.k_matrix(),
            &essential,
        )
        .context("fundamental matrix")
        .map_err(|e| CalibError::solver(e, None))?;

        Ok(Self {
            camera_a: camera_a.to_string(),
            camera_b: camera_b.to_string(),
            p_a: projection_matrix(&intrinsics_a.k_matrix(), &Mat3::identity(), &Vec3::zeros()),
            p_b: projection_matrix(&intrinsics_b.k_matrix(), &r_ab, &t_ab),
            intrinsics_a,
            intrinsics_b,
            pose_a,
            r_ab,
            t_ab,
            essential,
            fundamental,
            rms_px,
        })
    }

    /// Canonical store key.
    pub fn key(&self) -> (String, String) {
        (self.camera_a.clone(), self.camera_b.clone())
    }

    /// Transform from camera A into camera B.
    pub fn a_to_b(&self) -> Iso3 {
        CameraPose::from_rotation_translation(&self.r_ab, &self.t_ab).cam_se3_world
    }

    /// Reticle frame in camera B.
    pub fn pose_b(&self) -> CameraPose {
        CameraPose::new(self.a_to_b() * self.pose_a.cam_se3_world)
    }

    /// Triangulate one point seen by both cameras. Result is in the camera A
    /// frame, millimetres.
    pub fn triangulate(&self, px_a: &Pt2, px_b: &Pt2) -> Result<Pt3, TriangulationError> {
        let ideal = [
            self.intrinsics_a.undistort_pixel(px_a),
            self.intrinsics_b.undistort_pixel(px_b),
        ];
        triangulate_point_linear(&[self.p_a, self.p_b], &ideal)
    }

    /// Triangulate one point into the reticle frame, millimetres.
    pub fn global_coords(&self, px_a: &Pt2, px_b: &Pt2) -> Result<Pt3, TriangulationError> {
        let x_a = self.triangulate(px_a, px_b)?;
        Ok(self.pose_a.camera_to_world(&x_a))
    }

    /// Triangulate every reticle tick and compare against the known layout.
    pub fn self_test(
        &self,
        det_a: &AxisDetections,
        det_b: &AxisDetections,
        reticle: &ReticleObjectPoints,
    ) -> CalibResult<SelfTestReport> {
        det_a.validate(reticle)?;
        det_b.validate(reticle)?;

        let object = reticle.points();
        let pts_a = det_a.points();
        let pts_b = det_b.points();
        let pose_b = self.pose_b();
        let n = object.len() as Real;

        let mut sum_dist = 0.0;
        let mut sum_sq = Vec3::zeros();
        let mut px_a = 0.0;
        let mut px_b = 0.0;
        for ((pw, ua), ub) in object.iter().zip(&pts_a).zip(&pts_b) {
            let xg = self
                .global_coords(ua, ub)
                .context("reticle self-test")
                .map_err(|e| CalibError::solver(e, None))?;
            let d = xg - *pw;
            sum_dist += d.norm();
            sum_sq += d.component_mul(&d);

            px_a += reprojection_distance(&self.intrinsics_a, &self.pose_a, pw, ua);
            px_b += reprojection_distance(&self.intrinsics_b, &pose_b, pw, ub);
        }

        let rms = (sum_sq / n).map(Real::sqrt);
        Ok(SelfTestReport {
            mean_error_mm: sum_dist / n,
            rms_per_axis_mm: [rms.x, rms.y, rms.z],
            mean_px_error_a: px_a / n,
            mean_px_error_b: px_b / n,
        })
    }

    /// Project the reticle through both cameras. `None` if any tick lands
    /// behind either camera.
    pub fn reticle_pixels(&self, reticle: &ReticleObjectPoints) -> Option<(Vec<Pt2>, Vec<Pt2>)> {
        let pose_b = self.pose_b();
        let object = reticle.points();
        let a = object
            .iter()
            .map(|p| self.intrinsics_a.project_world(&self.pose_a, p))
            .collect::<Option<Vec<_>>>()?;
        let b = object
            .iter()
            .map(|p| self.intrinsics_b.project_world(&pose_b, p))
            .collect::<Option<Vec<_>>>()?;
        Some((a, b))
    }
}

fn reprojection_distance(
    intrinsics: &CameraIntrinsics,
    pose: &CameraPose,
    pw: &Pt3,
    observed: &Pt2,
) -> Real {
    intrinsics
        .project_world(pose, pw)
        .map_or(Real::INFINITY, |p| (p - *observed).norm())
}

/// Jointly calibrate two cameras from one reticle event.
///
/// The inputs may come in either order; the result is always keyed with the
/// smaller id as camera A.
pub fn calibrate_stereo(
    first: (&IntrinsicCalibration, &AxisDetections),
    second: (&IntrinsicCalibration, &AxisDetections),
    reticle: &ReticleObjectPoints,
    robust_loss: RobustLoss,
    solver: &BackendSolveOptions,
) -> CalibResult<StereoPair> {
    let ((calib_a, det_a), (calib_b, det_b)) = if first.0.camera_id <= second.0.camera_id {
        (first, second)
    } else {
        (second, first)
    };
    det_a.validate(reticle)?;
    det_b.validate(reticle)?;

    let init = StereoInit {
        intrinsics_a: calib_a.intrinsics,
        intrinsics_b: calib_b.intrinsics,
        pose_a: calib_a.pose.cam_se3_world,
        a_to_b: calib_a.pose.relative_to(&calib_b.pose),
    };
    let last_estimate = || {
        let mut v = iso3_to_se3_dvec(&init.pose_a).as_slice().to_vec();
        v.extend_from_slice(iso3_to_se3_dvec(&init.a_to_b).as_slice());
        v
    };

    let dataset = StereoDataset::new(reticle.points(), det_a.points(), det_b.points())
        .map_err(|e| CalibError::solver(e, None))?;
    let result = optimize_stereo(&dataset, &init, &StereoSolveOptions { robust_loss }, solver)
        .with_context(|| {
            format!(
                "stereo calibration of {} and {}",
                calib_a.camera_id, calib_b.camera_id
            )
        })
        .map_err(|e| CalibError::solver(e, Some(last_estimate())))?;

    log::info!(
        "stereo {}-{}: rms {:.3} px",
        calib_a.camera_id,
        calib_b.camera_id,
        result.rms_px
    );

    StereoPair::from_geometry(
        &calib_a.camera_id,
        &calib_b.camera_id,
        calib_a.intrinsics,
        calib_b.intrinsics,
        CameraPose::new(result.pose_a),
        &result.a_to_b,
        result.rms_px,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntrinsicConfig;
    use crate::intrinsic::calibrate_intrinsics;
    use probecal_core::{synthetic, to_homogeneous};

    fn calibrated(
        cam: &synthetic::SyntheticCamera,
        reticle: &ReticleObjectPoints,
    ) -> (IntrinsicCalibration, AxisDetections) {
        let det = cam.detect_reticle(reticle).unwrap();
        let calib = calibrate_intrinsics(
            &cam.id,
            &det,
            reticle,
            &IntrinsicConfig::default(),
            &BackendSolveOptions::default(),
        )
        .unwrap();
        (calib, det)
    }

    #[test]
    fn pair_triangulates_synthetic_point() {
        let reticle = ReticleObjectPoints::default();
        let cams = synthetic::camera_ring(3, 40.0, 0.9);
        let (ca, da) = calibrated(&cams[0], &reticle);
        let (cb, db) = calibrated(&cams[1], &reticle);

        let pair = calibrate_stereo(
            (&ca, &da),
            (&cb, &db),
            &reticle,
            RobustLoss::None,
            &BackendSolveOptions::default(),
        )
        .unwrap();
        assert!(pair.rms_px < 1e-3, "rms {}", pair.rms_px);

        let pw = Pt3::new(0.7, -0.4, 0.3);
        let ua = cams[0].project(&pw).unwrap();
        let ub = cams[1].project(&pw).unwrap();
        let xg = pair.global_coords(&ua, &ub).unwrap();
        assert!((xg - pw).norm() < 1e-4, "{xg:?}");

        let x_a = pair.triangulate(&ua, &ub).unwrap();
        assert!((x_a - cams[0].pose.world_to_camera(&pw)).norm() < 1e-4);

        let line = pair.fundamental * to_homogeneous(&ua);
        let dist = to_homogeneous(&ub).dot(&line).abs() / line.xy().norm();
        assert!(dist < 1e-3, "epipolar distance {dist}");
        assert!((pair.fundamental.amax() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn swapped_inputs_give_canonical_pair() {
        let reticle = ReticleObjectPoints::default();
        let cams = synthetic::camera_ring(3, 40.0, 0.9);
        let (ca, da) = calibrated(&cams[0], &reticle);
        let (cb, db) = calibrated(&cams[2], &reticle);

        let pair = calibrate_stereo(
            (&cb, &db),
            (&ca, &da),
            &reticle,
            RobustLoss::None,
            &BackendSolveOptions::default(),
        )
        .unwrap();
        assert_eq!(pair.key(), ("cam0".to_string(), "cam2".to_string()));
        assert!((pair.pose_b().center() - cams[2].pose.center()).norm() < 1e-3);
    }

    #[test]
    fn self_test_and_debug_points() {
        let reticle = ReticleObjectPoints::default();
        let cams = synthetic::camera_ring(3, 40.0, 0.9);
        let (ca, da) = calibrated(&cams[1], &reticle);
        let (cb, db) = calibrated(&cams[2], &reticle);
        let pair = calibrate_stereo(
            (&ca, &da),
            (&cb, &db),
            &reticle,
            RobustLoss::None,
            &BackendSolveOptions::default(),
        )
        .unwrap();

        let report = pair.self_test(&da, &db, &reticle).unwrap();
        assert!(report.mean_error_mm < 1e-4, "{report:?}");
        assert!(report.rms_per_axis_mm.iter().all(|v| *v < 1e-4));
        assert!(report.mean_px_error_a < 1e-3 && report.mean_px_error_b < 1e-3);

        let (pa, pb) = pair.reticle_pixels(&reticle).unwrap();
        assert_eq!(pa.len(), 42);
        assert!((pa[5] - da.points()[5]).norm() < 1e-3);
        assert!((pb[30] - db.points()[30]).norm() < 1e-3);

        let mut short = db.clone();
        short.y_axis.truncate(3);
        assert!(matches!(
            pair.self_test(&da, &short, &reticle),
            Err(CalibError::InputShape { .. })
        ));
    }
}
