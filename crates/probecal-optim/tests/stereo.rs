//! Stereo refinement on a synthetic camera pair.

use nalgebra::{Translation3, UnitQuaternion};
use probecal_core::{synthetic, Iso3, Pt2, ReticleObjectPoints, Vec3};
use probecal_optim::backend::BackendSolveOptions;
use probecal_optim::problems::stereo::*;

#[test]
fn stereo_recovers_relative_pose() {
    let cams = synthetic::camera_ring(2, 40.0, 0.9);
    let (a, b) = (&cams[0], &cams[1]);
    let reticle = ReticleObjectPoints::default();
    let pts = reticle.points();
    let pixels = |cam: &synthetic::SyntheticCamera| -> Vec<Pt2> {
        pts.iter().map(|p| cam.project(p).unwrap()).collect()
    };
    let dataset = StereoDataset::new(pts.clone(), pixels(a), pixels(b)).unwrap();

    let gt_rel = a.pose.relative_to(&b.pose);
    let noise = Iso3::from_parts(
        Translation3::new(0.5, 0.2, -0.4),
        UnitQuaternion::from_scaled_axis(Vec3::new(0.01, 0.005, -0.01)),
    );
    let init = StereoInit {
        intrinsics_a: a.intrinsics,
        intrinsics_b: b.intrinsics,
        pose_a: noise * a.pose.cam_se3_world,
        a_to_b: gt_rel * noise,
    };

    let result = optimize_stereo(
        &dataset,
        &init,
        &StereoSolveOptions::default(),
        &BackendSolveOptions::default(),
    )
    .unwrap();

    assert!(result.rms_px < 1e-3, "rms {}", result.rms_px);
    assert!((result.a_to_b.translation.vector - gt_rel.translation.vector).norm() < 1e-3);
    assert!(result.a_to_b.rotation.angle_to(&gt_rel.rotation) < 1e-5);
    assert!(
        (result.pose_a.translation.vector - a.pose.cam_se3_world.translation.vector).norm() < 1e-3
    );
}
