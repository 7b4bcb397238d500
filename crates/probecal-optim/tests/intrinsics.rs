//! Reticle refinement on synthetic cameras.

use nalgebra::{Translation3, UnitQuaternion, Vector2};
use probecal_core::{synthetic, BrownConrady5, CameraIntrinsics, Iso3, ReticleObjectPoints, Vec3};
use probecal_optim::backend::BackendSolveOptions;
use probecal_optim::problems::intrinsics::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn perturb(pose: &Iso3) -> Iso3 {
    let delta = Iso3::from_parts(
        Translation3::new(0.3, -0.2, 1.5),
        UnitQuaternion::from_scaled_axis(Vec3::new(0.01, -0.02, 0.015)),
    );
    delta * pose
}

fn dataset_for(intrinsics: &CameraIntrinsics, pose: &Iso3) -> ReticleObservations {
    let reticle = ReticleObjectPoints::default();
    let pts = reticle.points();
    let pixels = pts
        .iter()
        .map(|p| intrinsics.project_point_c(&(pose * p).coords).unwrap())
        .collect();
    ReticleObservations::new(pts, pixels).unwrap()
}

#[test]
fn pose_only_recovers_pose() {
    let cam = synthetic::camera_ring(1, 40.0, 0.9).remove(0);
    let gt = cam.pose.cam_se3_world;
    let dataset = dataset_for(&cam.intrinsics, &gt);

    let init = IntrinsicsInit {
        intrinsics: cam.intrinsics,
        pose: perturb(&gt),
    };
    let result = optimize_intrinsics(
        &dataset,
        &init,
        &IntrinsicsSolveOptions::default(),
        &BackendSolveOptions::default(),
    )
    .unwrap();

    assert!(result.rms_px < 1e-3, "rms {}", result.rms_px);
    assert!((result.pose.translation.vector - gt.translation.vector).norm() < 1e-3);
    assert!(result.pose.rotation.angle_to(&gt.rotation) < 1e-5);
    // intrinsics stay at the seed in this mode
    assert_eq!(result.intrinsics.k, cam.intrinsics.k);
    assert!(result.intrinsics.dist.is_zero());
}

#[test]
fn noisy_detections_reach_the_least_squares_minimum() {
    let cam = synthetic::camera_ring(1, 40.0, 0.9).remove(0);
    let gt = cam.pose.cam_se3_world;
    let clean = dataset_for(&cam.intrinsics, &gt);

    for seed in 0..3 {
        let mut rng = StdRng::seed_from_u64(seed);
        let noisy: Vec<_> = clean
            .points_2d
            .iter()
            .map(|p| {
                let noise = Vector2::new(rng.random_range(-0.5..0.5), rng.random_range(-0.5..0.5));
                p + noise
            })
            .collect();
        let dataset = ReticleObservations::new(clean.points_3d.clone(), noisy.clone()).unwrap();

        let sum_sq: f64 = clean
            .points_3d
            .iter()
            .zip(&noisy)
            .map(|(pw, uv)| {
                let px = cam.intrinsics.project_point_c(&(gt * pw).coords).unwrap();
                (px - *uv).norm_squared()
            })
            .sum();
        let rms_at_truth = (sum_sq / noisy.len() as f64).sqrt();

        let init = IntrinsicsInit {
            intrinsics: cam.intrinsics,
            pose: perturb(&gt),
        };
        let result = optimize_intrinsics(
            &dataset,
            &init,
            &IntrinsicsSolveOptions::default(),
            &BackendSolveOptions::default(),
        )
        .unwrap();

        assert!(
            result.rms_px <= rms_at_truth + 1e-6,
            "seed {seed}: rms {} above rms at the true pose {}",
            result.rms_px,
            rms_at_truth
        );
    }
}

#[test]
fn freeing_distortion_reduces_error_on_distorted_data() {
    let cam = synthetic::camera_ring(1, 40.0, 0.9).remove(0);
    let gt = cam.pose.cam_se3_world;
    let mut distorted = cam.intrinsics;
    distorted.dist = BrownConrady5::from_opencv([-0.8, 0.0, 0.0, 0.0, 0.0]);
    let dataset = dataset_for(&distorted, &gt);

    let init = IntrinsicsInit {
        intrinsics: cam.intrinsics,
        pose: gt,
    };
    let pose_only = optimize_intrinsics(
        &dataset,
        &init,
        &IntrinsicsSolveOptions::default(),
        &BackendSolveOptions::default(),
    )
    .unwrap();
    let with_dist = optimize_intrinsics(
        &dataset,
        &init,
        &IntrinsicsSolveOptions {
            mode: IntrinsicsMode::WithDistortion,
            ..Default::default()
        },
        &BackendSolveOptions::default(),
    )
    .unwrap();

    assert!(
        with_dist.rms_px < pose_only.rms_px,
        "{} vs {}",
        with_dist.rms_px,
        pose_only.rms_px
    );
    assert!(!with_dist.intrinsics.dist.is_zero());
}

#[test]
fn mismatched_counts_are_rejected() {
    let reticle = ReticleObjectPoints::default();
    let err = ReticleObservations::new(reticle.points(), vec![]).unwrap_err();
    assert!(err.to_string().contains("mismatch"));
}
