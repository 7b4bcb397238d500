//! Stereo refinement of a camera pair viewing the reticle.
//!
//! Both cameras keep their intrinsics. The free parameters are camera A's pose
//! relative to the reticle and the transform from camera A to camera B, so the
//! pair geometry is estimated from both images at once.

use crate::backend::{solve, BackendSolveOptions};
use crate::factors::reprojection_model::{
    paired_reticle_residual, reticle_residual,
};
use crate::ir::{Manifold, Measurement, ProblemIR, RobustLoss};
use crate::params::distortion::BrownConrady5Params;
use crate::params::intrinsics::Intrinsics4;
use crate::params::pose_se3::{iso3_to_se3_dvec, se3_dvec_to_iso3};
use anyhow::{ensure, Result};
use nalgebra::DVector;
use probecal_core::{CameraIntrinsics, Iso3, Pt2, Pt3, Real};
use std::collections::HashMap;

/// Reticle points seen by both cameras in the same calibration event.
#[derive(Debug, Clone)]
pub struct StereoDataset {
    pub points_3d: Vec<Pt3>,
    pub pixels_a: Vec<Pt2>,
    pub pixels_b: Vec<Pt2>,
}

impl StereoDataset {
    pub fn new(points_3d: Vec<Pt3>, pixels_a: Vec<Pt2>, pixels_b: Vec<Pt2>) -> Result<Self> {
        ensure!(
            points_3d.len() == pixels_a.len() && points_3d.len() == pixels_b.len(),
            "stereo point count mismatch: {} object, {} A, {} B",
            points_3d.len(),
            pixels_a.len(),
            pixels_b.len()
        );
        ensure!(
            points_3d.len() >= 4,
            "need at least 4 points, got {}",
            points_3d.len()
        );
        Ok(Self {
            points_3d,
            pixels_a,
            pixels_b,
        })
    }

    pub fn len(&self) -> usize {
        self.points_3d.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points_3d.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct StereoInit {
    pub intrinsics_a: CameraIntrinsics,
    pub intrinsics_b: CameraIntrinsics,
    /// Reticle to camera A.
    pub pose_a: Iso3,
    /// Camera A to camera B.
    pub a_to_b: Iso3,
}

#[derive(Debug, Clone, Default)]
pub struct StereoSolveOptions {
    pub robust_loss: RobustLoss,
}

#[derive(Debug, Clone)]
pub struct StereoResult {
    pub pose_a: Iso3,
    pub a_to_b: Iso3,
    pub final_cost: f64,
    /// RMS over the residuals of both cameras, in pixels.
    pub rms_px: Real,
}

pub fn build_stereo_ir(
    dataset: &StereoDataset,
    initial: &StereoInit,
    opts: &StereoSolveOptions,
) -> Result<(ProblemIR, HashMap<String, DVector<f64>>)> {
    let mut ir = ProblemIR::new();
    let mut initial_map = HashMap::new();

    let mut add_camera = |ir: &mut ProblemIR, suffix: &str, intr: &CameraIntrinsics| {
        let cam_key = format!("cam/{suffix}");
        let dist_key = format!("dist/{suffix}");
        let cam = ir.add_param(&cam_key, Intrinsics4::DIM, Manifold::Euclidean, true);
        let dist = ir.add_param(&dist_key, BrownConrady5Params::DIM, Manifold::Euclidean, true);
        initial_map.insert(cam_key, Intrinsics4::from_core(&intr.k).to_dvec());
        initial_map.insert(dist_key, BrownConrady5Params::from_core(&intr.dist).to_dvec());
        (cam, dist)
    };
    let (cam_a, dist_a) = add_camera(&mut ir, "a", &initial.intrinsics_a);
    let (cam_b, dist_b) = add_camera(&mut ir, "b", &initial.intrinsics_b);

    let pose_a = ir.add_param("pose_a", 7, Manifold::Se3, false);
    let a_to_b = ir.add_param("a_to_b", 7, Manifold::Se3, false);
    initial_map.insert("pose_a".to_string(), iso3_to_se3_dvec(&initial.pose_a));
    initial_map.insert("a_to_b".to_string(), iso3_to_se3_dvec(&initial.a_to_b));

    for ((pw, ua), ub) in dataset
        .points_3d
        .iter()
        .zip(&dataset.pixels_a)
        .zip(&dataset.pixels_b)
    {
        let pw = [pw.x, pw.y, pw.z];
        ir.add_residual(
            vec![cam_a, dist_a, pose_a],
            Measurement::ReticlePoint {
                pw,
                uv: [ua.x, ua.y],
                w: 1.0,
            },
            opts.robust_loss,
        );
        ir.add_residual(
            vec![cam_b, dist_b, a_to_b, pose_a],
            Measurement::PairedReticlePoint {
                pw,
                uv: [ub.x, ub.y],
                w: 1.0,
            },
            opts.robust_loss,
        );
    }

    ir.validate()?;
    Ok((ir, initial_map))
}

/// Jointly refine camera A's pose and the A→B transform.
pub fn optimize_stereo(
    dataset: &StereoDataset,
    initial: &StereoInit,
    opts: &StereoSolveOptions,
    backend_opts: &BackendSolveOptions,
) -> Result<StereoResult> {
    let (ir, initial_map) = build_stereo_ir(dataset, initial, opts)?;
    let solution = solve(&ir, &initial_map, backend_opts)?;

    let get = |key: &str| solution.param(key);
    let pose_a_vec = get("pose_a")?;
    let a_to_b_vec = get("a_to_b")?;
    let (cam_a, dist_a) = (get("cam/a")?, get("dist/a")?);
    let (cam_b, dist_b) = (get("cam/b")?, get("dist/b")?);

    let mut sum_sq = 0.0;
    for ((pw, ua), ub) in dataset
        .points_3d
        .iter()
        .zip(&dataset.pixels_a)
        .zip(&dataset.pixels_b)
    {
        let pw = [pw.x, pw.y, pw.z];
        sum_sq += reticle_residual(cam_a, dist_a, pose_a_vec, pw, [ua.x, ua.y])
            .norm_squared();
        sum_sq += paired_reticle_residual(
            cam_b,
            dist_b,
            a_to_b_vec,
            pose_a_vec,
            pw,
            [ub.x, ub.y],
        )
        .norm_squared();
    }
    let rms_px = (sum_sq / (2 * dataset.len()) as Real).sqrt();
    log::debug!(
        "stereo refinement: rms {:.4} px, cost {:.4e}",
        rms_px,
        solution.final_cost
    );

    Ok(StereoResult {
        pose_a: se3_dvec_to_iso3(pose_a_vec.as_view())?,
        a_to_b: se3_dvec_to_iso3(a_to_b_vec.as_view())?,
        final_cost: solution.final_cost,
        rms_px,
    })
}
