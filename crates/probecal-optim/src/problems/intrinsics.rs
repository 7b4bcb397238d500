//! Single-image reticle calibration.
//!
//! Refines the pose of one camera relative to the reticle (and, in
//! [`IntrinsicsMode::WithDistortion`], the distortion coefficients) from the
//! detected axis ticks. Focal length and principal point stay at their seed.

use crate::backend::{solve, BackendSolveOptions};
use crate::factors::reprojection_model::reticle_residual;
use crate::ir::{Manifold, Measurement, ProblemIR, RobustLoss};
use crate::params::distortion::BrownConrady5Params;
use crate::params::intrinsics::Intrinsics4;
use crate::params::pose_se3::{iso3_to_se3_dvec, se3_dvec_to_iso3};
use anyhow::{ensure, Result};
use nalgebra::DVector;
use probecal_core::{CameraIntrinsics, Iso3, Pt2, Pt3, Real};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which parameters are free during the refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntrinsicsMode {
    /// Only the pose is estimated.
    #[default]
    PoseOnly,
    /// Pose plus all five distortion coefficients.
    WithDistortion,
}

/// Reticle points and their detections in one image.
#[derive(Debug, Clone)]
pub struct ReticleObservations {
    pub points_3d: Vec<Pt3>,
    pub points_2d: Vec<Pt2>,
    pub weights: Option<Vec<f64>>,
}

impl ReticleObservations {
    pub fn new(points_3d: Vec<Pt3>, points_2d: Vec<Pt2>) -> Result<Self> {
        ensure!(
            points_3d.len() == points_2d.len(),
            "3D/2D point count mismatch: {} vs {}",
            points_3d.len(),
            points_2d.len()
        );
        ensure!(
            points_3d.len() >= 4,
            "need at least 4 points, got {}",
            points_3d.len()
        );
        Ok(Self {
            points_3d,
            points_2d,
            weights: None,
        })
    }

    pub fn len(&self) -> usize {
        self.points_3d.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points_3d.is_empty()
    }

    pub fn weight(&self, idx: usize) -> f64 {
        self.weights.as_ref().map_or(1.0, |w| w[idx])
    }
}

#[derive(Debug, Clone)]
pub struct IntrinsicsInit {
    pub intrinsics: CameraIntrinsics,
    /// Reticle to camera.
    pub pose: Iso3,
}

#[derive(Debug, Clone, Default)]
pub struct IntrinsicsSolveOptions {
    pub mode: IntrinsicsMode,
    pub robust_loss: RobustLoss,
}

#[derive(Debug, Clone)]
pub struct IntrinsicsResult {
    pub intrinsics: CameraIntrinsics,
    pub pose: Iso3,
    pub final_cost: f64,
    /// `sqrt(Σ|r|² / N)` over all points, in pixels.
    pub rms_px: Real,
}

/// Build IR for reticle calibration.
pub fn build_intrinsics_ir(
    dataset: &ReticleObservations,
    initial: &IntrinsicsInit,
    opts: &IntrinsicsSolveOptions,
) -> Result<(ProblemIR, HashMap<String, DVector<f64>>)> {
    let mut ir = ProblemIR::new();
    let mut initial_map = HashMap::new();

    let cam_id = ir.add_param("cam", Intrinsics4::DIM, Manifold::Euclidean, true);
    initial_map.insert(
        "cam".to_string(),
        Intrinsics4::from_core(&initial.intrinsics.k).to_dvec(),
    );

    let dist_fixed = matches!(opts.mode, IntrinsicsMode::PoseOnly);
    let dist_id = ir.add_param("dist", BrownConrady5Params::DIM, Manifold::Euclidean, dist_fixed);
    initial_map.insert(
        "dist".to_string(),
        BrownConrady5Params::from_core(&initial.intrinsics.dist).to_dvec(),
    );

    let pose_id = ir.add_param("pose", 7, Manifold::Se3, false);
    initial_map.insert("pose".to_string(), iso3_to_se3_dvec(&initial.pose));

    for (idx, (pw, uv)) in dataset
        .points_3d
        .iter()
        .zip(&dataset.points_2d)
        .enumerate()
    {
        ir.add_residual(
            vec![cam_id, dist_id, pose_id],
            Measurement::ReticlePoint {
                pw: [pw.x, pw.y, pw.z],
                uv: [uv.x, uv.y],
                w: dataset.weight(idx),
            },
            opts.robust_loss,
        );
    }

    ir.validate()?;
    Ok((ir, initial_map))
}

/// Pixel RMS of the reticle reprojection for a parameter set.
pub fn reticle_rms(
    dataset: &ReticleObservations,
    cam: &DVector<f64>,
    dist: &DVector<f64>,
    pose: &DVector<f64>,
) -> Real {
    if dataset.is_empty() {
        return 0.0;
    }
    let sum_sq: Real = dataset
        .points_3d
        .iter()
        .zip(&dataset.points_2d)
        .map(|(pw, uv)| {
            reticle_residual(cam, dist, pose, [pw.x, pw.y, pw.z], [uv.x, uv.y])
                .norm_squared()
        })
        .sum();
    (sum_sq / dataset.len() as Real).sqrt()
}

/// Refine the reticle pose (and distortion when requested).
pub fn optimize_intrinsics(
    dataset: &ReticleObservations,
    initial: &IntrinsicsInit,
    opts: &IntrinsicsSolveOptions,
    backend_opts: &BackendSolveOptions,
) -> Result<IntrinsicsResult> {
    let (ir, initial_map) = build_intrinsics_ir(dataset, initial, opts)?;
    let solution = solve(&ir, &initial_map, backend_opts)?;

    let get = |key: &str| solution.param(key);
    let cam = get("cam")?;
    let dist = get("dist")?;
    let pose_vec = get("pose")?;

    let rms_px = reticle_rms(dataset, cam, dist, pose_vec);
    let intrinsics = CameraIntrinsics::new(
        Intrinsics4::from_dvec(cam.as_view())?.to_core(),
        BrownConrady5Params::from_dvec(dist.as_view())?.to_core(&initial.intrinsics.dist),
    );
    let pose = se3_dvec_to_iso3(pose_vec.as_view())?;
    log::debug!(
        "reticle refinement ({:?}): rms {:.4} px, cost {:.4e}",
        opts.mode,
        rms_px,
        solution.final_cost
    );

    Ok(IntrinsicsResult {
        intrinsics,
        pose,
        final_cost: solution.final_cost,
        rms_px,
    })
}
