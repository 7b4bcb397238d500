//! Bundle adjustment over a probe's accumulated observations.
//!
//! Camera vectors (see [`BundleCamera`]) and 3D points in micrometres are
//! refined jointly. The solve runs in rounds of a few LM iterations so that a
//! caller can cancel between rounds through an [`AtomicBool`].

use crate::backend::{solve, BackendSolveOptions};
use crate::factors::reprojection_model::bundle_residual;
use crate::ir::{Manifold, Measurement, ProblemIR, RobustLoss};
use crate::params::bundle_camera::BundleCamera;
use anyhow::{ensure, Result};
use nalgebra::DVector;
use probecal_core::{Pt2, Pt3, Real};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// One pixel measurement of point `point` by camera `camera`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BundleObservation {
    pub camera: usize,
    pub point: usize,
    pub uv: Pt2,
}

#[derive(Debug, Clone)]
pub struct BundleDataset {
    pub cameras: Vec<BundleCamera>,
    /// Initial points in micrometres.
    pub points: Vec<Pt3>,
    pub observations: Vec<BundleObservation>,
}

impl BundleDataset {
    pub fn new(
        cameras: Vec<BundleCamera>,
        points: Vec<Pt3>,
        observations: Vec<BundleObservation>,
    ) -> Result<Self> {
        ensure!(!cameras.is_empty(), "need at least one camera");
        ensure!(!observations.is_empty(), "need at least one observation");
        for (idx, obs) in observations.iter().enumerate() {
            ensure!(
                obs.camera < cameras.len(),
                "observation {} references camera {} of {}",
                idx,
                obs.camera,
                cameras.len()
            );
            ensure!(
                obs.point < points.len(),
                "observation {} references point {} of {}",
                idx,
                obs.point,
                points.len()
            );
        }
        Ok(Self {
            cameras,
            points,
            observations,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleSolveOptions {
    pub robust_loss: RobustLoss,
    /// Upper bound on solver rounds; the cancel flag is checked before each.
    pub max_rounds: usize,
    /// LM iterations per round.
    pub iters_per_round: usize,
    /// Stop once a round improves the mean squared residual by less than this
    /// fraction.
    pub min_rel_improvement: f64,
}

impl Default for BundleSolveOptions {
    fn default() -> Self {
        Self {
            robust_loss: RobustLoss::None,
            max_rounds: 10,
            iters_per_round: 20,
            min_rel_improvement: 1e-4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BundleResult {
    pub cameras: Vec<BundleCamera>,
    /// Refined points in micrometres.
    pub points: Vec<Pt3>,
    /// `Σ r² / n_obs` before the first round.
    pub initial_mean_sq: Real,
    /// `Σ r² / n_obs` after the last completed round.
    pub final_mean_sq: Real,
    pub rounds: usize,
    /// `true` when the cancel flag stopped the solve early.
    pub cancelled: bool,
}

fn camera_key(idx: usize) -> String {
    format!("camera/{idx}")
}

fn point_key(idx: usize) -> String {
    format!("point/{idx}")
}

/// Mean squared reprojection residual `Σ r² / n_obs`.
pub fn bundle_mean_sq_residual(
    cameras: &[BundleCamera],
    points: &[Pt3],
    observations: &[BundleObservation],
) -> Real {
    if observations.is_empty() {
        return 0.0;
    }
    let cam_vecs: Vec<DVector<f64>> = cameras.iter().map(BundleCamera::to_dvec).collect();
    let sum_sq: Real = observations
        .iter()
        .map(|obs| {
            let p = &points[obs.point];
            let cam = &cameras[obs.camera];
            bundle_residual(
                &cam_vecs[obs.camera],
                &nalgebra::dvector![p.x, p.y, p.z],
                [obs.uv.x, obs.uv.y],
                cam.principal_point,
            )
            .norm_squared()
        })
        .sum();
    sum_sq / observations.len() as Real
}

pub fn build_bundle_ir(
    dataset: &BundleDataset,
    opts: &BundleSolveOptions,
) -> Result<(ProblemIR, HashMap<String, DVector<f64>>)> {
    let mut ir = ProblemIR::new();
    let mut initial_map = HashMap::new();

    let camera_ids: Vec<_> = dataset
        .cameras
        .iter()
        .enumerate()
        .map(|(idx, cam)| {
            let key = camera_key(idx);
            let id = ir.add_param(&key, BundleCamera::DIM, Manifold::Euclidean, false);
            initial_map.insert(key, cam.to_dvec());
            id
        })
        .collect();

    let point_ids: Vec<_> = dataset
        .points
        .iter()
        .enumerate()
        .map(|(idx, p)| {
            let key = point_key(idx);
            let id = ir.add_param(&key, 3, Manifold::Euclidean, false);
            initial_map.insert(key, nalgebra::dvector![p.x, p.y, p.z]);
            id
        })
        .collect();

    for obs in &dataset.observations {
        ir.add_residual(
            vec![camera_ids[obs.camera], point_ids[obs.point]],
            Measurement::BundlePoint {
                uv: [obs.uv.x, obs.uv.y],
                principal_point: dataset.cameras[obs.camera].principal_point,
                w: 1.0,
            },
            opts.robust_loss,
        );
    }

    ir.validate()?;
    Ok((ir, initial_map))
}

/// Run bundle adjustment, checking `cancel` before every round.
///
/// A cancelled run returns the state after the last completed round with
/// `cancelled` set.
pub fn optimize_bundle(
    dataset: &BundleDataset,
    opts: &BundleSolveOptions,
    backend_opts: &BackendSolveOptions,
    cancel: Option<&AtomicBool>,
) -> Result<BundleResult> {
    let mut cameras = dataset.cameras.clone();
    let mut points = dataset.points.clone();
    let initial_mean_sq = bundle_mean_sq_residual(&cameras, &points, &dataset.observations);
    let mut current = initial_mean_sq;
    let mut rounds = 0;
    let mut cancelled = false;

    let round_opts = BackendSolveOptions {
        max_iters: opts.iters_per_round.max(1),
        ..backend_opts.clone()
    };

    while rounds < opts.max_rounds {
        if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            log::info!("bundle adjustment cancelled after {rounds} rounds");
            cancelled = true;
            break;
        }

        let round_data = BundleDataset {
            cameras: cameras.clone(),
            points: points.clone(),
            observations: dataset.observations.clone(),
        };
        let (ir, initial_map) = build_bundle_ir(&round_data, opts)?;
        let solution = solve(&ir, &initial_map, &round_opts)?;

        for (idx, cam) in cameras.iter_mut().enumerate() {
            let v = solution.param(&camera_key(idx))?;
            *cam = cam.with_dvec(v.as_view())?;
        }
        for (idx, p) in points.iter_mut().enumerate() {
            let v = solution.param(&point_key(idx))?;
            *p = Pt3::new(v[0], v[1], v[2]);
        }
        rounds += 1;

        let next = bundle_mean_sq_residual(&cameras, &points, &dataset.observations);
        log::debug!("bundle round {rounds}: mean sq residual {current:.6} -> {next:.6}");
        let improvement = (current - next) / current.max(Real::EPSILON);
        current = next;
        if improvement < opts.min_rel_improvement {
            break;
        }
    }

    Ok(BundleResult {
        cameras,
        points,
        initial_mean_sq,
        final_mean_sq: current,
        rounds,
        cancelled,
    })
}
