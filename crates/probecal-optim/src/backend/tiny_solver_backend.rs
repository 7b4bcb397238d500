use crate::backend::{BackendSolution, BackendSolveOptions, LinearSolverKind, OptimBackend, ParamMap};
use crate::factors::reprojection_model::{
    bundle_residual_generic, paired_reticle_residual_generic, reticle_residual_generic,
    ReticleSample,
};
use crate::ir::{Manifold, Measurement, ParamBlock, ProblemIR, RobustLoss};
use anyhow::{anyhow, ensure, Result};
use nalgebra::{DVector, RealField};
use std::sync::Arc;
use tiny_solver::factors::{Factor, FactorImpl};
use tiny_solver::linear::sparse::LinearSolverType;
use tiny_solver::loss_functions::{CauchyLoss, HuberLoss, Loss};
use tiny_solver::manifold::se3::SE3Manifold;
use tiny_solver::optimizer::{Optimizer, OptimizerOptions};
use tiny_solver::problem::Problem;
use tiny_solver::LevenbergMarquardtOptimizer;

type BoxedFactor = Box<dyn FactorImpl + Send>;
type BoxedLoss = Box<dyn Loss + Send>;

/// Levenberg-Marquardt through tiny-solver, with SE3 blocks on its manifold.
#[derive(Debug, Clone, Copy, Default)]
pub struct TinySolverBackend;

impl OptimBackend for TinySolverBackend {
    fn solve(
        &self,
        ir: &ProblemIR,
        initial: &ParamMap,
        opts: &BackendSolveOptions,
    ) -> Result<BackendSolution> {
        ir.validate()?;
        for block in &ir.params {
            check_initial(block, initial)?;
        }

        // tiny-solver keeps the Jacobian columns of fixed indices, so held
        // blocks go into the factors as constants and only free blocks are
        // declared as variables.
        let mut problem = Problem::new();
        let mut free = ParamMap::new();
        for residual in &ir.residuals {
            let mut names = Vec::with_capacity(residual.params.len());
            let mut slots = Vec::with_capacity(residual.params.len());
            for id in &residual.params {
                let block = &ir.params[id.0];
                let value = &initial[&block.name];
                if block.fixed {
                    slots.push(Some(value.clone()));
                    continue;
                }
                slots.push(None);
                names.push(block.name.as_str());
                if !free.contains_key(&block.name) {
                    free.insert(block.name.clone(), value.clone());
                    if block.manifold == Manifold::Se3 {
                        problem.set_variable_manifold(&block.name, Arc::new(SE3Manifold));
                    }
                }
            }
            if names.is_empty() {
                continue;
            }
            problem.add_residual_block(
                Measurement::RESIDUAL_DIM,
                &names,
                factor_for(&residual.measurement, slots),
                loss_for(residual.loss)?,
            );
        }
        ensure!(!free.is_empty(), "problem has no free parameter blocks");

        let solution = LevenbergMarquardtOptimizer::default()
            .optimize(&problem, &free, Some(optimizer_options(opts)))
            .ok_or_else(|| anyhow!("tiny-solver did not converge"))?;

        let blocks = problem.initialize_parameter_blocks(&solution);
        let final_cost = 0.5 * problem.compute_residuals(&blocks, true).as_ref().squared_norm_l2();
        log::trace!(
            "tiny-solver: {} residual blocks, {} free blocks, final cost {final_cost:.6e}",
            ir.residuals.len(),
            free.len()
        );

        let mut params = initial.clone();
        params.extend(solution);
        Ok(BackendSolution { params, final_cost })
    }
}

fn check_initial(block: &ParamBlock, initial: &ParamMap) -> Result<()> {
    let init = initial
        .get(&block.name)
        .ok_or_else(|| anyhow!("no initial value for {}", block.name))?;
    ensure!(
        init.len() == block.dim,
        "initial value of {} has {} entries, block has {}",
        block.name,
        init.len(),
        block.dim
    );
    Ok(())
}

fn optimizer_options(opts: &BackendSolveOptions) -> OptimizerOptions {
    OptimizerOptions {
        max_iteration: opts.max_iters,
        verbosity_level: opts.verbosity,
        linear_solver_type: match opts.linear_solver {
            LinearSolverKind::SparseCholesky => LinearSolverType::SparseCholesky,
            LinearSolverKind::SparseQr => LinearSolverType::SparseQR,
        },
        min_abs_error_decrease_threshold: opts.min_abs_decrease,
        min_rel_error_decrease_threshold: opts.min_rel_decrease,
        min_error_threshold: opts.min_error,
        ..OptimizerOptions::default()
    }
}

fn loss_for(loss: RobustLoss) -> Result<Option<BoxedLoss>> {
    Ok(match loss {
        RobustLoss::None => None,
        RobustLoss::Huber { scale } => {
            ensure!(scale > 0.0, "huber scale must be positive, got {scale}");
            Some(Box::new(HuberLoss::new(scale)))
        }
        RobustLoss::Cauchy { scale } => {
            ensure!(scale > 0.0, "cauchy scale must be positive, got {scale}");
            Some(Box::new(CauchyLoss::new(scale)))
        }
    })
}

fn factor_for(measurement: &Measurement, slots: Vec<Option<DVector<f64>>>) -> BoxedFactor {
    match *measurement {
        Measurement::ReticlePoint { pw, uv, w } => {
            pinned(ReticleFactor(ReticleSample { pw, uv, w }), slots)
        }
        Measurement::PairedReticlePoint { pw, uv, w } => {
            pinned(PairedReticleFactor(ReticleSample { pw, uv, w }), slots)
        }
        Measurement::BundlePoint {
            uv,
            principal_point,
            w,
        } => pinned(
            BundleFactor {
                uv,
                principal_point,
                w,
            },
            slots,
        ),
    }
}

fn pinned<F>(inner: F, slots: Vec<Option<DVector<f64>>>) -> BoxedFactor
where
    Pinned<F>: FactorImpl + Send + 'static,
{
    Box::new(Pinned { inner, slots })
}

/// Wraps a factor so that held blocks are supplied as constants.
///
/// `slots` follows the block order of the measurement: `Some` for a held
/// block, `None` for the next free block passed by the solver.
#[derive(Debug, Clone)]
struct Pinned<F> {
    inner: F,
    slots: Vec<Option<DVector<f64>>>,
}

impl<T: RealField, F: Factor<T>> Factor<T> for Pinned<F> {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let mut free = params.iter();
        let full: Vec<DVector<T>> = self
            .slots
            .iter()
            .map(|slot| match slot {
                Some(value) => value.map(|v| T::from_f64(v).unwrap()),
                None => free.next().cloned().unwrap_or_else(|| DVector::zeros(0)),
            })
            .collect();
        debug_assert!(free.next().is_none(), "more free blocks than slots");
        self.inner.residual_func(&full)
    }
}

/// `[intrinsics, distortion, pose]`
#[derive(Debug, Clone)]
struct ReticleFactor(ReticleSample);

impl<T: RealField> Factor<T> for ReticleFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(params.len(), 3);
        let r = reticle_residual_generic(
            params[0].as_view(),
            params[1].as_view(),
            params[2].as_view(),
            &self.0,
        );
        DVector::from_row_slice(r.as_slice())
    }
}

/// `[intrinsics, distortion, a_to_b, pose_a]`
#[derive(Debug, Clone)]
struct PairedReticleFactor(ReticleSample);

impl<T: RealField> Factor<T> for PairedReticleFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(params.len(), 4);
        let r = paired_reticle_residual_generic(
            params[0].as_view(),
            params[1].as_view(),
            params[2].as_view(),
            params[3].as_view(),
            &self.0,
        );
        DVector::from_row_slice(r.as_slice())
    }
}

/// `[camera, point]`
#[derive(Debug, Clone)]
struct BundleFactor {
    uv: [f64; 2],
    principal_point: [f64; 2],
    w: f64,
}

impl<T: RealField> Factor<T> for BundleFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(params.len(), 2);
        let r = bundle_residual_generic(
            params[0].as_view(),
            params[1].as_view(),
            self.uv,
            self.principal_point,
            self.w,
        );
        DVector::from_row_slice(r.as_slice())
    }
}
