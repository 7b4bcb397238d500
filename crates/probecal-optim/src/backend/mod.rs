//! Solver adapters. A backend compiles a [`ProblemIR`] into its own problem
//! type, solves it and hands back the parameter map under the IR block names.

mod tiny_solver_backend;

use anyhow::Result;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ir::ProblemIR;

pub use tiny_solver_backend::TinySolverBackend;

/// Parameter values keyed by block name.
pub type ParamMap = HashMap<String, DVector<f64>>;

/// Levenberg-Marquardt settings shared by every problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSolveOptions {
    pub max_iters: usize,
    /// Passed through to the solver; 0 is silent.
    pub verbosity: usize,
    pub linear_solver: LinearSolverKind,
    /// Stop when the cost drops by less than this between iterations. A
    /// rejected LM step counts as no decrease, so any positive value also ends
    /// the solve at the first rejected step; 0 disables the check.
    pub min_abs_decrease: f64,
    /// Relative form of `min_abs_decrease`, same caveat.
    pub min_rel_decrease: f64,
    /// Stop once the cost falls below this.
    pub min_error: f64,
}

impl Default for BackendSolveOptions {
    fn default() -> Self {
        Self {
            max_iters: 100,
            verbosity: 0,
            linear_solver: LinearSolverKind::default(),
            min_abs_decrease: 0.0,
            min_rel_decrease: 0.0,
            min_error: 1e-12,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearSolverKind {
    #[default]
    SparseCholesky,
    SparseQr,
}

#[derive(Debug, Clone)]
pub struct BackendSolution {
    pub params: ParamMap,
    /// `0.5 * Σ ρ(|r|²)` at the solution.
    pub final_cost: f64,
}

impl BackendSolution {
    /// Solved value of one block.
    pub fn param(&self, name: &str) -> Result<&DVector<f64>> {
        self.params
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("solution missing parameter {name}"))
    }
}

pub trait OptimBackend {
    fn solve(
        &self,
        ir: &ProblemIR,
        initial: &ParamMap,
        opts: &BackendSolveOptions,
    ) -> Result<BackendSolution>;
}

/// Solve with the default backend.
pub fn solve(ir: &ProblemIR, initial: &ParamMap, opts: &BackendSolveOptions) -> Result<BackendSolution> {
    TinySolverBackend.solve(ir, initial, opts)
}
