//! Solver-independent description of a least-squares problem: named parameter
//! blocks plus residual blocks that reference them.

mod types;

pub use types::{Manifold, Measurement, ParamBlock, ParamId, ProblemIR, ResidualBlock, RobustLoss};
