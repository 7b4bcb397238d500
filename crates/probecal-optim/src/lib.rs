//! Non-linear refinement for the probe calibration engine, built on tiny-solver.
//!
//! Problems are described in a small backend-independent IR (parameter blocks
//! plus residual blocks), then compiled by a backend adapter. The residual models
//! are generic over [`nalgebra::RealField`] so the backend can differentiate them
//! automatically.
//!
//! Three problems are provided:
//! - [`problems::intrinsics`]: single-image reticle pose (and optionally distortion),
//! - [`problems::stereo`]: joint pose of camera A and the A→B relative pose,
//! - [`problems::bundle`]: joint refinement of camera vectors and triangulated points.

pub mod backend;
pub mod factors;
pub mod ir;
pub mod params;
pub mod problems;

pub use backend::{BackendSolveOptions, LinearSolverKind};
pub use ir::RobustLoss;
