//! Closed-form geometry solvers.
//!
//! Everything here is linear algebra without iteration: these results seed the
//! nonlinear refinements in `probecal-optim` or, for the rigid fit, are final.

mod epipolar;
mod homography;
pub mod math;
mod planar_pose;
mod rigid;
mod triangulation;

pub use epipolar::*;
pub use homography::*;
pub use planar_pose::*;
pub use rigid::*;
pub use triangulation::*;
