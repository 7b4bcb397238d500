//! Parameter block definitions.
//!
//! Each parameter type provides its dimension and conversions to and from the
//! dense vectors the backends operate on.

pub mod bundle_camera;
pub mod distortion;
pub mod intrinsics;
pub mod pose_se3;
