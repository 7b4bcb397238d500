//! Calibration problems expressed in the optimization IR.

pub mod bundle;
pub mod intrinsics;
pub mod stereo;
