//! Camera model building blocks.
//!
//! The pipeline is split into:
//!
//! 1. pinhole projection of a camera-frame point to normalized coordinates,
//! 2. `DistortionModel`: radial/tangential distortion in normalized space,
//! 3. `IntrinsicsModel`: normalized coordinates to pixels (K matrix).
//!
//! [`CameraIntrinsics`] bundles the concrete f64 model used by the calibrators and
//! [`CameraPose`] holds the reticle-to-camera extrinsics.

mod camera;
mod distortion;
mod intrinsics;
mod pose;

pub use camera::*;
pub use distortion::*;
pub use intrinsics::*;
pub use pose::*;
