//! Residual models, generic over [`nalgebra::RealField`] so the backend can
//! evaluate them on `f64` and on dual numbers alike.

pub mod reprojection_model;
