//! Core math and geometry primitives for `probecal`.
//!
//! This crate contains:
//! - linear algebra type aliases (`Real`, `Vec2`, `Pt3`, ...),
//! - the pinhole + Brown-Conrady camera model used by every calibrator,
//! - the reticle geometry (two perpendicular tick axes through a shared origin),
//! - the error taxonomy shared by the pipeline,
//! - synthetic scene builders used by tests across the workspace.
//!
//! Camera pipeline:
//! `pixel = K ∘ distortion ∘ pinhole(R·X + t)`
//!
//! World units are millimetres (reticle frame); probe-stage units are micrometres.

/// Error taxonomy.
pub mod error;
/// Linear algebra type aliases and helpers.
pub mod math;
/// Camera models and distortion utilities.
pub mod models;
/// Reticle object points and axis detections.
pub mod reticle;
/// Deterministic synthetic scenes.
pub mod synthetic;

pub use error::*;
pub use math::*;
pub use models::*;
pub use reticle::*;
