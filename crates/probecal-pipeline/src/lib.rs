//! Probe calibration pipeline.
//!
//! Data flows bottom-up:
//!
//! 1. [`intrinsic`] calibrates each camera against the reticle,
//! 2. [`stereo`] calibrates camera pairs and [`pair_selector`] picks the pair(s)
//!    used for measurement,
//! 3. [`triangulator`] turns paired pixels into reticle-frame points,
//! 4. [`registrar`] fits each probe's stage-to-reticle transform,
//! 5. [`bundle`] optionally refines cameras and points before a final refit.
//!
//! [`Engine`] owns the keyed stores that connect these steps and the
//! [`correspondence::CorrespondenceLog`] every accepted observation is written to.
//!
//! ```no_run
//! use probecal_pipeline::{Engine, EngineConfig, StageObservation};
//! use probecal_core::Pt3;
//!
//! # fn main() -> probecal_core::CalibResult<()> {
//! let mut engine = Engine::new(EngineConfig::default());
//! let status = engine.register_observation(
//!     StageObservation {
//!         sn: "SN-1".into(),
//!         local: Pt3::new(0.0, 0.0, 0.0),
//!         global: Pt3::new(120.0, -40.0, 15.0),
//!         ts_local_coords: "t0".into(),
//!     },
//!     None,
//! )?;
//! println!("{:?} with {} points", status.state, status.point_count);
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod config;
pub mod correspondence;
mod engine;
pub mod intrinsic;
pub mod pair_selector;
pub mod registrar;
pub mod stereo;
pub mod triangulator;

pub use config::{BundleConfig, EngineConfig, IntrinsicConfig, PairSelectionMode, RegistrarConfig};
pub use correspondence::{
    CameraObservation, CorrespondenceRecord, ObservationDebug, RecordId, StageObservation,
};
pub use engine::Engine;
pub use intrinsic::{project_axes, AxisOverlay, IntrinsicCalibration};
pub use pair_selector::{CameraInput, PairSelection};
pub use registrar::{CalibrationStatusEvent, ProbeState, Registration, TravelFlags};
pub use stereo::{SelfTestReport, StereoPair};
