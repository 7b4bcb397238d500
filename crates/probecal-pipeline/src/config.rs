//! Engine configuration.
//!
//! Every threshold the registrar and the calibrators use lives here with its
//! default, so deployments can tune them from a JSON file.

use probecal_core::{CameraIntrinsics, ReticleObjectPoints, NOMINAL_IMAGE_SIZE};
use probecal_optim::problems::bundle::BundleSolveOptions;
use probecal_optim::problems::intrinsics::IntrinsicsMode;
use probecal_optim::{BackendSolveOptions, RobustLoss};
use serde::{Deserialize, Serialize};

/// How [`crate::Engine::select_best_pair`] fills the pair store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairSelectionMode {
    /// Keep only the pair with the lowest self-test error.
    #[default]
    Best,
    /// Keep every calibrated pair.
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntrinsicConfig {
    /// Seed intrinsics; with the default mode these are also the final ones.
    pub guess: CameraIntrinsics,
    pub image_size: (u32, u32),
    pub mode: IntrinsicsMode,
    pub robust_loss: RobustLoss,
}

impl Default for IntrinsicConfig {
    fn default() -> Self {
        Self {
            guess: CameraIntrinsics::nominal(),
            image_size: NOMINAL_IMAGE_SIZE,
            mode: IntrinsicsMode::PoseOnly,
            robust_loss: RobustLoss::None,
        }
    }
}

/// Acceptance and pruning thresholds for probe registration. Distances are µm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    /// Required span along X and Y.
    pub min_travel_xy: f64,
    /// Required span along Z.
    pub min_travel_z: f64,
    /// Mean fit error must be strictly below this.
    pub max_mean_error: f64,
    /// Point count must be strictly above this; also the floor for pruning.
    pub min_points: usize,
    /// Allowed elementwise change of the rotation block between fits.
    pub rotation_tolerance: f64,
    /// Allowed elementwise change of the translation column between fits.
    pub translation_tolerance: f64,
    /// Residual thresholds applied in order, largest first.
    pub outlier_schedule: Vec<f64>,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            min_travel_xy: 1500.0,
            min_travel_z: 200.0,
            max_mean_error: 50.0,
            min_points: 6,
            rotation_tolerance: 1e-3,
            translation_tolerance: 5.0,
            outlier_schedule: vec![430.0, 330.0, 230.0, 130.0, 30.0],
        }
    }
}

/// Bundle adjustment switch and solve options.
///
/// Bundle adjustment needs every camera pair in the store, so enabling it
/// makes pair selection keep all pairs whatever
/// [`EngineConfig::pair_selection`] says; see
/// [`EngineConfig::pair_selection_mode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    /// Run bundle adjustment automatically when a probe converges.
    pub enabled: bool,
    pub solve: BundleSolveOptions,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            solve: BundleSolveOptions::default(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub reticle: ReticleObjectPoints,
    pub intrinsic: IntrinsicConfig,
    pub pair_selection: PairSelectionMode,
    pub registrar: RegistrarConfig,
    pub bundle: BundleConfig,
    pub solver: BackendSolveOptions,
}

impl EngineConfig {
    /// Pair selection mode in effect: [`PairSelectionMode::All`] while bundle
    /// adjustment is enabled, the configured mode otherwise.
    pub fn pair_selection_mode(&self) -> PairSelectionMode {
        if self.bundle.enabled {
            PairSelectionMode::All
        } else {
            self.pair_selection
        }
    }
}
