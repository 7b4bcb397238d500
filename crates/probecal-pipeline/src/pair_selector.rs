//! Choosing which camera pairs drive triangulation.

use std::sync::Arc;

use probecal_core::{AxisDetections, ReticleObjectPoints};
use probecal_optim::{BackendSolveOptions, RobustLoss};

use crate::config::PairSelectionMode;
use crate::intrinsic::IntrinsicCalibration;
use crate::stereo::{calibrate_stereo, SelfTestReport, StereoPair};

/// One camera offered for pair selection.
#[derive(Debug, Clone)]
pub struct CameraInput {
    pub id: String,
    pub calibration: Option<IntrinsicCalibration>,
    pub detections: Option<AxisDetections>,
}

/// A calibrated pair together with its self-test.
#[derive(Debug, Clone)]
pub struct EvaluatedPair {
    pub pair: Arc<StereoPair>,
    pub report: SelfTestReport,
}

#[derive(Debug, Clone)]
pub struct PairSelection {
    /// Pairs to publish: just the best one, or all of them.
    pub pairs: Vec<EvaluatedPair>,
    /// Pair with the lowest self-test error.
    pub best: Arc<StereoPair>,
    /// Self-test mean error of `best`, in mm.
    pub min_error: f64,
}

/// Calibrate every unordered pair of usable cameras and rank them by their
/// reticle self-test.
///
/// Cameras without a calibration or detections are skipped. Ids are sorted
/// first so the outcome does not depend on input order, and ties keep the
/// earlier pair. A pair whose calibration fails is logged and left out.
/// Returns `None` when fewer than two cameras are usable or no pair calibrates.
pub fn select_pairs(
    cameras: &[CameraInput],
    mode: PairSelectionMode,
    reticle: &ReticleObjectPoints,
    robust_loss: RobustLoss,
    solver: &BackendSolveOptions,
) -> Option<PairSelection> {
    let mut usable: Vec<(&IntrinsicCalibration, &AxisDetections)> = cameras
        .iter()
        .filter_map(|c| Some((c.calibration.as_ref()?, c.detections.as_ref()?)))
        .collect();
    usable.sort_by(|a, b| a.0.camera_id.cmp(&b.0.camera_id));
    usable.dedup_by(|a, b| a.0.camera_id == b.0.camera_id);

    if usable.len() < 2 {
        log::debug!("pair selection needs two calibrated cameras, have {}", usable.len());
        return None;
    }

    let mut evaluated = Vec::new();
    for (i, first) in usable.iter().enumerate() {
        for second in &usable[i + 1..] {
            let pair = match calibrate_stereo(*first, *second, reticle, robust_loss, solver) {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!(
                        "skipping pair {}-{}: {e}",
                        first.0.camera_id,
                        second.0.camera_id
                    );
                    continue;
                }
            };
            let report = match pair.self_test(first.1, second.1, reticle) {
                Ok(report) => report,
                Err(e) => {
                    log::warn!("self-test failed for {}-{}: {e}", pair.camera_a, pair.camera_b);
                    continue;
                }
            };
            log::info!(
                "pair {}-{}: self-test error {:.5} mm",
                pair.camera_a,
                pair.camera_b,
                report.mean_error_mm
            );
            evaluated.push(EvaluatedPair {
                pair: Arc::new(pair),
                report,
            });
        }
    }

    // ties keep the earlier pair
    let best_idx = evaluated
        .iter()
        .enumerate()
        .fold(None::<usize>, |best, (i, e)| match best {
            Some(b) if evaluated[b].report.mean_error_mm <= e.report.mean_error_mm => Some(b),
            _ => Some(i),
        })?;
    let best = evaluated[best_idx].clone();

    let pairs = match mode {
        PairSelectionMode::Best => vec![best.clone()],
        PairSelectionMode::All => evaluated,
    };
    Some(PairSelection {
        pairs,
        min_error: best.report.mean_error_mm,
        best: best.pair,
    })
}
