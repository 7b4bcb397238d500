//! Engine context owning every keyed store of the calibration pipeline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use probecal_core::{AxisDetections, CalibError, CalibResult, Pt2, Pt3, Real};

use crate::bundle::{plan_bundle, run_bundle, BundleOutcome};
use crate::config::{EngineConfig, PairSelectionMode};
use crate::correspondence::{
    write_records, write_transform, CorrespondenceLog, CorrespondenceRecord, ObservationDebug,
    RecordId, StageObservation,
};
use crate::intrinsic::{self, IntrinsicCalibration};
use crate::pair_selector::{select_pairs, CameraInput, PairSelection};
use crate::registrar::{CalibrationStatusEvent, Correspondence, ProbeRegistrar, Registration};
use crate::stereo::{self, StereoPair};
use crate::triangulator::PairStore;

/// Calibration engine: camera calibrations, published stereo pairs, probe
/// registrations and the correspondence log.
///
/// Operations are synchronous. One engine is the single writer for every probe
/// it registers; stereo pairs are handed out as shared snapshots.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    calibrations: HashMap<String, IntrinsicCalibration>,
    pairs: PairStore,
    probes: HashMap<String, ProbeRegistrar>,
    log: CorrespondenceLog,
    cancel: Arc<AtomicBool>,
}

impl Engine {
    /// Engine with an in-memory correspondence log.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_correspondence_log(config, CorrespondenceLog::in_memory())
    }

    /// Engine persisting its correspondence log at `path`.
    pub fn with_log_file(config: EngineConfig, path: impl Into<PathBuf>) -> CalibResult<Self> {
        Ok(Self::with_correspondence_log(
            config,
            CorrespondenceLog::open(path)?,
        ))
    }

    fn with_correspondence_log(config: EngineConfig, log: CorrespondenceLog) -> Self {
        Self {
            config,
            calibrations: HashMap::new(),
            pairs: PairStore::new(),
            probes: HashMap::new(),
            log,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn correspondence_log(&self) -> &CorrespondenceLog {
        &self.log
    }

    pub fn pairs(&self) -> &PairStore {
        &self.pairs
    }

    pub fn calibration(&self, camera_id: &str) -> Option<&IntrinsicCalibration> {
        self.calibrations.get(camera_id)
    }

    /// Register a calibration computed elsewhere, replacing any earlier one.
    pub fn insert_calibration(&mut self, calib: IntrinsicCalibration) {
        self.calibrations.insert(calib.camera_id.clone(), calib);
    }

    /// Flag shared with a running bundle adjustment; setting it stops the
    /// solve before its next round.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Calibrate one camera from its reticle detections and keep the result.
    pub fn calibrate_intrinsics(
        &mut self,
        camera_id: &str,
        detections: &AxisDetections,
    ) -> CalibResult<IntrinsicCalibration> {
        let calib = intrinsic::calibrate_intrinsics(
            camera_id,
            detections,
            &self.config.reticle,
            &self.config.intrinsic,
            &self.config.solver,
        )?;
        self.insert_calibration(calib.clone());
        Ok(calib)
    }

    /// Stereo-calibrate two previously calibrated cameras and publish the pair.
    pub fn calibrate_stereo(
        &mut self,
        cam_a: &str,
        det_a: &AxisDetections,
        cam_b: &str,
        det_b: &AxisDetections,
    ) -> CalibResult<Arc<StereoPair>> {
        let calib_a = self
            .calibrations
            .get(cam_a)
            .ok_or_else(|| CalibError::UnknownCamera(cam_a.to_string()))?;
        let calib_b = self
            .calibrations
            .get(cam_b)
            .ok_or_else(|| CalibError::UnknownCamera(cam_b.to_string()))?;
        let pair = Arc::new(stereo::calibrate_stereo(
            (calib_a, det_a),
            (calib_b, det_b),
            &self.config.reticle,
            self.config.intrinsic.robust_loss,
            &self.config.solver,
        )?);
        self.pairs.insert(Arc::clone(&pair));
        Ok(pair)
    }

    /// Evaluate every camera pair and replace the pair store with the
    /// selection: the single best pair, or every pair in
    /// [`PairSelectionMode::All`]. Enabled bundle adjustment implies the
    /// latter.
    ///
    /// `None` leaves the store untouched.
    pub fn select_best_pair(&mut self, cameras: &[CameraInput]) -> Option<PairSelection> {
        let mode = self.config.pair_selection_mode();
        let selection = select_pairs(
            cameras,
            mode,
            &self.config.reticle,
            self.config.intrinsic.robust_loss,
            &self.config.solver,
        )?;
        self.pairs
            .replace_all(selection.pairs.iter().map(|e| Arc::clone(&e.pair)));
        if mode == PairSelectionMode::Best {
            log::info!(
                "active pair {}-{} (self-test {:.5} mm)",
                selection.best.camera_a,
                selection.best.camera_b,
                selection.min_error
            );
        }
        Some(selection)
    }

    /// Triangulate into the reticle frame in µm; `None` without a pair.
    pub fn triangulate_global(
        &self,
        cam_a: &str,
        px_a: &Pt2,
        cam_b: &str,
        px_b: &Pt2,
    ) -> Option<Pt3> {
        self.pairs.triangulate_global(cam_a, px_a, cam_b, px_b)
    }

    /// Feed one probe observation through logging and registration.
    ///
    /// Observations below the reticle plane and repeats of a logged
    /// measurement are ignored but still answered with the probe's status.
    /// When the probe converges and bundle adjustment is enabled it runs
    /// immediately; its failure is logged and leaves the fitted transform.
    pub fn register_observation(
        &mut self,
        obs: StageObservation,
        debug: Option<&ObservationDebug>,
    ) -> CalibResult<CalibrationStatusEvent> {
        let sn = obs.sn.clone();
        self.probes
            .entry(sn.clone())
            .or_insert_with(|| ProbeRegistrar::new(sn.clone()));

        if obs.global.z < 0.0 {
            log::debug!("{sn}: ignoring observation below the reticle (z = {})", obs.global.z);
            return Ok(self.probe_status(&sn));
        }
        let record = CorrespondenceRecord::new(&obs, debug);
        if self.log.is_duplicate(&record) {
            log::debug!("{sn}: duplicate observation at {:?}", record.global_key());
            return Ok(self.probe_status(&sn));
        }

        let (local, global) = (record.local, record.global);
        let correspondence = Correspondence {
            record: self.log.append(record)?,
            local,
            global,
        };

        let converged = match self.probes.get_mut(&sn) {
            Some(reg) => reg.observe(correspondence, &self.config.registrar),
            None => false,
        };
        if converged && self.config.bundle.enabled {
            match self.run_bundle_adjustment(&sn) {
                Ok(true) => {}
                Ok(false) => log::info!("{sn}: keeping transform without bundle adjustment"),
                Err(e) => log::warn!("{sn}: bundle adjustment failed: {e}"),
            }
        }
        Ok(self.probe_status(&sn))
    }

    fn probe_status(&self, sn: &str) -> CalibrationStatusEvent {
        match self.probes.get(sn) {
            Some(reg) => reg.status(),
            None => ProbeRegistrar::new(sn).status(),
        }
    }

    /// Current status of a probe, `None` if it was never observed.
    pub fn status(&self, sn: &str) -> Option<CalibrationStatusEvent> {
        self.probes.get(sn).map(ProbeRegistrar::status)
    }

    pub fn registrar(&self, sn: &str) -> Option<&ProbeRegistrar> {
        self.probes.get(sn)
    }

    /// Serial numbers of every probe seen, sorted.
    pub fn probe_serials(&self) -> Vec<String> {
        let mut sns: Vec<String> = self.probes.keys().cloned().collect();
        sns.sort();
        sns
    }

    /// Clear the registration of one probe, or of every probe.
    pub fn reset_probe(&mut self, sn: Option<&str>) {
        match sn {
            Some(sn) => {
                if let Some(reg) = self.probes.get_mut(sn) {
                    reg.reset();
                }
            }
            None => self.probes.values_mut().for_each(ProbeRegistrar::reset),
        }
    }

    /// Remove one probe's rows from the correspondence log, or all rows.
    pub fn clear_log(&mut self, sn: Option<&str>) -> CalibResult<()> {
        self.log.clear(sn)
    }

    /// Map a stage position through the probe's converged transform.
    pub fn local_to_global(&self, sn: &str, local: &Pt3) -> Option<Pt3> {
        self.probes.get(sn)?.local_to_global(local)
    }

    /// Error of one correspondence under the probe's current fit, µm.
    pub fn current_point_error(&self, sn: &str, local: &Pt3, global: &Pt3) -> Option<Real> {
        self.probes.get(sn)?.current_point_error(local, global)
    }

    /// Logged records behind the current working set of `sn`, in working-set
    /// order. Rows cleared from the log are skipped.
    pub fn working_records(&self, sn: &str) -> Vec<(RecordId, &CorrespondenceRecord)> {
        let Some(reg) = self.probes.get(sn) else {
            return Vec::new();
        };
        reg.working_set()
            .iter()
            .filter_map(|c| self.log.get(c.record).map(|r| (c.record, r)))
            .collect()
    }

    /// Write the working set of `sn` as a correspondence CSV.
    pub fn export_working_set(&self, sn: &str, path: &Path) -> CalibResult<()> {
        write_records(path, self.working_records(sn).into_iter().map(|(_, r)| r))
    }

    /// Published transform of `sn`.
    ///
    /// Fails with [`CalibError::InsufficientData`] until the probe converges.
    pub fn transform(&self, sn: &str) -> CalibResult<Registration> {
        self.probes
            .get(sn)
            .and_then(ProbeRegistrar::registration)
            .copied()
            .ok_or_else(|| CalibError::insufficient(format!("converged transform of {sn}"), 1, 0))
    }

    /// Write the published transform of `sn`.
    pub fn export_transform(&self, sn: &str, path: &Path) -> CalibResult<()> {
        let reg = self.transform(sn)?;
        write_transform(path, &reg.transform, reg.mean_error)
    }

    /// Bundle-adjust the working set of `sn` and refit its transform on the
    /// refined points.
    ///
    /// Returns `Ok(None)` when the solve is skipped or cancelled; the prior
    /// transform is kept in both cases.
    pub fn bundle_adjust(&mut self, sn: &str) -> CalibResult<Option<BundleOutcome>> {
        let plan = plan_bundle(self.working_records(sn), &self.calibrations);
        let Some(plan) = plan else {
            return Ok(None);
        };

        let outcome = run_bundle(
            &plan,
            &self.config.bundle,
            &self.config.solver,
            Some(self.cancel.as_ref()),
        );
        self.cancel.store(false, Ordering::Relaxed);
        let outcome = outcome?;
        if outcome.result.cancelled {
            return Ok(None);
        }

        let refit = match self.probes.get_mut(sn) {
            Some(reg) => reg.apply_refit(&outcome.refined, &self.config.registrar),
            None => false,
        };
        if !refit {
            return Ok(None);
        }
        Ok(Some(outcome))
    }

    /// [`Self::bundle_adjust`] reporting only whether the transform changed.
    pub fn run_bundle_adjustment(&mut self, sn: &str) -> CalibResult<bool> {
        Ok(self.bundle_adjust(sn)?.is_some())
    }
}
