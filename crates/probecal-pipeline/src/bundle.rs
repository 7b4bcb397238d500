//! Bundle adjustment over a probe's logged observations.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use probecal_core::{CalibError, CalibResult, Pt3, Real};
use probecal_optim::params::bundle_camera::BundleCamera;
use probecal_optim::problems::bundle::{
    optimize_bundle, BundleDataset, BundleObservation, BundleResult,
};
use probecal_optim::BackendSolveOptions;

use crate::config::BundleConfig;
use crate::correspondence::{CorrespondenceRecord, RecordId};
use crate::intrinsic::IntrinsicCalibration;

/// Minimum number of distinct points for a bundle solve.
pub const MIN_BUNDLE_POINTS: usize = 4;
/// Minimum number of distinct cameras for a bundle solve.
pub const MIN_BUNDLE_CAMERAS: usize = 2;

/// A bundle problem assembled from log records.
#[derive(Debug, Clone)]
pub struct BundlePlan {
    pub dataset: BundleDataset,
    /// Camera id of each dataset camera, sorted.
    pub camera_ids: Vec<String>,
    /// Stage position of each dataset point.
    pub locals: Vec<Pt3>,
    /// Log records merged into each dataset point.
    pub point_records: Vec<Vec<RecordId>>,
}

#[derive(Debug, Clone)]
pub struct BundleOutcome {
    pub result: BundleResult,
    pub camera_ids: Vec<String>,
    /// Refined global point of every planned record, µm.
    pub refined: HashMap<RecordId, Pt3>,
}

/// Group records into distinct points and collect their camera observations.
///
/// Records sharing a non-empty local timestamp are one physical point whose
/// global position is the mean of the group; a record without a timestamp is
/// a point of its own. Returns `None`, after logging why, when the data cannot
/// support a solve.
pub fn plan_bundle<'a>(
    records: impl IntoIterator<Item = (RecordId, &'a CorrespondenceRecord)>,
    calibrations: &HashMap<String, IntrinsicCalibration>,
) -> Option<BundlePlan> {
    let records: Vec<(RecordId, &CorrespondenceRecord)> = records.into_iter().collect();

    let camera_ids: Vec<String> = records
        .iter()
        .flat_map(|(_, r)| r.observations.iter().map(|o| o.camera.clone()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if camera_ids.len() < MIN_BUNDLE_CAMERAS {
        log::info!(
            "bundle adjustment skipped: {} cameras observed",
            camera_ids.len()
        );
        return None;
    }
    let mut cameras = Vec::with_capacity(camera_ids.len());
    for id in &camera_ids {
        let Some(calib) = calibrations.get(id) else {
            log::info!("bundle adjustment skipped: camera {id} has no calibration");
            return None;
        };
        cameras.push(BundleCamera::from_calibration(&calib.intrinsics, &calib.pose));
    }
    let camera_index: HashMap<&str, usize> = camera_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    let mut group_of: HashMap<&str, usize> = HashMap::new();
    let mut sums: Vec<(Pt3, Real)> = Vec::new();
    let mut locals = Vec::new();
    let mut point_records: Vec<Vec<RecordId>> = Vec::new();
    let mut observations = Vec::new();
    for &(id, r) in &records {
        let point = match group_of.get(r.ts_local_coords.as_str()) {
            Some(&idx) if !r.ts_local_coords.is_empty() => idx,
            _ => {
                let idx = locals.len();
                locals.push(r.local);
                point_records.push(Vec::new());
                sums.push((Pt3::origin(), 0.0));
                if !r.ts_local_coords.is_empty() {
                    group_of.insert(r.ts_local_coords.as_str(), idx);
                }
                idx
            }
        };
        point_records[point].push(id);
        sums[point].0 += r.global.coords;
        sums[point].1 += 1.0;
        for o in &r.observations {
            observations.push(BundleObservation {
                camera: camera_index[o.camera.as_str()],
                point,
                uv: o.pixel,
            });
        }
    }

    if locals.len() < MIN_BUNDLE_POINTS {
        log::info!("bundle adjustment skipped: {} distinct points", locals.len());
        return None;
    }
    let points: Vec<Pt3> = sums.iter().map(|(s, n)| Pt3::from(s.coords / *n)).collect();

    match BundleDataset::new(cameras, points, observations) {
        Ok(dataset) => Some(BundlePlan {
            dataset,
            camera_ids,
            locals,
            point_records,
        }),
        Err(e) => {
            log::warn!("bundle adjustment skipped: {e:#}");
            None
        }
    }
}

/// Solve a planned bundle problem.
pub fn run_bundle(
    plan: &BundlePlan,
    config: &BundleConfig,
    solver: &BackendSolveOptions,
    cancel: Option<&AtomicBool>,
) -> CalibResult<BundleOutcome> {
    let result = optimize_bundle(&plan.dataset, &config.solve, solver, cancel)
        .context("bundle adjustment")
        .map_err(|e| CalibError::solver(e, None))?;
    log::info!(
        "bundle adjustment: {} points, {} cameras, mean sq residual {:.4} -> {:.4} in {} rounds",
        plan.locals.len(),
        plan.camera_ids.len(),
        result.initial_mean_sq,
        result.final_mean_sq,
        result.rounds
    );

    let refined = plan
        .point_records
        .iter()
        .zip(&result.points)
        .flat_map(|(ids, p)| ids.iter().map(move |id| (*id, *p)))
        .collect();
    Ok(BundleOutcome {
        camera_ids: plan.camera_ids.clone(),
        refined,
        result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correspondence::{CameraObservation, ObservationDebug, StageObservation};
    use probecal_core::{synthetic, UM_PER_MM};

    fn calibrations(cams: &[synthetic::SyntheticCamera]) -> HashMap<String, IntrinsicCalibration> {
        cams.iter()
            .map(|c| {
                (
                    c.id.clone(),
                    IntrinsicCalibration {
                        camera_id: c.id.clone(),
                        rms_px: 0.0,
                        intrinsics: c.intrinsics,
                        pose: c.pose,
                        image_size: synthetic::NOMINAL_IMAGE_SIZE,
                    },
                )
            })
            .collect()
    }

    fn record(
        cams: &[synthetic::SyntheticCamera],
        ts: &str,
        global_um: Pt3,
    ) -> CorrespondenceRecord {
        let pw = Pt3::from(global_um.coords / UM_PER_MM);
        let debug = ObservationDebug {
            ts_img_captured: String::new(),
            observations: cams
                .iter()
                .map(|c| CameraObservation {
                    camera: c.id.clone(),
                    pixel: c.project(&pw).unwrap(),
                })
                .collect(),
        };
        let obs = StageObservation {
            sn: "SN1".to_string(),
            local: global_um,
            global: global_um,
            ts_local_coords: ts.to_string(),
        };
        CorrespondenceRecord::new(&obs, Some(&debug))
    }

    fn with_ids(records: &[CorrespondenceRecord]) -> Vec<(RecordId, &CorrespondenceRecord)> {
        records
            .iter()
            .enumerate()
            .map(|(i, r)| (RecordId(i as u64), r))
            .collect()
    }

    #[test]
    fn records_group_by_timestamp() {
        let cams = synthetic::camera_ring(2, 40.0, 0.9);
        let mut records = vec![
            record(&cams, "t0", Pt3::new(100.0, 0.0, 0.0)),
            record(&cams, "t0", Pt3::new(110.0, 0.0, 0.0)),
        ];
        for (i, ts) in ["t1", "t2", "t3"].iter().enumerate() {
            records.push(record(&cams, ts, Pt3::new(0.0, 200.0 * i as Real, 50.0)));
        }
        records.push(record(&cams, "", Pt3::new(-300.0, 0.0, 0.0)));
        records.push(record(&cams, "", Pt3::new(-400.0, 0.0, 0.0)));

        let plan = plan_bundle(with_ids(&records), &calibrations(&cams)).unwrap();
        assert_eq!(plan.camera_ids, vec!["cam0".to_string(), "cam1".to_string()]);
        assert_eq!(plan.dataset.points.len(), 6);
        assert_eq!(plan.dataset.points[0], Pt3::new(105.0, 0.0, 0.0));
        assert_eq!(plan.locals[0], Pt3::new(100.0, 0.0, 0.0));
        assert_eq!(plan.dataset.observations.len(), 2 * records.len());
        assert_eq!(plan.point_records[0], vec![RecordId(0), RecordId(1)]);
        assert_eq!(plan.point_records[5], vec![RecordId(6)]);
    }

    #[test]
    fn skips_without_enough_data() {
        let cams = synthetic::camera_ring(2, 40.0, 0.9);
        let calibs = calibrations(&cams);
        let three: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|ts| record(&cams, ts, Pt3::new(10.0, 20.0, 30.0)))
            .collect();
        assert!(plan_bundle(with_ids(&three), &calibs).is_none());

        let one_cam: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|ts| record(&cams[..1], ts, Pt3::new(10.0, 20.0, 30.0)))
            .collect();
        assert!(plan_bundle(with_ids(&one_cam), &calibs).is_none());

        let four: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|ts| record(&cams, ts, Pt3::new(10.0, 20.0, 30.0)))
            .collect();
        let mut partial = calibs.clone();
        partial.remove("cam1");
        assert!(plan_bundle(with_ids(&four), &partial).is_none());
        assert!(plan_bundle(with_ids(&four), &calibs).is_some());
    }
}
