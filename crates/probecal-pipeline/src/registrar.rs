//! Incremental registration of a probe's stage frame to the reticle frame.
//!
//! Every observation pairs a stage position with a triangulated global
//! position (both µm). The registrar refits a rigid transform over all pairs
//! seen since the last reset, prunes outliers once the probe has travelled far
//! enough, and declares the probe converged when the fit is accurate and has
//! stopped moving.

use std::collections::HashMap;

use probecal_core::{Mat4, Pt3, Real, Vec3};
use probecal_linear::{fit_rigid_transform, RigidFit};
use serde::{Deserialize, Serialize};

use crate::config::RegistrarConfig;
use crate::correspondence::RecordId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeState {
    Empty,
    Accumulating,
    Converged,
}

/// One stage position and its global counterpart, µm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    /// Log record this pair came from.
    pub record: RecordId,
    pub local: Pt3,
    pub global: Pt3,
}

/// Per-axis extent of a point set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisBounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for AxisBounds {
    fn default() -> Self {
        Self {
            min: Vec3::repeat(Real::INFINITY),
            max: Vec3::repeat(Real::NEG_INFINITY),
        }
    }
}

impl AxisBounds {
    pub fn of<'a>(points: impl IntoIterator<Item = &'a Pt3>) -> Self {
        let mut b = Self::default();
        for p in points {
            b.include(p);
        }
        b
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x
    }

    pub fn include(&mut self, p: &Pt3) {
        self.min = self.min.inf(&p.coords);
        self.max = self.max.sup(&p.coords);
    }

    /// `max - min` per axis, zero when empty.
    pub fn span(&self) -> Vec3 {
        if self.is_empty() {
            Vec3::zeros()
        } else {
            self.max - self.min
        }
    }
}

/// Which axes the probe has travelled far enough along.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TravelFlags {
    pub x: bool,
    pub y: bool,
    pub z: bool,
}

impl TravelFlags {
    pub fn all(&self) -> bool {
        self.x && self.y && self.z
    }
}

/// Snapshot of a probe's registration, emitted after every observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStatusEvent {
    pub sn: String,
    pub state: ProbeState,
    /// Current local-to-global fit, if one exists.
    pub transform: Option<Mat4>,
    /// Mean residual of that fit, µm.
    pub mean_error: Option<Real>,
    /// Local travel per axis, µm.
    pub local_span: [Real; 3],
    pub flags: TravelFlags,
    /// Size of the working set the fit uses.
    pub point_count: usize,
}

/// The transform published when acceptance criteria last held.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub transform: Mat4,
    pub mean_error: Real,
}

fn fit_set(set: &[Correspondence]) -> Option<RigidFit> {
    let local: Vec<Pt3> = set.iter().map(|c| c.local).collect();
    let global: Vec<Pt3> = set.iter().map(|c| c.global).collect();
    match fit_rigid_transform(&local, &global) {
        Ok(fit) => Some(fit),
        Err(e) => {
            log::debug!("rigid fit skipped: {e}");
            None
        }
    }
}

/// Global X and Y straddle the origin and all three global spans exceed the
/// travel thresholds.
pub fn trajectory_sufficient(set: &[Correspondence], cfg: &RegistrarConfig) -> bool {
    let b = AxisBounds::of(set.iter().map(|c| &c.global));
    if b.is_empty() {
        return false;
    }
    let straddles = |axis: usize| b.min[axis] <= 0.0 && b.max[axis] >= 0.0;
    if !straddles(0) || !straddles(1) {
        log::trace!("trajectory does not cross the reticle axes");
        return false;
    }
    let span = b.span();
    span.x > cfg.min_travel_xy && span.y > cfg.min_travel_xy && span.z > cfg.min_travel_z
}

/// Registration state of a single probe.
#[derive(Debug, Clone)]
pub struct ProbeRegistrar {
    sn: String,
    samples: Vec<Correspondence>,
    working: Vec<Correspondence>,
    fit: Option<RigidFit>,
    prev_transform: Mat4,
    published: Option<Registration>,
    local_bounds: AxisBounds,
    global_bounds: AxisBounds,
    flags: TravelFlags,
}

impl ProbeRegistrar {
    pub fn new(sn: impl Into<String>) -> Self {
        Self {
            sn: sn.into(),
            samples: Vec::new(),
            working: Vec::new(),
            fit: None,
            prev_transform: Mat4::zeros(),
            published: None,
            local_bounds: AxisBounds::default(),
            global_bounds: AxisBounds::default(),
            flags: TravelFlags::default(),
        }
    }

    pub fn sn(&self) -> &str {
        &self.sn
    }

    pub fn state(&self) -> ProbeState {
        if self.published.is_some() {
            ProbeState::Converged
        } else if self.samples.is_empty() {
            ProbeState::Empty
        } else {
            ProbeState::Accumulating
        }
    }

    pub fn flags(&self) -> TravelFlags {
        self.flags
    }

    pub fn fit(&self) -> Option<&RigidFit> {
        self.fit.as_ref()
    }

    pub fn registration(&self) -> Option<&Registration> {
        self.published.as_ref()
    }

    /// Correspondences the current fit was computed on, after pruning.
    pub fn working_set(&self) -> &[Correspondence] {
        &self.working
    }

    /// Every correspondence observed since the last reset.
    pub fn samples(&self) -> &[Correspondence] {
        &self.samples
    }

    pub fn status(&self) -> CalibrationStatusEvent {
        let span = self.local_bounds.span();
        CalibrationStatusEvent {
            sn: self.sn.clone(),
            state: self.state(),
            transform: self.fit.as_ref().map(RigidFit::transform),
            mean_error: self.fit.as_ref().map(|f| f.mean_error),
            local_span: [span.x, span.y, span.z],
            flags: self.flags,
            point_count: self.working.len(),
        }
    }

    /// Forget everything observed for this probe.
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.sn));
    }

    /// Map a stage position through the published transform.
    pub fn local_to_global(&self, local: &Pt3) -> Option<Pt3> {
        self.published
            .as_ref()
            .map(|r| r.transform.transform_point(local))
    }

    /// Distance between `global` and `local` mapped through the current fit.
    pub fn current_point_error(&self, local: &Pt3, global: &Pt3) -> Option<Real> {
        self.fit.as_ref().map(|f| (f.apply(local) - *global).norm())
    }

    /// Feed one correspondence. Returns `true` when this observation moved the
    /// probe into [`ProbeState::Converged`].
    pub fn observe(&mut self, c: Correspondence, cfg: &RegistrarConfig) -> bool {
        self.samples.push(c);
        self.update_travel(&c, cfg);

        let mut working = self.samples.clone();
        let mut fit = fit_set(&working);

        if self.flags.all() && working.len() >= cfg.min_points {
            if let Some(mut current) = fit.take() {
                for &threshold in &cfg.outlier_schedule {
                    let pruned: Vec<Correspondence> = working
                        .iter()
                        .zip(&current.residuals)
                        .filter(|(_, r)| **r <= threshold)
                        .map(|(c, _)| *c)
                        .collect();
                    if pruned.len() < cfg.min_points || !trajectory_sufficient(&pruned, cfg) {
                        break;
                    }
                    let Some(refit) = fit_set(&pruned) else { break };
                    log::trace!(
                        "{}: pruned at {threshold} µm, {} points, mean error {:.2}",
                        self.sn,
                        pruned.len(),
                        refit.mean_error
                    );
                    working = pruned;
                    current = refit;
                }
                fit = Some(current);
            }
        }

        self.working = working;
        self.fit = fit;
        if self.fit.is_none() || self.working.len() < cfg.min_points {
            return false;
        }
        if !self.accept(cfg) {
            return false;
        }

        let Some(fit) = &self.fit else { return false };
        let newly = self.published.is_none();
        self.published = Some(Registration {
            transform: fit.transform(),
            mean_error: fit.mean_error,
        });
        if newly {
            log::info!(
                "probe {} converged: {} points, mean error {:.2} µm",
                self.sn,
                self.working.len(),
                fit.mean_error
            );
        }
        newly
    }

    /// Refit the working set with bundle-adjusted global points and publish
    /// the result. Records absent from `refined` keep their triangulated
    /// position.
    ///
    /// Returns `false`, keeping the prior registration, when the fit fails or
    /// misses the error bound.
    pub fn apply_refit(&mut self, refined: &HashMap<RecordId, Pt3>, cfg: &RegistrarConfig) -> bool {
        let set: Vec<Correspondence> = self
            .working
            .iter()
            .map(|c| Correspondence {
                global: refined.get(&c.record).copied().unwrap_or(c.global),
                ..*c
            })
            .collect();
        if set.len() <= cfg.min_points {
            log::warn!("{}: refit rejected, {} points", self.sn, set.len());
            return false;
        }
        let Some(fit) = fit_set(&set) else {
            return false;
        };
        if fit.mean_error >= cfg.max_mean_error {
            log::warn!(
                "{}: refit rejected, mean error {:.2} µm (limit {:.2})",
                self.sn,
                fit.mean_error,
                cfg.max_mean_error
            );
            return false;
        }
        log::info!(
            "probe {} refit on {} refined points, mean error {:.2} µm",
            self.sn,
            set.len(),
            fit.mean_error
        );
        self.published = Some(Registration {
            transform: fit.transform(),
            mean_error: fit.mean_error,
        });
        self.working = set;
        self.fit = Some(fit);
        true
    }

    fn update_travel(&mut self, c: &Correspondence, cfg: &RegistrarConfig) {
        self.local_bounds.include(&c.local);
        self.global_bounds.include(&c.global);

        let span = self.local_bounds.span();
        let g = &self.global_bounds;
        // strictly on both sides of the axis
        let crosses = |axis: usize| g.min[axis] < 0.0 && g.max[axis] > 0.0;
        self.flags.x |= span.x > cfg.min_travel_xy && crosses(0);
        self.flags.y |= span.y > cfg.min_travel_xy && crosses(1);
        self.flags.z |= span.z > cfg.min_travel_z;
    }

    fn accept(&mut self, cfg: &RegistrarConfig) -> bool {
        let Some(fit) = &self.fit else { return false };
        if self.working.len() <= cfg.min_points {
            log::trace!("{}: {} points, need more", self.sn, self.working.len());
            return false;
        }
        if !trajectory_sufficient(&self.working, cfg) {
            log::trace!("{}: travel range not sufficient", self.sn);
            return false;
        }
        if fit.mean_error >= cfg.max_mean_error {
            log::trace!("{}: mean error {:.2} above threshold", self.sn, fit.mean_error);
            return false;
        }

        let t = fit.transform();
        let diff = t - self.prev_transform;
        let rot_ok = diff.fixed_view::<3, 3>(0, 0).amax() <= cfg.rotation_tolerance;
        let trans_ok = diff.fixed_view::<3, 1>(0, 3).amax() <= cfg.translation_tolerance;
        if !(rot_ok && trans_ok) {
            log::trace!("{}: transform not yet stable", self.sn);
            self.prev_transform = t;
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use probecal_core::{homogeneous_transform, rotation_from_rvec, Mat3};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn generator() -> (Mat3, Vec3) {
        (
            rotation_from_rvec(&Vec3::new(0.02, -0.03, 0.6)),
            Vec3::new(150.0, -80.0, 400.0),
        )
    }

    fn sample(id: usize, r: &Mat3, t: &Vec3, local: Pt3, noise: Vec3) -> Correspondence {
        Correspondence {
            record: RecordId(id as u64),
            local,
            global: Pt3::from(r * local.coords + t + noise),
        }
    }

    fn sweep(n: usize, noise: Real, seed: u64) -> Vec<Correspondence> {
        let (r, t) = generator();
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| {
                let local = Pt3::new(
                    rng.random_range(-2000.0..2000.0),
                    rng.random_range(-2000.0..2000.0),
                    rng.random_range(-300.0..300.0),
                );
                let n = Vec3::new(
                    rng.random_range(-noise..=noise),
                    rng.random_range(-noise..=noise),
                    rng.random_range(-noise..=noise),
                );
                sample(i, &r, &t, local, n)
            })
            .collect()
    }

    #[test]
    fn happy_path_converges() {
        let cfg = RegistrarConfig::default();
        let mut reg = ProbeRegistrar::new("SN1");
        assert_eq!(reg.state(), ProbeState::Empty);

        let mut transitions = 0;
        for c in sweep(30, 0.5, 7) {
            if reg.observe(c, &cfg) {
                transitions += 1;
            }
        }
        assert_eq!(transitions, 1);
        assert_eq!(reg.state(), ProbeState::Converged);

        let status = reg.status();
        assert!(status.flags.all());
        assert!(status.mean_error.unwrap() < 50.0);

        let (r, t) = generator();
        let expected = homogeneous_transform(&r, &t);
        let got = reg.registration().unwrap().transform;
        for i in 0..3 {
            for j in 0..3 {
                assert!((got[(i, j)] - expected[(i, j)]).abs() < 1e-3, "R[{i},{j}]");
            }
            assert!((got[(i, 3)] - expected[(i, 3)]).abs() < 1.0, "T[{i}]");
        }

        let local = Pt3::new(100.0, 200.0, 30.0);
        let mapped = reg.local_to_global(&local).unwrap();
        assert!((mapped.coords - (r * local.coords + t)).norm() < 1.0);
    }

    #[test]
    fn insufficient_travel_keeps_accumulating() {
        let cfg = RegistrarConfig::default();
        let (r, t) = generator();
        let mut rng = StdRng::seed_from_u64(3);
        let mut reg = ProbeRegistrar::new("SN2");
        for i in 0..10 {
            let local = Pt3::new(
                1000.0 + rng.random_range(0.0..200.0),
                1000.0 + rng.random_range(0.0..200.0),
                500.0 + rng.random_range(0.0..200.0),
            );
            assert!(!reg.observe(sample(i, &r, &t, local, Vec3::zeros()), &cfg));
        }
        let status = reg.status();
        assert_eq!(status.state, ProbeState::Accumulating);
        assert_eq!(status.flags, TravelFlags::default());
        assert_eq!(status.point_count, 10);
        assert!(reg.local_to_global(&Pt3::origin()).is_none());
    }

    #[test]
    fn too_few_points_have_no_fit() {
        let cfg = RegistrarConfig::default();
        let mut reg = ProbeRegistrar::new("SN3");
        for c in sweep(3, 0.0, 1) {
            reg.observe(c, &cfg);
        }
        assert!(reg.fit().is_none());
        assert!(reg.status().transform.is_none());
        assert_eq!(reg.state(), ProbeState::Accumulating);
    }

    #[test]
    fn reset_returns_to_empty() {
        let cfg = RegistrarConfig::default();
        let mut reg = ProbeRegistrar::new("SN4");
        for c in sweep(30, 0.5, 11) {
            reg.observe(c, &cfg);
        }
        reg.reset();
        let status = reg.status();
        assert_eq!(status.sn, "SN4");
        assert_eq!(status.state, ProbeState::Empty);
        assert_eq!(status.point_count, 0);
        assert!(status.transform.is_none());
        assert_eq!(status.local_span, [0.0; 3]);

        reg.reset();
        assert_eq!(reg.state(), ProbeState::Empty);
    }

    #[test]
    fn pruning_drops_outliers_and_keeps_floor() {
        let cfg = RegistrarConfig {
            // keep the probe from converging so every observation prunes
            max_mean_error: 0.0,
            ..RegistrarConfig::default()
        };
        let mut reg = ProbeRegistrar::new("SN5");
        let mut data = sweep(24, 1.0, 5);
        for c in data.iter_mut().step_by(6) {
            c.global.z += 900.0;
        }

        let mut before = f64::INFINITY;
        for c in data {
            reg.observe(c, &cfg);
            if let Some(fit) = fit_set(reg.samples()) {
                before = fit.mean_error;
            }
        }
        let after = reg.fit().unwrap().mean_error;
        assert!(after <= before, "{after} > {before}");
        assert!(after < 5.0, "{after}");
        assert_eq!(reg.working_set().len(), 20);
        assert!(reg.working_set().len() >= cfg.min_points);
        assert_eq!(reg.samples().len(), 24);
    }

    #[test]
    fn pruning_stops_before_breaking_trajectory() {
        let cfg = RegistrarConfig {
            max_mean_error: 0.0,
            outlier_schedule: vec![1e-9],
            ..RegistrarConfig::default()
        };
        let mut reg = ProbeRegistrar::new("SN6");
        for c in sweep(12, 5.0, 9) {
            reg.observe(c, &cfg);
        }
        assert_eq!(reg.working_set().len(), 12);
    }

    #[test]
    fn refit_replaces_published_transform() {
        let cfg = RegistrarConfig::default();
        let mut reg = ProbeRegistrar::new("SN7");
        for c in sweep(30, 0.5, 7) {
            reg.observe(c, &cfg);
        }
        let before = *reg.registration().unwrap();

        let (r, t) = generator();
        let refined: HashMap<RecordId, Pt3> = reg
            .working_set()
            .iter()
            .map(|c| (c.record, Pt3::from(r * c.local.coords + t)))
            .collect();
        assert!(reg.apply_refit(&refined, &cfg));
        let after = *reg.registration().unwrap();
        assert!(after.mean_error < 1e-6, "{}", after.mean_error);
        assert!(after.mean_error < before.mean_error);
        assert_eq!(reg.state(), ProbeState::Converged);

        let c = reg.working_set()[0];
        assert!(reg.current_point_error(&c.local, &c.global).unwrap() < 1e-6);
    }

    #[test]
    fn refit_beyond_error_bound_keeps_registration() {
        let cfg = RegistrarConfig::default();
        let mut reg = ProbeRegistrar::new("SN8");
        for c in sweep(30, 0.5, 7) {
            reg.observe(c, &cfg);
        }
        let before = *reg.registration().unwrap();
        let working = reg.working_set().len();

        // points scattered far from any rigid image of the stage positions
        let mut rng = StdRng::seed_from_u64(12);
        let refined: HashMap<RecordId, Pt3> = reg
            .working_set()
            .iter()
            .map(|c| {
                let jitter = Vec3::new(
                    rng.random_range(-500.0..500.0),
                    rng.random_range(-500.0..500.0),
                    rng.random_range(-500.0..500.0),
                );
                (c.record, c.global + jitter)
            })
            .collect();
        assert!(!reg.apply_refit(&refined, &cfg));
        assert_eq!(*reg.registration().unwrap(), before);
        assert_eq!(reg.working_set().len(), working);
    }
}
