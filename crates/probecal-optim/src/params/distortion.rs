//! Distortion block.

use anyhow::{ensure, Result};
use nalgebra::{DVector, DVectorView};
use probecal_core::{BrownConrady5, Real};

/// Brown-Conrady coefficients in solver order `[k1, k2, k3, p1, p2]`.
///
/// This is not the `[k1, k2, p1, p2, k3]` order of [`BrownConrady5::to_opencv`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrownConrady5Params(pub [f64; 5]);

impl BrownConrady5Params {
    pub const DIM: usize = 5;

    pub fn from_core(d: &BrownConrady5<Real>) -> Self {
        Self([d.k1, d.k2, d.k3, d.p1, d.p2])
    }

    /// Back to the core model; the undistortion iteration count comes from `template`.
    pub fn to_core(self, template: &BrownConrady5<Real>) -> BrownConrady5<Real> {
        let [k1, k2, k3, p1, p2] = self.0;
        BrownConrady5 {
            k1,
            k2,
            k3,
            p1,
            p2,
            iters: template.iters,
        }
    }

    pub fn to_dvec(&self) -> DVector<f64> {
        DVector::from_column_slice(&self.0)
    }

    pub fn from_dvec(v: DVectorView<'_, f64>) -> Result<Self> {
        ensure!(v.len() == Self::DIM, "distortion block has {} entries, expected 5", v.len());
        Ok(Self([v[0], v[1], v[2], v[3], v[4]]))
    }
}
