//! Pinhole block `[fx, fy, cx, cy]`.

use anyhow::{ensure, Result};
use nalgebra::{DVector, DVectorView};
use probecal_core::{FxFyCxCy, Real};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics4(pub [f64; 4]);

impl Intrinsics4 {
    pub const DIM: usize = 4;

    pub fn from_core(k: &FxFyCxCy<Real>) -> Self {
        Self([k.fx, k.fy, k.cx, k.cy])
    }

    pub fn to_core(self) -> FxFyCxCy<Real> {
        let [fx, fy, cx, cy] = self.0;
        FxFyCxCy { fx, fy, cx, cy }
    }

    pub fn to_dvec(&self) -> DVector<f64> {
        DVector::from_column_slice(&self.0)
    }

    pub fn from_dvec(v: DVectorView<'_, f64>) -> Result<Self> {
        ensure!(v.len() == Self::DIM, "intrinsics block has {} entries, expected 4", v.len());
        Ok(Self([v[0], v[1], v[2], v[3]]))
    }
}
