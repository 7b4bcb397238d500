//! SE3 blocks in tiny-solver layout `[qx, qy, qz, qw, tx, ty, tz]`.

use anyhow::{ensure, Result};
use nalgebra::{DVector, DVectorView, Quaternion, Translation3, UnitQuaternion};
use probecal_core::Iso3;

pub fn iso3_to_se3_dvec(pose: &Iso3) -> DVector<f64> {
    let q = pose.rotation.coords;
    let t = pose.translation.vector;
    DVector::from_column_slice(&[q.x, q.y, q.z, q.w, t.x, t.y, t.z])
}

pub fn se3_dvec_to_iso3(v: DVectorView<'_, f64>) -> Result<Iso3> {
    ensure!(v.len() == 7, "se3 block has {} entries, expected 7", v.len());
    let rotation = UnitQuaternion::from_quaternion(Quaternion::new(v[3], v[0], v[1], v[2]));
    Ok(Iso3::from_parts(Translation3::new(v[4], v[5], v[6]), rotation))
}
