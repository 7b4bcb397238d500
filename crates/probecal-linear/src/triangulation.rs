use probecal_core::{Mat34, Pt2, Pt3, Real};
use nalgebra::DMatrix;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TriangulationError {
    #[error("need at least 2 views, got {0}")]
    NotEnoughViews(usize),
    #[error("mismatched number of cameras ({cameras}) and points ({points})")]
    CountMismatch { cameras: usize, points: usize },
    #[error("svd failed during triangulation")]
    SvdFailed,
    /// The homogeneous solution lies at infinity (parallel rays).
    #[error("triangulation produced a point at infinity")]
    PointAtInfinity,
}

/// Linear triangulation of a single point from multiple views (DLT).
///
/// `cameras` are 3x4 projection matrices and `points` the matching ideal
/// (undistorted) pixels. The result is expressed in whatever frame the
/// projection matrices map from.
pub fn triangulate_point_linear(
    cameras: &[Mat34],
    points: &[Pt2],
) -> Result<Pt3, TriangulationError> {
    if cameras.len() < 2 {
        return Err(TriangulationError::NotEnoughViews(cameras.len()));
    }
    if cameras.len() != points.len() {
        return Err(TriangulationError::CountMismatch {
            cameras: cameras.len(),
            points: points.len(),
        });
    }

    let mut a = DMatrix::<Real>::zeros(2 * cameras.len(), 4);
    for (i, (p, cam)) in points.iter().zip(cameras.iter()).enumerate() {
        let row0 = cam.row(0);
        let row1 = cam.row(1);
        let row2 = cam.row(2);

        a.row_mut(2 * i).copy_from(&(p.x * row2 - row0));
        a.row_mut(2 * i + 1).copy_from(&(p.y * row2 - row1));
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(TriangulationError::SvdFailed)?;
    let x_h = v_t.row(v_t.nrows() - 1);

    let w = x_h[3];
    if w.abs() <= Real::EPSILON {
        return Err(TriangulationError::PointAtInfinity);
    }

    Ok(Pt3::new(x_h[0] / w, x_h[1] / w, x_h[2] / w))
}
