use crate::math::normalize_points_2d;
use probecal_core::{Mat3, Pt2};
use nalgebra::DMatrix;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HomographyError {
    #[error("need at least 4 point correspondences, got {0}")]
    NotEnoughPoints(usize),
    #[error("point count mismatch: {world} world vs {image} image")]
    CountMismatch { world: usize, image: usize },
    #[error("degenerate point configuration")]
    Degenerate,
    #[error("svd failed")]
    SvdFailed,
}

/// Plane-to-image homography from at least four correspondences, with
/// Hartley normalization on both sides. The result is scaled to `H[2,2] = 1`.
pub fn dlt_homography(world: &[Pt2], image: &[Pt2]) -> Result<Mat3, HomographyError> {
    let n = world.len();
    if image.len() != n {
        return Err(HomographyError::CountMismatch {
            world: n,
            image: image.len(),
        });
    }
    if n < 4 {
        return Err(HomographyError::NotEnoughPoints(n));
    }

    let (world_n, t_world) = normalize_points_2d(world).ok_or(HomographyError::Degenerate)?;
    let (image_n, t_image) = normalize_points_2d(image).ok_or(HomographyError::Degenerate)?;

    // two rows per correspondence of A h = 0, h = row-major H; zero rows pad
    // the 4-point system to 9 so the SVD yields all nine right singular vectors
    let mut a = DMatrix::<f64>::zeros((2 * n).max(9), 9);
    for (i, (w, m)) in world_n.iter().zip(&image_n).enumerate() {
        let xw = [w.x, w.y, 1.0];
        for k in 0..3 {
            a[(2 * i, k)] = -xw[k];
            a[(2 * i + 1, 3 + k)] = -xw[k];
            a[(2 * i, 6 + k)] = m.x * xw[k];
            a[(2 * i + 1, 6 + k)] = m.y * xw[k];
        }
    }

    let v_t = a.svd(false, true).v_t.ok_or(HomographyError::SvdFailed)?;
    let h = v_t.row(v_t.nrows() - 1);
    let h_norm = Mat3::from_fn(|r, c| h[3 * r + c]);

    let t_image_inv = t_image.try_inverse().ok_or(HomographyError::Degenerate)?;
    let h_mat = t_image_inv * h_norm * t_world;
    let scale = h_mat[(2, 2)];
    if scale.abs() <= f64::EPSILON {
        return Err(HomographyError::Degenerate);
    }
    Ok(h_mat / scale)
}
