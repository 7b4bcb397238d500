use probecal_core::{Iso3, Mat3, Real};
use nalgebra::{Matrix3, Rotation3, Translation3, UnitQuaternion, Vector3};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanarPoseError {
    #[error("intrinsics matrix is not invertible")]
    SingularIntrinsics,
    #[error("homography columns are degenerate")]
    Degenerate,
    #[error("svd failed")]
    SvdFailed,
}

/// Pose of the reticle plane (`Z = 0`) in the camera frame from `H = K [r1 r2 t]`.
///
/// The homography scale is taken from the mean norm of the two rotation
/// columns and its sign puts the plane in front of the camera. The rotation is
/// projected onto SO(3) by SVD.
pub fn estimate_planar_pose_from_h(kmtx: &Mat3, hmtx: &Mat3) -> Result<Iso3, PlanarPoseError> {
    let k_inv = kmtx
        .try_inverse()
        .ok_or(PlanarPoseError::SingularIntrinsics)?;
    let m = k_inv * hmtx;

    let mean_norm = 0.5 * (m.column(0).norm() + m.column(1).norm());
    if mean_norm <= f64::EPSILON {
        return Err(PlanarPoseError::Degenerate);
    }
    let lambda = mean_norm.recip().copysign(m[(2, 2)]);
    let m = m * lambda;

    let r1: Vector3<Real> = m.column(0).into_owned();
    let r2: Vector3<Real> = m.column(1).into_owned();
    let approx = Matrix3::from_columns(&[r1, r2, r1.cross(&r2)]);

    let svd = approx.svd(true, true);
    let (Some(mut u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(PlanarPoseError::SvdFailed);
    };
    if (u * v_t).determinant() < 0.0 {
        u.column_mut(2).neg_mut();
    }
    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(u * v_t));
    Ok(Iso3::from_parts(Translation3::from(m.column(2).into_owned()), rotation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use probecal_core::FxFyCxCy;
    use nalgebra::{Isometry3, Rotation3, Vector3};

    fn make_kmtx() -> Mat3 {
        FxFyCxCy {
            fx: 800.0,
            fy: 780.0,
            cx: 640.0,
            cy: 360.0,
        }
        .k_matrix()
    }

    fn homography_for(kmtx: &Mat3, iso: &Iso3) -> Mat3 {
        // For a plane Z=0, homography is H = K [r1 r2 t]
        let r_mat = iso.rotation.to_rotation_matrix().into_inner();
        let mut hmtx = Mat3::zeros();
        hmtx.set_column(0, &(kmtx * r_mat.column(0)));
        hmtx.set_column(1, &(kmtx * r_mat.column(1)));
        hmtx.set_column(2, &(kmtx * iso.translation.vector));
        hmtx
    }

    #[test]
    fn planar_pose_from_h_recovers_pose() {
        let kmtx = make_kmtx();

        let rot = Rotation3::from_euler_angles(0.1, -0.05, 0.2);
        let t = Vector3::new(0.1, -0.05, 1.0);
        let iso_gt = Isometry3::from_parts(Translation3::from(t), rot.into());

        let iso_est = estimate_planar_pose_from_h(&kmtx, &homography_for(&kmtx, &iso_gt)).unwrap();

        assert!((iso_est.translation.vector - iso_gt.translation.vector).norm() < 1e-3);
        let angle = iso_est.rotation.angle_to(&iso_gt.rotation);
        assert!(angle < 1e-3, "rotation error too large: {}", angle);
    }

    #[test]
    fn negated_homography_gives_same_pose() {
        let kmtx = make_kmtx();
        let iso_gt = Isometry3::from_parts(
            Translation3::new(-0.2, 0.1, 2.0),
            Rotation3::from_euler_angles(-0.3, 0.2, 0.0).into(),
        );
        let h = -homography_for(&kmtx, &iso_gt);
        let iso_est = estimate_planar_pose_from_h(&kmtx, &h).unwrap();
        assert!(iso_est.translation.vector.z > 0.0);
        assert!((iso_est.translation.vector - iso_gt.translation.vector).norm() < 1e-3);
    }
}
