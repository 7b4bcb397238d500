//! Pixel residuals of the reticle and bundle problems.
//!
//! Every model projects with `[fx, fy, cx, cy]` and Brown-Conrady
//! `[k1, k2, k3, p1, p2]` and returns `sqrt(w) * (measured - projected)`.

use nalgebra::{DVector, DVectorView, Quaternion, RealField, SVector, UnitQuaternion, Vector3};
use probecal_core::UM_PER_MM;

/// Reticle point (mm), its measured pixel and weight.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReticleSample {
    pub pw: [f64; 3],
    pub uv: [f64; 2],
    pub w: f64,
}

fn apply_se3<T: RealField>(pose: DVectorView<'_, T>, p: &Vector3<T>) -> Vector3<T> {
    debug_assert!(pose.len() == 7, "se3 block must have 7 params");
    let rot = UnitQuaternion::from_quaternion(Quaternion::new(
        pose[3].clone(),
        pose[0].clone(),
        pose[1].clone(),
        pose[2].clone(),
    ));
    rot.transform_vector(p) + Vector3::new(pose[4].clone(), pose[5].clone(), pose[6].clone())
}

fn constant_point<T: RealField>(p: [f64; 3]) -> Vector3<T> {
    Vector3::new(
        T::from_f64(p[0]).unwrap(),
        T::from_f64(p[1]).unwrap(),
        T::from_f64(p[2]).unwrap(),
    )
}

/// Brown-Conrady on normalized coordinates, `dist = [k1, k2, k3, p1, p2]`.
fn distort<T: RealField>(x: T, y: T, dist: DVectorView<'_, T>) -> (T, T) {
    let (k1, k2, k3) = (dist[0].clone(), dist[1].clone(), dist[2].clone());
    let (p1, p2) = (dist[3].clone(), dist[4].clone());
    let two = T::from_f64(2.0).unwrap();

    let xx = x.clone() * x.clone();
    let yy = y.clone() * y.clone();
    let xy = x.clone() * y.clone();
    let r2 = xx.clone() + yy.clone();
    let radial = T::one() + r2.clone() * (k1 + r2.clone() * (k2 + r2.clone() * k3));

    let dx = two.clone() * p1.clone() * xy.clone() + p2.clone() * (r2.clone() + two.clone() * xx);
    let dy = p1 * (r2 + two.clone() * yy) + two * p2 * xy;
    (x * radial.clone() + dx, y * radial + dy)
}

/// Perspective division with the depth clamped away from zero.
fn normalize<T: RealField>(pc: &Vector3<T>) -> (T, T) {
    let eps = T::from_f64(1e-12).unwrap();
    let z_safe = if pc.z.clone() > eps.clone() {
        pc.z.clone()
    } else {
        eps
    };
    (pc.x.clone() / z_safe.clone(), pc.y.clone() / z_safe)
}

/// Project a camera-frame point with `[fx, fy, cx, cy]` and `[k1, k2, k3, p1, p2]`,
/// returning the weighted residual against `uv`.
fn pinhole4_dist5_residual<T: RealField>(
    intr: DVectorView<'_, T>,
    dist: DVectorView<'_, T>,
    pc: &Vector3<T>,
    uv: [f64; 2],
    w: f64,
) -> SVector<T, 2> {
    debug_assert!(intr.len() >= 4, "intrinsics must have 4 params");
    debug_assert!(dist.len() >= 5, "distortion must have 5 params");

    let (xn, yn) = normalize(pc);
    let (xd, yd) = distort(xn, yn, dist);

    let u_proj = intr[0].clone() * xd + intr[2].clone();
    let v_proj = intr[1].clone() * yd + intr[3].clone();

    let sqrt_w = T::from_f64(w.sqrt()).unwrap();
    let u_meas = T::from_f64(uv[0]).unwrap();
    let v_meas = T::from_f64(uv[1]).unwrap();

    SVector::<T, 2>::new(
        (u_meas - u_proj) * sqrt_w.clone(),
        (v_meas - v_proj) * sqrt_w,
    )
}

/// Residual of a reticle point seen by a camera at `pose` (world to camera,
/// `[qx, qy, qz, qw, tx, ty, tz]`).
pub(crate) fn reticle_residual_generic<T: RealField>(
    intr: DVectorView<'_, T>,
    dist: DVectorView<'_, T>,
    pose: DVectorView<'_, T>,
    sample: &ReticleSample,
) -> SVector<T, 2> {
    let pc = apply_se3(pose, &constant_point(sample.pw));
    pinhole4_dist5_residual(intr, dist, &pc, sample.uv, sample.w)
}

/// Residual of a reticle point seen by the second camera of a pair, whose
/// pose is `a_to_b * pose_a`.
pub(crate) fn paired_reticle_residual_generic<T: RealField>(
    intr: DVectorView<'_, T>,
    dist: DVectorView<'_, T>,
    a_to_b: DVectorView<'_, T>,
    pose_a: DVectorView<'_, T>,
    sample: &ReticleSample,
) -> SVector<T, 2> {
    let pa = apply_se3(pose_a, &constant_point(sample.pw));
    let pc = apply_se3(a_to_b, &pa);
    pinhole4_dist5_residual(intr, dist, &pc, sample.uv, sample.w)
}

/// Rotate `p` by the axis-angle vector `r` (Rodrigues).
///
/// Near zero angle the first-order form `p + r × p` is used so derivatives stay
/// finite.
pub(crate) fn rotate_rvec_generic<T: RealField>(r: &Vector3<T>, p: &Vector3<T>) -> Vector3<T> {
    let theta2 = r.dot(r);
    if theta2.clone() > T::from_f64(1e-16).unwrap() {
        let theta = theta2.sqrt();
        let k = r / theta.clone();
        let cos_t = theta.clone().cos();
        let sin_t = theta.sin();
        let k_dot_p = k.dot(p);
        p * cos_t.clone() + k.cross(p) * sin_t + k * (k_dot_p * (T::one() - cos_t))
    } else {
        p + r.cross(p)
    }
}

/// Bundle adjustment residual for one observation.
///
/// `camera` is `[rx, ry, rz, tx, ty, tz, f, k1, k2, p1, p2, k3]` with the
/// translation in millimetres; `point` is in micrometres and converted to
/// millimetres before projection. The principal point is held fixed.
pub(crate) fn bundle_residual_generic<T: RealField>(
    camera: DVectorView<'_, T>,
    point: DVectorView<'_, T>,
    uv: [f64; 2],
    principal_point: [f64; 2],
    w: f64,
) -> SVector<T, 2> {
    debug_assert!(camera.len() == 12, "bundle camera must have 12 params");
    debug_assert!(point.len() == 3, "point must have 3 params");

    let um_per_mm = T::from_f64(UM_PER_MM).unwrap();
    let p_mm = Vector3::new(
        point[0].clone() / um_per_mm.clone(),
        point[1].clone() / um_per_mm.clone(),
        point[2].clone() / um_per_mm,
    );
    let rvec = Vector3::new(camera[0].clone(), camera[1].clone(), camera[2].clone());
    let t = Vector3::new(camera[3].clone(), camera[4].clone(), camera[5].clone());
    let pc = rotate_rvec_generic(&rvec, &p_mm) + t;

    let f = camera[6].clone();
    let intr = DVector::from_vec(vec![
        f.clone(),
        f,
        T::from_f64(principal_point[0]).unwrap(),
        T::from_f64(principal_point[1]).unwrap(),
    ]);
    // [k1, k2, p1, p2, k3] -> [k1, k2, k3, p1, p2]
    let dist = DVector::from_vec(vec![
        camera[7].clone(),
        camera[8].clone(),
        camera[11].clone(),
        camera[9].clone(),
        camera[10].clone(),
    ]);
    pinhole4_dist5_residual(intr.as_view(), dist.as_view(), &pc, uv, w)
}

/// `f64` form of [`reticle_residual_generic`] with unit weight.
pub fn reticle_residual(
    intr: &DVector<f64>,
    dist: &DVector<f64>,
    pose: &DVector<f64>,
    pw: [f64; 3],
    uv: [f64; 2],
) -> SVector<f64, 2> {
    let sample = ReticleSample { pw, uv, w: 1.0 };
    reticle_residual_generic(intr.as_view(), dist.as_view(), pose.as_view(), &sample)
}

/// `f64` form of [`paired_reticle_residual_generic`] with unit weight.
pub fn paired_reticle_residual(
    intr: &DVector<f64>,
    dist: &DVector<f64>,
    a_to_b: &DVector<f64>,
    pose_a: &DVector<f64>,
    pw: [f64; 3],
    uv: [f64; 2],
) -> SVector<f64, 2> {
    let sample = ReticleSample { pw, uv, w: 1.0 };
    paired_reticle_residual_generic(
        intr.as_view(),
        dist.as_view(),
        a_to_b.as_view(),
        pose_a.as_view(),
        &sample,
    )
}

/// `f64` form of [`bundle_residual_generic`] with unit weight.
pub fn bundle_residual(
    camera: &DVector<f64>,
    point: &DVector<f64>,
    uv: [f64; 2],
    principal_point: [f64; 2],
) -> SVector<f64, 2> {
    bundle_residual_generic(camera.as_view(), point.as_view(), uv, principal_point, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::pose_se3::iso3_to_se3_dvec;
    use probecal_core::{
        rotation_from_rvec, synthetic, BrownConrady5, CameraIntrinsics, FxFyCxCy, Pt3, Vec3,
    };

    #[test]
    fn rodrigues_matches_rotation_matrix() {
        for rvec in [Vec3::new(0.3, -0.7, 1.1), Vec3::new(1e-10, 0.0, -2e-10)] {
            let p = Vec3::new(1.0, -2.0, 0.5);
            let expected = rotation_from_rvec(&rvec) * p;
            let got = rotate_rvec_generic(&rvec, &p);
            assert!((got - expected).norm() < 1e-12, "{rvec:?}");
        }
    }

    #[test]
    fn residual_matches_camera_model() {
        let intrinsics = CameraIntrinsics::new(
            FxFyCxCy {
                fx: 15400.0,
                fy: 15300.0,
                cx: 2010.0,
                cy: 1490.0,
            },
            BrownConrady5 {
                k1: -0.2,
                k2: 0.05,
                k3: 0.01,
                p1: 1e-3,
                p2: -5e-4,
                iters: 8,
            },
        );
        let pose = synthetic::orbit_pose(40.0, 0.4, 0.9);
        let pw = Pt3::new(1.2, -0.4, 0.0);
        let px = intrinsics.project_world(&pose, &pw).unwrap();

        let intr = crate::params::intrinsics::Intrinsics4::from_core(&intrinsics.k).to_dvec();
        let dist =
            crate::params::distortion::BrownConrady5Params::from_core(&intrinsics.dist).to_dvec();
        let r = reticle_residual(
            &intr,
            &dist,
            &iso3_to_se3_dvec(&pose.cam_se3_world),
            [pw.x, pw.y, pw.z],
            [px.x, px.y],
        );
        assert!(r.norm() < 1e-8, "{r:?}");
    }

    #[test]
    fn bundle_residual_uses_micrometre_points() {
        let cam = synthetic::camera_ring(1, 40.0, 0.9).remove(0);
        let pw = Pt3::new(0.8, 0.3, 0.2);
        let px = cam.project(&pw).unwrap();

        let rvec = cam.pose.rvec();
        let tvec = cam.pose.tvec();
        let camera = nalgebra::dvector![
            rvec.x, rvec.y, rvec.z, tvec.x, tvec.y, tvec.z, cam.intrinsics.k.fx, 0.0, 0.0, 0.0,
            0.0, 0.0
        ];
        let point = nalgebra::dvector![800.0, 300.0, 200.0];
        let r = bundle_residual(&camera, &point, [px.x, px.y], [2000.0, 1500.0]);
        assert!(r.norm() < 1e-6, "{r:?}");
    }
}
