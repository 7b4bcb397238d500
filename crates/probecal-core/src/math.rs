use nalgebra::{
    Isometry3, Matrix3, Matrix3x4, Matrix4, Point2, Point3, Rotation3, Vector2, Vector3,
};

pub type Real = f64;

pub type Vec2 = Vector2<Real>;
pub type Vec3 = Vector3<Real>;
pub type Pt2 = Point2<Real>;
pub type Pt3 = Point3<Real>;
pub type Mat3 = Matrix3<Real>;
pub type Mat4 = Matrix4<Real>;
pub type Mat34 = Matrix3x4<Real>;
pub type Iso3 = Isometry3<Real>;

/// Micrometres per millimetre.
pub const UM_PER_MM: Real = 1000.0;

pub fn to_homogeneous(p: &Pt2) -> Vec3 {
    Vec3::new(p.x, p.y, 1.0)
}

pub fn from_homogeneous(v: &Vec3) -> Pt2 {
    Pt2::new(v.x / v.z, v.y / v.z)
}

/// Cross-product matrix `[v]x` such that `[v]x * w = v × w`.
pub fn skew(v: &Vec3) -> Mat3 {
    Mat3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Rotation matrix from an axis-angle vector (Rodrigues).
pub fn rotation_from_rvec(rvec: &Vec3) -> Mat3 {
    Rotation3::new(*rvec).into_inner()
}

/// Axis-angle vector from a rotation matrix.
///
/// The input is re-orthonormalized first, so slightly drifted matrices are accepted.
pub fn rvec_from_rotation(r: &Mat3) -> Vec3 {
    Rotation3::from_matrix(r).scaled_axis()
}

/// Assemble a 4×4 homogeneous transform from rotation and translation.
pub fn homogeneous_transform(r: &Mat3, t: &Vec3) -> Mat4 {
    let mut m = Mat4::identity();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(r);
    m.fixed_view_mut::<3, 1>(0, 3).copy_from(t);
    m
}

/// Build the 3×4 projection matrix `K [R | t]`.
pub fn projection_matrix(k: &Mat3, r: &Mat3, t: &Vec3) -> Mat34 {
    let mut rt = Mat34::zeros();
    rt.fixed_view_mut::<3, 3>(0, 0).copy_from(r);
    rt.fixed_view_mut::<3, 1>(0, 3).copy_from(t);
    k * rt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rvec_roundtrip() {
        let rvec = Vec3::new(0.3, -0.2, 0.9);
        let r = rotation_from_rvec(&rvec);
        assert!((r.determinant() - 1.0).abs() < 1e-12);
        let back = rvec_from_rotation(&r);
        assert!((back - rvec).norm() < 1e-10);
    }

    #[test]
    fn skew_matches_cross_product() {
        let a = Vec3::new(1.0, 2.0, 3.0);
        let b = Vec3::new(-0.5, 0.25, 4.0);
        assert!((skew(&a) * b - a.cross(&b)).norm() < 1e-12);
    }

    #[test]
    fn homogeneous_transform_layout() {
        let r = rotation_from_rvec(&Vec3::new(0.0, 0.0, 0.5));
        let t = Vec3::new(1.0, 2.0, 3.0);
        let m = homogeneous_transform(&r, &t);
        assert_eq!(m[(0, 3)], 1.0);
        assert_eq!(m[(2, 3)], 3.0);
        assert_eq!(m[(3, 3)], 1.0);
        assert_eq!(m[(3, 0)], 0.0);
        assert!((m.fixed_view::<3, 3>(0, 0) - r).norm() < 1e-15);
    }
}
