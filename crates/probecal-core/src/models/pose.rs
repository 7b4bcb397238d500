use crate::{rotation_from_rvec, rvec_from_rotation, Iso3, Mat3, Mat4, Pt3, Real, Vec3};
use nalgebra::{Rotation3, Translation3, UnitQuaternion};
use serde::{Deserialize, Serialize};

/// Pose of the reticle frame expressed in a camera frame.
///
/// `X_cam = R * X_world + t`, translation in millimetres. Serialized as an
/// axis-angle rotation vector plus translation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "RvecTvec", into = "RvecTvec")]
pub struct CameraPose {
    pub cam_se3_world: Iso3,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RvecTvec {
    rvec: [Real; 3],
    tvec: [Real; 3],
}

impl From<RvecTvec> for CameraPose {
    fn from(v: RvecTvec) -> Self {
        CameraPose::from_rvec_tvec(&Vec3::from(v.rvec), &Vec3::from(v.tvec))
    }
}

impl From<CameraPose> for RvecTvec {
    fn from(p: CameraPose) -> Self {
        let r = p.rvec();
        let t = p.tvec();
        RvecTvec {
            rvec: [r.x, r.y, r.z],
            tvec: [t.x, t.y, t.z],
        }
    }
}

impl CameraPose {
    pub fn new(cam_se3_world: Iso3) -> Self {
        Self { cam_se3_world }
    }

    pub fn identity() -> Self {
        Self::new(Iso3::identity())
    }

    pub fn from_rvec_tvec(rvec: &Vec3, tvec: &Vec3) -> Self {
        Self::from_rotation_translation(&rotation_from_rvec(rvec), tvec)
    }

    pub fn from_rotation_translation(r: &Mat3, t: &Vec3) -> Self {
        let rot = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix(r));
        Self::new(Iso3::from_parts(Translation3::from(*t), rot))
    }

    pub fn rotation(&self) -> Mat3 {
        self.cam_se3_world.rotation.to_rotation_matrix().into_inner()
    }

    pub fn translation(&self) -> Vec3 {
        self.cam_se3_world.translation.vector
    }

    pub fn rvec(&self) -> Vec3 {
        rvec_from_rotation(&self.rotation())
    }

    pub fn tvec(&self) -> Vec3 {
        self.translation()
    }

    /// World (reticle) point into the camera frame.
    pub fn world_to_camera(&self, pw: &Pt3) -> Pt3 {
        self.cam_se3_world.transform_point(pw)
    }

    /// Camera-frame point back into the world frame: `Rᵀ X − Rᵀ t`.
    pub fn camera_to_world(&self, pc: &Pt3) -> Pt3 {
        self.cam_se3_world.inverse_transform_point(pc)
    }

    /// Camera centre in world coordinates.
    pub fn center(&self) -> Pt3 {
        self.camera_to_world(&Pt3::origin())
    }

    /// Relative pose mapping this camera's frame into `other`'s frame.
    pub fn relative_to(&self, other: &CameraPose) -> Iso3 {
        other.cam_se3_world * self.cam_se3_world.inverse()
    }

    pub fn to_homogeneous(&self) -> Mat4 {
        self.cam_se3_world.to_homogeneous()
    }
}
