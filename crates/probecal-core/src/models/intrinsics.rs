use crate::{Mat3, Real};
use nalgebra::{Matrix3, RealField, Vector2};
use serde::{Deserialize, Serialize};

/// Intrinsics that map normalized image-plane coordinates to pixel coordinates.
pub trait IntrinsicsModel<S: RealField + Copy> {
    /// Convert normalized coordinates into pixel coordinates.
    fn to_pixel(&self, normalized: &Vector2<S>) -> Vector2<S>;
    /// Convert pixel coordinates into normalized coordinates.
    fn from_pixel(&self, pixel: &Vector2<S>) -> Vector2<S>;
}

/// Zero-skew pinhole intrinsics.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FxFyCxCy<S: RealField + Copy> {
    /// Focal length in pixels along X.
    pub fx: S,
    /// Focal length in pixels along Y.
    pub fy: S,
    /// Principal point X coordinate in pixels.
    pub cx: S,
    /// Principal point Y coordinate in pixels.
    pub cy: S,
}

impl<S: RealField + Copy> FxFyCxCy<S> {
    /// Return the 3x3 camera intrinsics matrix K.
    pub fn k_matrix(&self) -> Matrix3<S> {
        Matrix3::new(
            self.fx,
            S::zero(),
            self.cx,
            S::zero(),
            self.fy,
            self.cy,
            S::zero(),
            S::zero(),
            S::one(),
        )
    }
}

impl FxFyCxCy<Real> {
    /// Read fx, fy, cx, cy from a K matrix. Skew is ignored.
    pub fn from_k_matrix(k: &Mat3) -> Self {
        Self {
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
        }
    }
}

impl<S: RealField + Copy> IntrinsicsModel<S> for FxFyCxCy<S> {
    fn to_pixel(&self, normalized: &Vector2<S>) -> Vector2<S> {
        Vector2::new(
            self.fx * normalized.x + self.cx,
            self.fy * normalized.y + self.cy,
        )
    }

    fn from_pixel(&self, pixel: &Vector2<S>) -> Vector2<S> {
        Vector2::new((pixel.x - self.cx) / self.fx, (pixel.y - self.cy) / self.fy)
    }
}
