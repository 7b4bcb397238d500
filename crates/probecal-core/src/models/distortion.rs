use nalgebra::{RealField, Vector2};
use serde::{Deserialize, Serialize};

pub trait DistortionModel<S: RealField + Copy> {
    fn distort(&self, n_undist: &Vector2<S>) -> Vector2<S>;
    fn undistort(&self, n_dist: &Vector2<S>) -> Vector2<S>;
}

/// Brown-Conrady radial (k1, k2, k3) and tangential (p1, p2) distortion.
///
/// The reticle tooling exchanges coefficients in `[k1, k2, p1, p2, k3]` order;
/// use [`BrownConrady5::from_opencv`] / [`BrownConrady5::to_opencv`] at that boundary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BrownConrady5<S: RealField> {
    pub k1: S,
    pub k2: S,
    pub k3: S,
    pub p1: S,
    pub p2: S,
    /// Fixed-point iterations used by `undistort` (0 selects 8).
    #[serde(default)]
    pub iters: u32,
}

impl<S: RealField + Copy> BrownConrady5<S> {
    /// Build from `[k1, k2, p1, p2, k3]`.
    pub fn from_opencv(c: [S; 5]) -> Self {
        Self {
            k1: c[0],
            k2: c[1],
            p1: c[2],
            p2: c[3],
            k3: c[4],
            iters: 8,
        }
    }

    /// Coefficients as `[k1, k2, p1, p2, k3]`.
    pub fn to_opencv(&self) -> [S; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    pub fn is_zero(&self) -> bool {
        [self.k1, self.k2, self.k3, self.p1, self.p2]
            .iter()
            .all(|c| *c == S::zero())
    }

    fn apply(&self, n: &Vector2<S>) -> Vector2<S> {
        let two = S::one() + S::one();
        let (x, y) = (n.x, n.y);
        let r2 = x * x + y * y;
        let radial = S::one() + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
        let tangential = Vector2::new(
            two * self.p1 * x * y + self.p2 * (r2 + two * x * x),
            self.p1 * (r2 + two * y * y) + two * self.p2 * x * y,
        );
        n * radial + tangential
    }
}

impl<S: RealField + Copy> DistortionModel<S> for BrownConrady5<S> {
    fn distort(&self, n_undist: &Vector2<S>) -> Vector2<S> {
        self.apply(n_undist)
    }

    /// Fixed-point inversion of [`Self::distort`].
    fn undistort(&self, n_dist: &Vector2<S>) -> Vector2<S> {
        let iters = if self.iters == 0 { 8 } else { self.iters };
        (0..iters).fold(*n_dist, |n, _| n - (self.apply(&n) - n_dist))
    }
}
