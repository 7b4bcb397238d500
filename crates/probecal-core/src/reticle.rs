use crate::{CalibError, CalibResult, Pt2, Pt3, Real};
use serde::{Deserialize, Serialize};

/// Ticks on each side of the origin along one reticle axis.
pub const DEFAULT_HALF_TICKS: usize = 10;
/// Physical spacing between adjacent ticks in millimetres.
pub const DEFAULT_TICK_SPACING_MM: Real = 0.2;

/// Known 3D layout of the reticle: a line of ticks along X followed by a line of
/// ticks along Y, both centred on the shared origin in the `Z = 0` plane.
///
/// With the defaults each axis carries 21 ticks (indices `-10..=10`), so the
/// origin appears once in each line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReticleObjectPoints {
    pub half_ticks: usize,
    /// Tick spacing in millimetres.
    pub spacing: Real,
}

impl Default for ReticleObjectPoints {
    fn default() -> Self {
        Self {
            half_ticks: DEFAULT_HALF_TICKS,
            spacing: DEFAULT_TICK_SPACING_MM,
        }
    }
}

impl ReticleObjectPoints {
    pub fn ticks_per_axis(&self) -> usize {
        2 * self.half_ticks + 1
    }

    pub fn len(&self) -> usize {
        2 * self.ticks_per_axis()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    fn tick_coords(&self) -> impl Iterator<Item = Real> + '_ {
        let half = self.half_ticks as i64;
        (-half..=half).map(move |i| i as Real * self.spacing)
    }

    pub fn x_axis(&self) -> Vec<Pt3> {
        self.tick_coords().map(|x| Pt3::new(x, 0.0, 0.0)).collect()
    }

    pub fn y_axis(&self) -> Vec<Pt3> {
        self.tick_coords().map(|y| Pt3::new(0.0, y, 0.0)).collect()
    }

    /// X axis ticks followed by Y axis ticks.
    pub fn points(&self) -> Vec<Pt3> {
        let mut pts = self.x_axis();
        pts.extend(self.y_axis());
        pts
    }

    /// Index of the origin tick in the X line of [`Self::points`].
    pub fn origin_index_x(&self) -> usize {
        self.half_ticks
    }

    /// Index of the origin tick in the Y line of [`Self::points`].
    pub fn origin_index_y(&self) -> usize {
        self.ticks_per_axis() + self.half_ticks
    }
}

/// Detected pixel coordinates of the two reticle axis lines in one image.
///
/// Points are in the same order as [`ReticleObjectPoints::x_axis`] and
/// [`ReticleObjectPoints::y_axis`]; they are used positionally and never re-sorted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisDetections {
    pub x_axis: Vec<Pt2>,
    pub y_axis: Vec<Pt2>,
}

impl AxisDetections {
    pub fn new(x_axis: Vec<Pt2>, y_axis: Vec<Pt2>) -> Self {
        Self { x_axis, y_axis }
    }

    /// Check both lines against the reticle layout.
    pub fn validate(&self, reticle: &ReticleObjectPoints) -> CalibResult<()> {
        let expected = reticle.ticks_per_axis();
        if self.x_axis.len() != expected {
            return Err(CalibError::shape("x axis detections", expected, self.x_axis.len()));
        }
        if self.y_axis.len() != expected {
            return Err(CalibError::shape("y axis detections", expected, self.y_axis.len()));
        }
        Ok(())
    }

    /// X line followed by Y line, matching [`ReticleObjectPoints::points`].
    pub fn points(&self) -> Vec<Pt2> {
        self.x_axis.iter().chain(self.y_axis.iter()).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.x_axis.len() + self.y_axis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x_axis.is_empty() && self.y_axis.is_empty()
    }
}
