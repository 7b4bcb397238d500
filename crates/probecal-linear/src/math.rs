//! Numerical conditioning helpers.

use probecal_core::{Mat3, Pt2, Vec2};

/// Hartley normalization for 2D points.
///
/// Centers points at the origin and scales so that the mean distance from
/// the origin is `√2`. Returns the normalized points and the 3x3 transform
/// `T` with `p_norm = T * p_homogeneous`, or `None` for empty input or
/// coincident points.
pub fn normalize_points_2d(points: &[Pt2]) -> Option<(Vec<Pt2>, Mat3)> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vec2::zeros(), |acc, p| acc + p.coords) / n;
    let spread = points.iter().map(|p| (p.coords - centroid).norm()).sum::<f64>() / n;
    if spread <= f64::EPSILON {
        return None;
    }

    let s = std::f64::consts::SQRT_2 / spread;
    #[rustfmt::skip]
    let t = Mat3::new(
        s, 0.0, -s * centroid.x,
        0.0, s, -s * centroid.y,
        0.0, 0.0, 1.0,
    );
    let normalized = points
        .iter()
        .map(|p| Pt2::from((p.coords - centroid) * s))
        .collect();
    Some((normalized, t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_points_are_centered() {
        let pts = vec![
            Pt2::new(100.0, 200.0),
            Pt2::new(150.0, 250.0),
            Pt2::new(120.0, 220.0),
        ];
        let (norm, t) = normalize_points_2d(&pts).unwrap();
        let cx: f64 = norm.iter().map(|p| p.x).sum::<f64>() / 3.0;
        let cy: f64 = norm.iter().map(|p| p.y).sum::<f64>() / 3.0;
        assert!(cx.abs() < 1e-12 && cy.abs() < 1e-12);
        let mapped = t * probecal_core::to_homogeneous(&pts[1]);
        assert!((mapped.x - norm[1].x).abs() < 1e-12);
    }

    #[test]
    fn coincident_points_rejected() {
        assert!(normalize_points_2d(&[Pt2::new(1.0, 1.0); 4]).is_none());
    }
}
