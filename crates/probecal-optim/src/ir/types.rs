use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// Index of a parameter block inside one [`ProblemIR`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(pub usize);

/// Parameterization of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Manifold {
    Euclidean,
    /// Rigid transform stored as `[qx, qy, qz, qw, tx, ty, tz]`.
    Se3,
}

#[derive(Debug, Clone)]
pub struct ParamBlock {
    pub id: ParamId,
    /// Key of the block in the initial and solution maps.
    pub name: String,
    pub dim: usize,
    pub manifold: Manifold,
    /// Held at its initial value for the whole solve.
    pub fixed: bool,
}

/// Robust loss applied to one residual block.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RobustLoss {
    #[default]
    None,
    Huber {
        scale: f64,
    },
    Cauchy {
        scale: f64,
    },
}

/// Measurement carried by a residual block. Every variant is a 2D pixel
/// residual; the variant fixes which parameter blocks it reads.
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    /// Reticle point `pw` (mm) seen at `uv` by a camera at `pose`.
    ///
    /// Blocks: `[intrinsics(4), distortion(5), pose(se3)]`.
    ReticlePoint { pw: [f64; 3], uv: [f64; 2], w: f64 },
    /// Reticle point seen by the second camera of a pair, placed through
    /// `a_to_b * pose_a`.
    ///
    /// Blocks: `[intrinsics(4), distortion(5), a_to_b(se3), pose_a(se3)]`.
    PairedReticlePoint { pw: [f64; 3], uv: [f64; 2], w: f64 },
    /// Free point (µm) seen by a bundle camera.
    ///
    /// Blocks: `[camera(12), point(3)]`.
    BundlePoint {
        uv: [f64; 2],
        principal_point: [f64; 2],
        w: f64,
    },
}

impl Measurement {
    pub const RESIDUAL_DIM: usize = 2;

    fn blocks(&self) -> &'static [(usize, Manifold)] {
        use Manifold::{Euclidean as E, Se3};
        match self {
            Measurement::ReticlePoint { .. } => &[(4, E), (5, E), (7, Se3)],
            Measurement::PairedReticlePoint { .. } => &[(4, E), (5, E), (7, Se3), (7, Se3)],
            Measurement::BundlePoint { .. } => &[(12, E), (3, E)],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResidualBlock {
    pub params: Vec<ParamId>,
    pub measurement: Measurement,
    pub loss: RobustLoss,
}

/// A least-squares problem independent of the solver that runs it.
#[derive(Debug, Default, Clone)]
pub struct ProblemIR {
    pub params: Vec<ParamBlock>,
    pub residuals: Vec<ResidualBlock>,
}

impl ProblemIR {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_param(
        &mut self,
        name: impl Into<String>,
        dim: usize,
        manifold: Manifold,
        fixed: bool,
    ) -> ParamId {
        let id = ParamId(self.params.len());
        self.params.push(ParamBlock {
            id,
            name: name.into(),
            dim,
            manifold,
            fixed,
        });
        id
    }

    pub fn add_residual(&mut self, params: Vec<ParamId>, measurement: Measurement, loss: RobustLoss) {
        self.residuals.push(ResidualBlock {
            params,
            measurement,
            loss,
        });
    }

    /// Check every residual block against the layout its measurement needs.
    pub fn validate(&self) -> Result<()> {
        for p in &self.params {
            ensure!(
                p.manifold != Manifold::Se3 || p.dim == 7,
                "{}: se3 block must have 7 entries, has {}",
                p.name,
                p.dim
            );
        }
        for (i, r) in self.residuals.iter().enumerate() {
            let layout = r.measurement.blocks();
            ensure!(
                r.params.len() == layout.len(),
                "residual {i}: {} blocks given, {} expected",
                r.params.len(),
                layout.len()
            );
            for (slot, (id, &(dim, manifold))) in r.params.iter().zip(layout).enumerate() {
                let Some(p) = self.params.get(id.0) else {
                    anyhow::bail!("residual {i}: unknown block {}", id.0);
                };
                ensure!(
                    p.dim == dim && p.manifold == manifold,
                    "residual {i} slot {slot}: {} is {}D {:?}, expected {dim}D {manifold:?}",
                    p.name,
                    p.dim,
                    p.manifold
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reticle_point() -> Measurement {
        Measurement::ReticlePoint {
            pw: [0.0; 3],
            uv: [0.0; 2],
            w: 1.0,
        }
    }

    #[test]
    fn matching_layout_validates() {
        let mut ir = ProblemIR::new();
        let cam = ir.add_param("cam", 4, Manifold::Euclidean, true);
        let dist = ir.add_param("dist", 5, Manifold::Euclidean, false);
        let pose = ir.add_param("pose", 7, Manifold::Se3, false);
        ir.add_residual(vec![cam, dist, pose], reticle_point(), RobustLoss::None);
        ir.validate().unwrap();
    }

    #[test]
    fn swapped_blocks_are_rejected() {
        let mut ir = ProblemIR::new();
        let cam = ir.add_param("cam", 4, Manifold::Euclidean, false);
        let dist = ir.add_param("dist", 5, Manifold::Euclidean, false);
        let pose = ir.add_param("pose", 7, Manifold::Se3, false);
        ir.add_residual(vec![dist, cam, pose], reticle_point(), RobustLoss::None);
        let err = ir.validate().unwrap_err().to_string();
        assert!(err.contains("slot 0"), "{err}");
    }

    #[test]
    fn short_se3_block_is_rejected() {
        let mut ir = ProblemIR::new();
        ir.add_param("pose", 6, Manifold::Se3, false);
        assert!(ir.validate().is_err());
    }
}
