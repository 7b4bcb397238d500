//! Keyed store of published stereo pairs.

use std::collections::BTreeMap;
use std::sync::Arc;

use probecal_core::{Pt2, Pt3, UM_PER_MM};

use crate::stereo::StereoPair;

/// Canonical key: the two ids in sorted order.
pub fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Stereo pairs keyed by their sorted camera ids, at most one per combination.
#[derive(Debug, Clone, Default)]
pub struct PairStore {
    pairs: BTreeMap<(String, String), Arc<StereoPair>>,
}

impl PairStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Publish a pair, replacing any earlier one for the same cameras.
    pub fn insert(&mut self, pair: Arc<StereoPair>) -> Option<Arc<StereoPair>> {
        self.pairs.insert(pair.key(), pair)
    }

    /// Swap the whole store for `pairs`.
    pub fn replace_all(&mut self, pairs: impl IntoIterator<Item = Arc<StereoPair>>) {
        self.pairs = pairs.into_iter().map(|p| (p.key(), p)).collect();
    }

    /// Look up a pair in either id order.
    pub fn get(&self, a: &str, b: &str) -> Option<Arc<StereoPair>> {
        self.pairs.get(&pair_key(a, b)).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<StereoPair>> {
        self.pairs.values()
    }

    /// Triangulate a point seen by two cameras into the reticle frame, in µm.
    ///
    /// Pixels are given in the caller's camera order and swapped to match the
    /// stored pair. `None` when no pair covers these cameras or the rays do not
    /// meet.
    pub fn triangulate_global(
        &self,
        cam_a: &str,
        px_a: &Pt2,
        cam_b: &str,
        px_b: &Pt2,
    ) -> Option<Pt3> {
        let pair = self.get(cam_a, cam_b)?;
        let (first, second) = if pair.camera_a == cam_a {
            (px_a, px_b)
        } else {
            (px_b, px_a)
        };
        match pair.global_coords(first, second) {
            Ok(p) => Some(Pt3::from(p.coords * UM_PER_MM)),
            Err(e) => {
                log::warn!("triangulation with {cam_a}-{cam_b} failed: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stereo::StereoPair;
    use probecal_core::synthetic;

    fn exact_pair(i: usize, j: usize) -> (StereoPair, Vec<synthetic::SyntheticCamera>) {
        let cams = synthetic::camera_ring(3, 40.0, 0.9);
        let a_to_b = cams[i].pose.relative_to(&cams[j].pose);
        let pair = StereoPair::from_geometry(
            &cams[i].id,
            &cams[j].id,
            cams[i].intrinsics,
            cams[j].intrinsics,
            cams[i].pose,
            &a_to_b,
            0.0,
        )
        .unwrap();
        (pair, cams)
    }

    #[test]
    fn lookup_is_order_independent() {
        let (pair, cams) = exact_pair(0, 1);
        let mut store = PairStore::new();
        store.insert(Arc::new(pair));

        let pw = Pt3::new(-1.2, 0.5, 0.25);
        let u0 = cams[0].project(&pw).unwrap();
        let u1 = cams[1].project(&pw).unwrap();

        let forward = store.triangulate_global("cam0", &u0, "cam1", &u1).unwrap();
        let backward = store.triangulate_global("cam1", &u1, "cam0", &u0).unwrap();
        let expected = pw.coords * UM_PER_MM;
        assert!((forward.coords - expected).norm() < 0.1, "{forward:?}");
        assert!((forward - backward).norm() < 1e-9);
    }

    #[test]
    fn missing_pair_is_unavailable() {
        let (pair, _) = exact_pair(0, 1);
        let mut store = PairStore::new();
        store.insert(Arc::new(pair));
        assert!(store
            .triangulate_global("cam0", &Pt2::origin(), "cam2", &Pt2::origin())
            .is_none());
    }

    #[test]
    fn replace_all_drops_old_pairs() {
        let mut store = PairStore::new();
        store.insert(Arc::new(exact_pair(0, 1).0));
        store.insert(Arc::new(exact_pair(1, 2).0));
        assert_eq!(store.len(), 2);

        store.replace_all([Arc::new(exact_pair(0, 2).0)]);
        assert_eq!(store.len(), 1);
        assert!(store.get("cam2", "cam0").is_some());
        assert!(store.get("cam0", "cam1").is_none());
    }
}
