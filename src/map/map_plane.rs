//! MapPlane: a 3D planar landmark `(n, d)`.

use std::collections::HashMap;

use nalgebra::{Vector3, Vector4};

use super::types::{KeyFrameId, MapPlaneId};

#[derive(Debug, Clone)]
pub struct MapPlane {
    pub id: MapPlaneId,

    /// Plane coefficients `(nx, ny, nz, d)` in world frame, unit normal,
    /// `n . p + d = 0` for points `p` on the plane.
    pub coeffs: Vector4<f64>,

    /// Sparse sample of world-frame inlier points, grown as new
    /// observations are merged in.
    pub inliers: Vec<Vector3<f64>>,

    /// Observing keyframe -> plane index in that keyframe.
    pub observations: HashMap<KeyFrameId, usize>,

    pub ref_keyframe: KeyFrameId,

    pub is_bad: bool,
}

impl MapPlane {
    pub fn new(
        id: MapPlaneId,
        coeffs: Vector4<f64>,
        inliers: Vec<Vector3<f64>>,
        ref_keyframe: KeyFrameId,
    ) -> Self {
        Self {
            id,
            coeffs: normalize_plane(coeffs),
            inliers,
            observations: HashMap::new(),
            ref_keyframe,
            is_bad: false,
        }
    }

    pub fn normal(&self) -> Vector3<f64> {
        self.coeffs.xyz()
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, plane_idx: usize) {
        self.observations.insert(kf_id, plane_idx);
    }

    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
        self.observations.clear();
    }
}

/// Scale the coefficients so the normal has unit length.
pub fn normalize_plane(coeffs: Vector4<f64>) -> Vector4<f64> {
    let n = coeffs.xyz().norm();
    if n > 1e-12 {
        coeffs / n
    } else {
        coeffs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coefficients_normalized_on_construction() {
        let pl = MapPlane::new(
            MapPlaneId(0),
            Vector4::new(0.0, 0.0, 2.0, -6.0),
            vec![],
            KeyFrameId(0),
        );
        assert!((pl.normal().norm() - 1.0).abs() < 1e-12);
        assert!((pl.coeffs.w - -3.0).abs() < 1e-12);
    }
}
