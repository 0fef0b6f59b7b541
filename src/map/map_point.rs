//! MapPoint: a 3D point landmark observed by keyframes.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::frame::descriptor::Descriptor;
use crate::frame::features::ScalePyramid;

use super::types::{KeyFrameId, MapPointId};

/// A 3D landmark in the world frame.
///
/// Observations map observing keyframes to the keypoint slot in that
/// keyframe; the keyframe holds the reverse reference, and the [`Map`]
/// arena keeps the two sides consistent.
///
/// [`Map`]: crate::map::Map
#[derive(Debug, Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    /// Position in world frame.
    pub position: Vector3<f64>,

    /// Mean viewing direction (unit vector, world frame).
    pub normal: Vector3<f64>,

    /// Scale-invariance distance range: the landmark is recognizable across
    /// the pyramid between these viewing distances.
    pub min_distance: f64,
    pub max_distance: f64,

    /// Representative descriptor (median of the observers').
    pub descriptor: Descriptor,

    /// Observing keyframe -> keypoint index in that keyframe.
    pub observations: HashMap<KeyFrameId, usize>,

    /// KeyFrame that created this landmark.
    pub ref_keyframe: KeyFrameId,

    /// Times the landmark entered a frame's frustum / was actually matched.
    pub visible_count: u32,
    pub found_count: u32,

    /// Bad landmarks stay in the arena until compaction but are never
    /// returned from visibility queries.
    pub is_bad: bool,

    /// Forwarding target set by `Replace`: observers of this landmark were
    /// moved to the target and this one was marked bad.
    pub replaced_by: Option<MapPointId>,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        ref_keyframe: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            descriptor,
            observations: HashMap::new(),
            ref_keyframe,
            visible_count: 1,
            found_count: 1,
            is_bad: false,
            replaced_by: None,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, keypoint_idx: usize) {
        self.observations.insert(kf_id, keypoint_idx);
    }

    /// Returns true if the observation existed and was removed.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn is_observed_by(&self, kf_id: KeyFrameId) -> bool {
        self.observations.contains_key(&kf_id)
    }

    pub fn increase_visible(&mut self) {
        self.visible_count += 1;
    }

    pub fn increase_found(&mut self) {
        self.found_count += 1;
    }

    /// found / visible; 1.0 for landmarks that were never tested.
    pub fn found_ratio(&self) -> f64 {
        if self.visible_count == 0 {
            1.0
        } else {
            self.found_count as f64 / self.visible_count as f64
        }
    }

    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= self.min_distance && distance <= self.max_distance
    }

    /// Predicted pyramid level when viewed from `distance`.
    pub fn predict_scale(&self, distance: f64, pyramid: &ScalePyramid) -> usize {
        pyramid.predict_scale(distance, self.max_distance)
    }

    /// Recompute the mean viewing direction and scale-invariance range from
    /// the observer camera centers and the reference observation's octave.
    pub fn update_normal_and_depth<'a>(
        &mut self,
        observer_centers: impl Iterator<Item = &'a Vector3<f64>>,
        ref_center: &Vector3<f64>,
        ref_octave: i32,
        pyramid: &ScalePyramid,
    ) {
        let mut normal_sum = Vector3::zeros();
        let mut n = 0usize;
        for center in observer_centers {
            let dir = self.position - center;
            let dist = dir.norm();
            if dist > 1e-10 {
                normal_sum += dir / dist;
                n += 1;
            }
        }
        if n > 0 {
            let norm = normal_sum.norm();
            if norm > 1e-10 {
                self.normal = normal_sum / norm;
            }
        }

        let dist = (self.position - ref_center).norm();
        let level = ref_octave.clamp(0, pyramid.n_levels as i32 - 1) as usize;
        let level_scale = pyramid.scale_factors[level];
        self.max_distance = dist * level_scale;
        self.min_distance =
            self.max_distance * pyramid.inv_scale_factors[pyramid.n_levels - 1];
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
        self.observations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_point() -> MapPoint {
        MapPoint::new(
            MapPointId(1),
            Vector3::new(0.0, 0.0, 4.0),
            Descriptor::default(),
            KeyFrameId(0),
        )
    }

    #[test]
    fn test_observation_bookkeeping() {
        let mut mp = test_point();
        mp.add_observation(KeyFrameId(1), 12);
        mp.add_observation(KeyFrameId(2), 3);
        assert_eq!(mp.num_observations(), 2);
        assert!(mp.is_observed_by(KeyFrameId(1)));

        assert!(mp.erase_observation(KeyFrameId(1)));
        assert!(!mp.erase_observation(KeyFrameId(1)));
        assert_eq!(mp.num_observations(), 1);
    }

    #[test]
    fn test_found_ratio() {
        let mut mp = test_point();
        mp.visible_count = 0;
        assert_eq!(mp.found_ratio(), 1.0);
        mp.visible_count = 4;
        mp.found_count = 1;
        assert!((mp.found_ratio() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_normal_and_depth_update() {
        let pyramid = ScalePyramid::new(8, 1.2);
        let mut mp = test_point();
        let centers = [Vector3::zeros(), Vector3::new(0.2, 0.0, 0.0)];
        mp.update_normal_and_depth(centers.iter(), &Vector3::zeros(), 0, &pyramid);

        // Viewing directions both roughly +z.
        assert!(mp.normal.z > 0.99);
        // At octave 0 the max distance equals the reference distance.
        assert!((mp.max_distance - 4.0).abs() < 1e-9);
        assert!(mp.min_distance < mp.max_distance);
        assert!(mp.is_in_distance_range(4.0));
        assert!(!mp.is_in_distance_range(5.0));

        // A point detected at a coarser octave remains recognizable further.
        let mut coarse = test_point();
        coarse.update_normal_and_depth(centers.iter(), &Vector3::zeros(), 2, &pyramid);
        assert!(coarse.max_distance > mp.max_distance);
    }

    #[test]
    fn test_set_bad_clears_observations() {
        let mut mp = test_point();
        mp.add_observation(KeyFrameId(1), 0);
        mp.set_bad();
        assert!(mp.is_bad);
        assert_eq!(mp.num_observations(), 0);
    }
}
