//! MapLine: a 3D line-segment landmark.
//!
//! Mirrors the MapPoint lifecycle: created from depth back-projection of a
//! detected segment's endpoints, observed by keyframes, replaceable, and
//! flagged bad instead of destroyed.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::frame::descriptor::Descriptor;

use super::types::{KeyFrameId, MapLineId};

#[derive(Debug, Clone)]
pub struct MapLine {
    pub id: MapLineId,

    /// Endpoints in world frame.
    pub start: Vector3<f64>,
    pub end: Vector3<f64>,

    /// Representative LBD descriptor.
    pub descriptor: Descriptor,

    /// Observing keyframe -> line index in that keyframe.
    pub observations: HashMap<KeyFrameId, usize>,

    pub ref_keyframe: KeyFrameId,

    pub visible_count: u32,
    pub found_count: u32,

    pub is_bad: bool,
    pub replaced_by: Option<MapLineId>,
}

impl MapLine {
    pub fn new(
        id: MapLineId,
        start: Vector3<f64>,
        end: Vector3<f64>,
        descriptor: Descriptor,
        ref_keyframe: KeyFrameId,
    ) -> Self {
        Self {
            id,
            start,
            end,
            descriptor,
            observations: HashMap::new(),
            ref_keyframe,
            visible_count: 1,
            found_count: 1,
            is_bad: false,
            replaced_by: None,
        }
    }

    /// Unit direction from start to end.
    pub fn direction(&self) -> Vector3<f64> {
        let d = self.end - self.start;
        let n = d.norm();
        if n > 1e-12 {
            d / n
        } else {
            Vector3::zeros()
        }
    }

    pub fn midpoint(&self) -> Vector3<f64> {
        (self.start + self.end) * 0.5
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, line_idx: usize) {
        self.observations.insert(kf_id, line_idx);
    }

    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn increase_visible(&mut self) {
        self.visible_count += 1;
    }

    pub fn increase_found(&mut self) {
        self.found_count += 1;
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
        self.observations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_and_midpoint() {
        let ml = MapLine::new(
            MapLineId(0),
            Vector3::new(1.0, 0.0, 2.0),
            Vector3::new(1.0, 2.0, 2.0),
            Descriptor::default(),
            KeyFrameId(0),
        );
        assert!((ml.direction() - Vector3::new(0.0, 1.0, 0.0)).norm() < 1e-12);
        assert!((ml.midpoint() - Vector3::new(1.0, 1.0, 2.0)).norm() < 1e-12);
    }

    #[test]
    fn test_degenerate_direction_is_zero() {
        let p = Vector3::new(0.5, 0.5, 0.5);
        let ml = MapLine::new(MapLineId(0), p, p, Descriptor::default(), KeyFrameId(0));
        assert_eq!(ml.direction(), Vector3::zeros());
    }
}
