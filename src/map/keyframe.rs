//! KeyFrame: a frame promoted into the map.
//!
//! KeyFrames are the durable nodes of the map graph. They keep the promoted
//! frame's geometry, the landmark associations it carried, covisibility
//! edges to other keyframes and a spanning-tree link. Once inserted they are
//! never destroyed, only flagged bad by the mapping collaborator.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nalgebra::Vector3;

use crate::frame::camera::CameraModel;
use crate::frame::descriptor::Descriptor;
use crate::frame::features::{KeyPoint, LineSegment, PlaneObservation, ScalePyramid};
use crate::frame::grid::FeatureGrid;
use crate::frame::Frame;
use crate::geometry::SE3;
use crate::vocabulary::{BowVector, FeatureVector};

use super::types::{KeyFrameId, MapLineId, MapPlaneId, MapPointId};

#[derive(Debug, Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,
    /// Id of the frame this keyframe was promoted from.
    pub frame_id: u64,
    pub timestamp: f64,

    /// World-to-camera pose.
    pub pose_cw: SE3,

    pub camera: CameraModel,
    pub pyramid: Arc<ScalePyramid>,

    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    pub depths: Vec<f32>,
    pub u_right: Vec<f32>,
    pub lines: Vec<LineSegment>,
    pub line_endpoints_cam: Vec<Option<(Vector3<f64>, Vector3<f64>)>>,
    pub planes: Vec<PlaneObservation>,

    /// Landmark association per feature slot.
    pub map_points: Vec<Option<MapPointId>>,
    pub map_lines: Vec<Option<MapLineId>>,
    pub map_planes: Vec<Option<MapPlaneId>>,

    pub bow: Option<(BowVector, FeatureVector)>,
    pub grid: FeatureGrid,

    /// Covisibility edges: connected keyframe -> number of shared map points.
    covisibility_weights: HashMap<KeyFrameId, usize>,
    /// Cached edges ordered by weight (best first), rebuilt lazily.
    ordered_covisibles: Vec<(KeyFrameId, usize)>,
    covisibility_dirty: bool,

    /// Spanning tree.
    pub parent: Option<KeyFrameId>,
    pub children: HashSet<KeyFrameId>,

    pub is_bad: bool,
}

impl KeyFrame {
    /// Promote a tracked frame. The frame must carry a pose.
    pub fn from_frame(id: KeyFrameId, frame: &Frame) -> Self {
        let pose_cw = frame
            .pose_cw()
            .cloned()
            .unwrap_or_else(SE3::identity);
        Self {
            id,
            frame_id: frame.id,
            timestamp: frame.timestamp,
            pose_cw,
            camera: frame.camera,
            pyramid: Arc::clone(&frame.pyramid),
            keypoints: frame.keypoints.clone(),
            descriptors: frame.descriptors.clone(),
            depths: frame.depths.clone(),
            u_right: frame.u_right.clone(),
            lines: frame.lines.clone(),
            line_endpoints_cam: frame.line_endpoints_cam.clone(),
            planes: frame.planes.clone(),
            map_points: frame.map_points.clone(),
            map_lines: frame.map_lines.clone(),
            map_planes: frame.map_planes.clone(),
            bow: frame.bow.clone(),
            grid: frame.grid.clone(),
            covisibility_weights: HashMap::new(),
            ordered_covisibles: Vec::new(),
            covisibility_dirty: false,
            parent: None,
            children: HashSet::new(),
            is_bad: false,
        }
    }

    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose_cw.inverse().translation
    }

    pub fn num_keypoints(&self) -> usize {
        self.keypoints.len()
    }

    pub fn get_map_point(&self, idx: usize) -> Option<MapPointId> {
        self.map_points.get(idx).copied().flatten()
    }

    pub fn set_map_point(&mut self, idx: usize, mp_id: MapPointId) {
        if idx < self.map_points.len() {
            self.map_points[idx] = Some(mp_id);
        }
    }

    pub fn erase_map_point(&mut self, idx: usize) -> Option<MapPointId> {
        self.map_points.get_mut(idx).and_then(|slot| slot.take())
    }

    pub fn num_tracked_points(&self) -> usize {
        self.map_points.iter().filter(|m| m.is_some()).count()
    }

    /// Number of associated map points with at least `min_obs` observers.
    /// Needs the observation counts resolved by the caller, so the map
    /// provides the public wrapper.
    pub fn tracked_point_ids(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_points
            .iter()
            .enumerate()
            .filter_map(|(i, mp)| mp.map(|id| (i, id)))
    }

    pub fn features_in_area(&self, u: f64, v: f64, r: f64) -> Vec<usize> {
        self.grid
            .features_in_area(&self.keypoints, u, v, r, -1, -1)
    }

    pub fn is_in_image(&self, u: f64, v: f64) -> bool {
        self.camera.is_in_image(u, v)
    }

    // ── Covisibility graph ──────────────────────────────────────────────

    pub fn set_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        self.covisibility_weights.insert(kf_id, weight);
        self.covisibility_dirty = true;
    }

    pub fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        if self.covisibility_weights.remove(&kf_id).is_some() {
            self.covisibility_dirty = true;
        }
    }

    pub fn covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn covisibility_weights(&self) -> &HashMap<KeyFrameId, usize> {
        &self.covisibility_weights
    }

    /// The `n` covisible keyframes with most shared points, best first.
    pub fn best_covisibles(&mut self, n: usize) -> Vec<KeyFrameId> {
        self.ensure_ordered_covisibles();
        self.ordered_covisibles
            .iter()
            .take(n)
            .map(|(id, _)| *id)
            .collect()
    }

    fn ensure_ordered_covisibles(&mut self) {
        if !self.covisibility_dirty {
            return;
        }
        self.ordered_covisibles = self
            .covisibility_weights
            .iter()
            .map(|(id, w)| (*id, *w))
            .collect();
        self.ordered_covisibles.sort_by(|a, b| b.1.cmp(&a.1));
        self.covisibility_dirty = false;
    }

    // ── Spanning tree ───────────────────────────────────────────────────

    pub fn set_parent(&mut self, parent: KeyFrameId) {
        self.parent = Some(parent);
    }

    pub fn add_child(&mut self, child: KeyFrameId) {
        self.children.insert(child);
    }

    pub fn erase_child(&mut self, child: KeyFrameId) {
        self.children.remove(&child);
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::features::FrameFeatures;
    use crate::frame::image::DepthImage;

    fn test_keyframe(id: u64) -> KeyFrame {
        let camera = CameraModel::new(500.0, 500.0, 320.0, 240.0, [0.0; 5], 40.0, 640, 480);
        let depth = DepthImage::new(vec![2.0; 640 * 480], 640, 480);
        let mut frame = Frame::new(
            0.0,
            FrameFeatures::default(),
            &depth,
            camera,
            Arc::new(ScalePyramid::new(8, 1.2)),
            3.0,
        );
        frame.set_pose(SE3::identity());
        KeyFrame::from_frame(KeyFrameId(id), &frame)
    }

    #[test]
    fn test_covisibility_ordering() {
        let mut kf = test_keyframe(1);
        kf.set_covisibility(KeyFrameId(2), 50);
        kf.set_covisibility(KeyFrameId(3), 100);
        kf.set_covisibility(KeyFrameId(4), 25);

        assert_eq!(kf.covisibility_weight(KeyFrameId(2)), 50);
        assert_eq!(kf.covisibility_weight(KeyFrameId(9)), 0);

        let best = kf.best_covisibles(2);
        assert_eq!(best, vec![KeyFrameId(3), KeyFrameId(2)]);
    }

    #[test]
    fn test_no_self_covisibility() {
        let mut kf = test_keyframe(1);
        kf.set_covisibility(KeyFrameId(1), 10);
        assert_eq!(kf.covisibility_weight(KeyFrameId(1)), 0);
    }

    #[test]
    fn test_spanning_tree_links() {
        let mut parent = test_keyframe(1);
        let mut child = test_keyframe(2);
        child.set_parent(parent.id);
        parent.add_child(child.id);
        assert_eq!(child.parent, Some(KeyFrameId(1)));
        assert!(parent.children.contains(&KeyFrameId(2)));
        parent.erase_child(child.id);
        assert!(parent.children.is_empty());
    }
}
