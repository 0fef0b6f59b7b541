//! The shared map: arenas of keyframes and landmarks.
//!
//! The map owns every entity and is the single synchronization point for
//! structural changes: the tracker and the mapping collaborator share it as
//! `Arc<RwLock<Map>>` and perform all mutations under the write lock.
//! Consumers must not hold the lock across matcher or optimizer calls; they
//! snapshot what they need and release.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nalgebra::{Vector3, Vector4};
use parking_lot::RwLock;
use tracing::debug;

use crate::frame::descriptor::Descriptor;
use crate::frame::Frame;

use super::keyframe::KeyFrame;
use super::map_line::MapLine;
use super::map_plane::MapPlane;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapLineId, MapPlaneId, MapPointId};

/// Minimum shared observations for a covisibility edge.
const COVISIBILITY_THRESHOLD: usize = 15;

pub type SharedMap = Arc<RwLock<Map>>;

pub fn shared_map() -> SharedMap {
    Arc::new(RwLock::new(Map::new()))
}

#[derive(Debug, Default)]
pub struct Map {
    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,
    map_lines: HashMap<MapLineId, MapLine>,
    map_planes: HashMap<MapPlaneId, MapPlane>,

    // Id counters are monotonic across resets.
    next_keyframe_id: AtomicU64,
    next_point_id: AtomicU64,
    next_line_id: AtomicU64,
    next_plane_id: AtomicU64,
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all entities. Id counters keep counting so stale ids from before
    /// the reset can never alias new entities.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.map_lines.clear();
        self.map_planes.clear();
    }

    // ── KeyFrames ───────────────────────────────────────────────────────

    /// Promote a frame to a keyframe, registering the frame's landmark
    /// associations as observations and wiring the covisibility graph.
    pub fn insert_keyframe(&mut self, frame: &Frame) -> KeyFrameId {
        let id = KeyFrameId(self.next_keyframe_id.fetch_add(1, Ordering::Relaxed));
        let kf = KeyFrame::from_frame(id, frame);
        self.keyframes.insert(id, kf);

        let point_slots: Vec<(usize, MapPointId)> = self.keyframes[&id]
            .tracked_point_ids()
            .collect();
        for (idx, mp_id) in point_slots {
            match self.map_points.get_mut(&mp_id) {
                Some(mp) if !mp.is_bad => mp.add_observation(id, idx),
                _ => {
                    if let Some(kf) = self.keyframes.get_mut(&id) {
                        kf.erase_map_point(idx);
                    }
                }
            }
        }

        let line_slots: Vec<(usize, MapLineId)> = self.keyframes[&id]
            .map_lines
            .iter()
            .enumerate()
            .filter_map(|(i, ml)| ml.map(|l| (i, l)))
            .collect();
        for (idx, ml_id) in line_slots {
            if let Some(ml) = self.map_lines.get_mut(&ml_id) {
                if !ml.is_bad {
                    ml.add_observation(id, idx);
                }
            }
        }

        let plane_slots: Vec<(usize, MapPlaneId)> = self.keyframes[&id]
            .map_planes
            .iter()
            .enumerate()
            .filter_map(|(i, pl)| pl.map(|p| (i, p)))
            .collect();
        for (idx, pl_id) in plane_slots {
            if let Some(pl) = self.map_planes.get_mut(&pl_id) {
                if !pl.is_bad {
                    pl.add_observation(id, idx);
                }
            }
        }

        self.update_connections(id);
        debug!(kf = %id, "inserted keyframe");
        id
    }

    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id).filter(|kf| !kf.is_bad)
    }

    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values().filter(|kf| !kf.is_bad)
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    /// Number of map points tracked by a keyframe with at least `min_obs`
    /// observing keyframes.
    pub fn keyframe_tracked_points(&self, kf_id: KeyFrameId, min_obs: usize) -> usize {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return 0;
        };
        kf.tracked_point_ids()
            .filter(|(_, mp_id)| {
                self.map_points
                    .get(mp_id)
                    .map(|mp| !mp.is_bad && mp.num_observations() >= min_obs)
                    .unwrap_or(false)
            })
            .count()
    }

    // ── MapPoints ───────────────────────────────────────────────────────

    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        ref_keyframe: KeyFrameId,
    ) -> MapPointId {
        let id = MapPointId(self.next_point_id.fetch_add(1, Ordering::Relaxed));
        self.map_points
            .insert(id, MapPoint::new(id, position, descriptor, ref_keyframe));
        id
    }

    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id).filter(|mp| !mp.is_bad)
    }

    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id).filter(|mp| !mp.is_bad)
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values().filter(|mp| !mp.is_bad)
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.values().filter(|mp| !mp.is_bad).count()
    }

    /// Where a replaced landmark was forwarded to, if anywhere.
    pub fn replacement_of(&self, id: MapPointId) -> Option<MapPointId> {
        self.map_points.get(&id).and_then(|mp| mp.replaced_by)
    }

    /// Register the bidirectional observation `kf[idx] <-> mp`.
    pub fn add_observation(&mut self, mp_id: MapPointId, kf_id: KeyFrameId, idx: usize) {
        if let (Some(mp), Some(kf)) = (
            self.map_points.get_mut(&mp_id),
            self.keyframes.get_mut(&kf_id),
        ) {
            mp.add_observation(kf_id, idx);
            kf.set_map_point(idx, mp_id);
        }
    }

    /// Remove the observation from both sides. Landmarks left with fewer
    /// than two observers are flagged bad.
    pub fn erase_observation(&mut self, mp_id: MapPointId, kf_id: KeyFrameId) {
        let mut dead = false;
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            if let Some(idx) = mp.observations.remove(&kf_id) {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.erase_map_point(idx);
                }
            }
            dead = !mp.is_bad && mp.num_observations() < 2;
        }
        if dead {
            self.set_point_bad(mp_id);
        }
    }

    /// Flag a landmark bad and clear every keyframe slot referencing it.
    pub fn set_point_bad(&mut self, mp_id: MapPointId) {
        let observations: Vec<(KeyFrameId, usize)> = match self.map_points.get(&mp_id) {
            Some(mp) => mp.observations.iter().map(|(k, i)| (*k, *i)).collect(),
            None => return,
        };
        for (kf_id, idx) in observations {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.erase_map_point(idx);
            }
        }
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.set_bad();
        }
    }

    /// Delete a landmark outright. Only used for temporal points that never
    /// belonged to the durable map.
    pub fn remove_map_point(&mut self, mp_id: MapPointId) {
        self.set_point_bad(mp_id);
        self.map_points.remove(&mp_id);
    }

    /// Forward every observer of `old_id` to `new_id` and flag `old_id` bad.
    ///
    /// `replace(p, p)` is a no-op. Replacement chains: after `p.replace(q)`
    /// a further `p.replace(r)` forwards the observers that now sit on `q`
    /// to `r` and re-points `p` at `r`, so every observer ends up on the
    /// newest target.
    pub fn replace_map_point(&mut self, old_id: MapPointId, new_id: MapPointId) {
        if old_id == new_id {
            return;
        }
        if !self.map_points.contains_key(&new_id) {
            return;
        }
        let Some(old) = self.map_points.get(&old_id) else {
            return;
        };

        if old.is_bad {
            // Already replaced: its observers live on the forward target
            // now. Chase the chain, forward that target's observers to the
            // new landmark, and shortcut the stale forward.
            let Some(mut target) = old.replaced_by else {
                return;
            };
            while let Some(next) = self
                .map_points
                .get(&target)
                .and_then(|mp| mp.replaced_by)
            {
                if next == old_id {
                    break;
                }
                target = next;
            }
            if target != new_id {
                self.replace_map_point(target, new_id);
            }
            if let Some(old) = self.map_points.get_mut(&old_id) {
                old.replaced_by = Some(new_id);
            }
            return;
        }

        let observations: Vec<(KeyFrameId, usize)> =
            old.observations.iter().map(|(k, i)| (*k, *i)).collect();
        let (old_visible, old_found) = (old.visible_count, old.found_count);

        for (kf_id, idx) in observations {
            let already_observed = self
                .map_points
                .get(&new_id)
                .map(|mp| mp.is_observed_by(kf_id))
                .unwrap_or(true);
            if already_observed {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.erase_map_point(idx);
                }
            } else {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.set_map_point(idx, new_id);
                }
                if let Some(mp) = self.map_points.get_mut(&new_id) {
                    mp.add_observation(kf_id, idx);
                }
            }
        }

        if let Some(new) = self.map_points.get_mut(&new_id) {
            new.visible_count += old_visible;
            new.found_count += old_found;
        }
        if let Some(old) = self.map_points.get_mut(&old_id) {
            old.set_bad();
            old.replaced_by = Some(new_id);
        }
        self.refresh_point_descriptor(new_id);
    }

    /// Refresh a landmark's representative descriptor, viewing normal and
    /// scale-invariance range from its current observers.
    pub fn refresh_point_descriptor(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        if mp.is_bad || mp.observations.is_empty() {
            return;
        }

        let mut descriptors = Vec::with_capacity(mp.observations.len());
        let mut centers = Vec::with_capacity(mp.observations.len());
        let mut ref_center = None;
        let mut ref_octave = 0i32;
        for (&kf_id, &idx) in &mp.observations {
            if let Some(kf) = self.keyframes.get(&kf_id) {
                if let Some(d) = kf.descriptors.get(idx) {
                    descriptors.push(*d);
                }
                centers.push(kf.camera_center());
                if kf_id == mp.ref_keyframe || ref_center.is_none() {
                    ref_center = Some(kf.camera_center());
                    ref_octave = kf.keypoints.get(idx).map(|k| k.octave).unwrap_or(0);
                }
            }
        }

        let pyramid = match self.keyframes.values().next() {
            Some(kf) => Arc::clone(&kf.pyramid),
            None => return,
        };
        if let (Some(mp), Some(ref_center)) =
            (self.map_points.get_mut(&mp_id), ref_center)
        {
            if let Some(d) = Descriptor::most_distinctive(&descriptors) {
                mp.descriptor = d;
            }
            mp.update_normal_and_depth(centers.iter(), &ref_center, ref_octave, &pyramid);
        }
    }

    // ── MapLines ────────────────────────────────────────────────────────

    pub fn create_map_line(
        &mut self,
        start: Vector3<f64>,
        end: Vector3<f64>,
        descriptor: Descriptor,
        ref_keyframe: KeyFrameId,
    ) -> MapLineId {
        let id = MapLineId(self.next_line_id.fetch_add(1, Ordering::Relaxed));
        self.map_lines
            .insert(id, MapLine::new(id, start, end, descriptor, ref_keyframe));
        id
    }

    pub fn get_map_line(&self, id: MapLineId) -> Option<&MapLine> {
        self.map_lines.get(&id).filter(|ml| !ml.is_bad)
    }

    pub fn get_map_line_mut(&mut self, id: MapLineId) -> Option<&mut MapLine> {
        self.map_lines.get_mut(&id).filter(|ml| !ml.is_bad)
    }

    pub fn map_lines(&self) -> impl Iterator<Item = &MapLine> {
        self.map_lines.values().filter(|ml| !ml.is_bad)
    }

    pub fn num_map_lines(&self) -> usize {
        self.map_lines.values().filter(|ml| !ml.is_bad).count()
    }

    pub fn add_line_observation(&mut self, ml_id: MapLineId, kf_id: KeyFrameId, idx: usize) {
        if let (Some(ml), Some(kf)) = (
            self.map_lines.get_mut(&ml_id),
            self.keyframes.get_mut(&kf_id),
        ) {
            ml.add_observation(kf_id, idx);
            if idx < kf.map_lines.len() {
                kf.map_lines[idx] = Some(ml_id);
            }
        }
    }

    pub fn set_line_bad(&mut self, ml_id: MapLineId) {
        let observations: Vec<(KeyFrameId, usize)> = match self.map_lines.get(&ml_id) {
            Some(ml) => ml.observations.iter().map(|(k, i)| (*k, *i)).collect(),
            None => return,
        };
        for (kf_id, idx) in observations {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                if idx < kf.map_lines.len() {
                    kf.map_lines[idx] = None;
                }
            }
        }
        if let Some(ml) = self.map_lines.get_mut(&ml_id) {
            ml.set_bad();
        }
    }

    // ── MapPlanes ───────────────────────────────────────────────────────

    pub fn create_map_plane(
        &mut self,
        coeffs: Vector4<f64>,
        inliers: Vec<Vector3<f64>>,
        ref_keyframe: KeyFrameId,
    ) -> MapPlaneId {
        let id = MapPlaneId(self.next_plane_id.fetch_add(1, Ordering::Relaxed));
        self.map_planes
            .insert(id, MapPlane::new(id, coeffs, inliers, ref_keyframe));
        id
    }

    pub fn get_map_plane(&self, id: MapPlaneId) -> Option<&MapPlane> {
        self.map_planes.get(&id).filter(|pl| !pl.is_bad)
    }

    pub fn map_planes(&self) -> impl Iterator<Item = &MapPlane> {
        self.map_planes.values().filter(|pl| !pl.is_bad)
    }

    pub fn num_map_planes(&self) -> usize {
        self.map_planes.values().filter(|pl| !pl.is_bad).count()
    }

    pub fn add_plane_observation(&mut self, pl_id: MapPlaneId, kf_id: KeyFrameId, idx: usize) {
        if let (Some(pl), Some(kf)) = (
            self.map_planes.get_mut(&pl_id),
            self.keyframes.get_mut(&kf_id),
        ) {
            pl.add_observation(kf_id, idx);
            if idx < kf.map_planes.len() {
                kf.map_planes[idx] = Some(pl_id);
            }
        }
    }

    // ── Covisibility graph maintenance ──────────────────────────────────

    /// Rebuild the covisibility edges of a keyframe from its current point
    /// observations, mirror them on the neighbors, and attach the spanning
    /// tree parent on first connection.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        let mut counter: HashMap<KeyFrameId, usize> = HashMap::new();
        {
            let Some(kf) = self.keyframes.get(&kf_id) else {
                return;
            };
            for (_, mp_id) in kf.tracked_point_ids() {
                if let Some(mp) = self.map_points.get(&mp_id) {
                    if mp.is_bad {
                        continue;
                    }
                    for &other in mp.observations.keys() {
                        if other != kf_id {
                            *counter.entry(other).or_insert(0) += 1;
                        }
                    }
                }
            }
        }

        if counter.is_empty() {
            return;
        }

        let Some((&best_kf, &best_weight)) = counter.iter().max_by_key(|(_, &w)| w) else {
            return;
        };

        let mut edges: Vec<(KeyFrameId, usize)> = counter
            .iter()
            .filter(|(_, &w)| w >= COVISIBILITY_THRESHOLD)
            .map(|(&k, &w)| (k, w))
            .collect();
        if edges.is_empty() {
            // Keep at least the strongest connection.
            edges.push((best_kf, best_weight));
        }

        for &(other, weight) in &edges {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.set_covisibility(kf_id, weight);
            }
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            for (other, weight) in edges {
                kf.set_covisibility(other, weight);
            }
        }

        // First connection decides the spanning-tree parent.
        let needs_parent = self
            .keyframes
            .get(&kf_id)
            .map(|kf| kf.parent.is_none() && kf_id.0 > 0)
            .unwrap_or(false);
        if needs_parent {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.set_parent(best_kf);
            }
            if let Some(parent) = self.keyframes.get_mut(&best_kf) {
                parent.add_child(kf_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::camera::CameraModel;
    use crate::frame::features::{FrameFeatures, KeyPoint, ScalePyramid};
    use crate::frame::image::DepthImage;
    use crate::geometry::SE3;

    fn tracked_frame(n_points: usize, map: &mut Map, ref_kf: KeyFrameId) -> Frame {
        let camera = CameraModel::new(500.0, 500.0, 320.0, 240.0, [0.0; 5], 40.0, 640, 480);
        let depth = DepthImage::new(vec![2.0; 640 * 480], 640, 480);
        let keypoints = (0..n_points)
            .map(|i| KeyPoint {
                x: 50.0 + 5.0 * i as f32,
                y: 60.0,
                octave: 0,
                angle: 0.0,
            })
            .collect::<Vec<_>>();
        let features = FrameFeatures {
            descriptors: vec![Descriptor::default(); n_points],
            keypoints,
            lines: vec![],
            planes: vec![],
        };
        let mut frame = Frame::new(
            0.0,
            features,
            &depth,
            camera,
            Arc::new(ScalePyramid::new(8, 1.2)),
            3.0,
        );
        frame.set_pose(SE3::identity());
        for i in 0..n_points {
            let mp = map.create_map_point(
                Vector3::new(i as f64, 0.0, 2.0),
                Descriptor::default(),
                ref_kf,
            );
            frame.map_points[i] = Some(mp);
        }
        frame
    }

    #[test]
    fn test_observation_bidirectionality_on_insert() {
        let mut map = Map::new();
        let frame = tracked_frame(3, &mut map, KeyFrameId(0));
        let kf_id = map.insert_keyframe(&frame);

        let kf = map.get_keyframe(kf_id).unwrap();
        for (idx, mp_id) in kf.tracked_point_ids().collect::<Vec<_>>() {
            let mp = map.get_map_point(mp_id).unwrap();
            assert_eq!(mp.observations.get(&kf_id), Some(&idx));
        }
    }

    #[test]
    fn test_bad_points_invisible_to_queries() {
        let mut map = Map::new();
        let frame = tracked_frame(2, &mut map, KeyFrameId(0));
        let kf_id = map.insert_keyframe(&frame);
        let mp_id = map.get_keyframe(kf_id).unwrap().get_map_point(0).unwrap();

        map.set_point_bad(mp_id);
        assert!(map.get_map_point(mp_id).is_none());
        assert!(map.get_keyframe(kf_id).unwrap().get_map_point(0).is_none());
        assert_eq!(map.num_map_points(), 1);
    }

    #[test]
    fn test_replace_self_is_noop() {
        let mut map = Map::new();
        let frame = tracked_frame(1, &mut map, KeyFrameId(0));
        let kf_id = map.insert_keyframe(&frame);
        let mp = map.get_keyframe(kf_id).unwrap().get_map_point(0).unwrap();

        map.replace_map_point(mp, mp);
        assert!(map.get_map_point(mp).is_some());
        assert!(map.replacement_of(mp).is_none());
    }

    #[test]
    fn test_replace_chains_observers_to_newest_target() {
        let mut map = Map::new();
        let frame = tracked_frame(1, &mut map, KeyFrameId(0));
        let kf_id = map.insert_keyframe(&frame);
        let p = map.get_keyframe(kf_id).unwrap().get_map_point(0).unwrap();
        let q = map.create_map_point(Vector3::zeros(), Descriptor::default(), kf_id);
        let r = map.create_map_point(Vector3::zeros(), Descriptor::default(), kf_id);

        map.replace_map_point(p, q);
        assert!(map.get_map_point(p).is_none());
        assert_eq!(map.replacement_of(p), Some(q));
        assert_eq!(map.get_keyframe(kf_id).unwrap().get_map_point(0), Some(q));
        assert!(map.get_map_point(q).unwrap().is_observed_by(kf_id));

        // Chained replace: p stays bad, but every observer must end up on
        // the newest target.
        map.replace_map_point(p, r);
        assert!(map.get_map_point(p).is_none());
        assert_eq!(map.replacement_of(p), Some(r));
        assert_eq!(map.get_keyframe(kf_id).unwrap().get_map_point(0), Some(r));
        assert!(map.get_map_point(r).unwrap().is_observed_by(kf_id));
        // The intermediate target was forwarded along too.
        assert!(map.get_map_point(q).is_none());
        assert_eq!(map.replacement_of(q), Some(r));
    }

    #[test]
    fn test_ids_stay_monotonic_across_clear() {
        let mut map = Map::new();
        let a = map.create_map_point(Vector3::zeros(), Descriptor::default(), KeyFrameId(0));
        map.clear();
        let b = map.create_map_point(Vector3::zeros(), Descriptor::default(), KeyFrameId(0));
        assert!(b.0 > a.0);
    }

    #[test]
    fn test_covisibility_edges_from_shared_points() {
        let mut map = Map::new();
        let frame_a = tracked_frame(20, &mut map, KeyFrameId(0));
        let kf_a = map.insert_keyframe(&frame_a);

        // Second frame sees the same landmarks.
        let mut frame_b = tracked_frame(20, &mut map, kf_a);
        frame_b.map_points = frame_a.map_points.clone();
        let kf_b = map.insert_keyframe(&frame_b);

        let weight = map.get_keyframe(kf_b).unwrap().covisibility_weight(kf_a);
        assert_eq!(weight, 20);
        let back = map.get_keyframe(kf_a).unwrap().covisibility_weight(kf_b);
        assert_eq!(back, 20);
        assert_eq!(map.get_keyframe(kf_b).unwrap().parent, Some(kf_a));
    }
}
