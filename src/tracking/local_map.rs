//! Local map selection and visibility testing.
//!
//! For every successfully tracked frame the local working set is rebuilt:
//! keyframes observing any of the frame's current landmarks, their best
//! covisible neighbors and spanning-tree relatives, then the union of the
//! landmarks those keyframes observe. Candidates are frustum-tested against
//! the current pose and handed to the matcher with their cached projections.

use std::collections::{HashMap, HashSet};

use crate::frame::Frame;
use crate::map::{KeyFrameId, Map, MapLineId, MapPointId};
use crate::matcher::{LineCandidate, PlaneCandidate, TrackCandidate};

/// Upper bound on the local keyframe set.
const MAX_LOCAL_KEYFRAMES: usize = 80;
/// Covisible neighbors pulled in per local keyframe.
const NEIGHBOR_KEYFRAMES: usize = 10;
/// Minimum cosine between the viewing ray and the landmark normal.
const MIN_VIEW_COS: f64 = 0.5;

/// The covisibility-based working set for the current frame.
#[derive(Debug, Default)]
pub struct LocalMap {
    pub keyframes: Vec<KeyFrameId>,
    pub points: Vec<MapPointId>,
    pub lines: Vec<MapLineId>,
}

impl LocalMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.points.clear();
        self.lines.clear();
    }

    /// Rebuild the whole working set. Returns the keyframe sharing most
    /// landmarks with the frame, the natural new reference keyframe.
    pub fn update(&mut self, frame: &Frame, map: &mut Map) -> Option<KeyFrameId> {
        let best = self.update_keyframes(frame, map);
        self.update_points(map);
        self.update_lines(map);
        best
    }

    fn update_keyframes(&mut self, frame: &Frame, map: &mut Map) -> Option<KeyFrameId> {
        // Vote: how many of the frame's landmarks does each keyframe see?
        let mut counter: HashMap<KeyFrameId, usize> = HashMap::new();
        for mp_id in frame.map_points.iter().flatten() {
            if let Some(mp) = map.get_map_point(*mp_id) {
                for &kf_id in mp.observations.keys() {
                    *counter.entry(kf_id).or_insert(0) += 1;
                }
            }
        }
        if counter.is_empty() {
            return None;
        }

        let best = counter
            .iter()
            .max_by_key(|(_, &count)| count)
            .map(|(&kf_id, _)| kf_id);

        let mut included: HashSet<KeyFrameId> = counter.keys().copied().collect();
        let observers: Vec<KeyFrameId> = counter.keys().copied().collect();

        // Expand with covisible neighbors and spanning-tree relatives.
        let mut expanded: Vec<KeyFrameId> = observers.clone();
        for kf_id in observers {
            if expanded.len() >= MAX_LOCAL_KEYFRAMES {
                break;
            }
            let (neighbors, parent, children) = match map.get_keyframe_mut(kf_id) {
                Some(kf) => (
                    kf.best_covisibles(NEIGHBOR_KEYFRAMES),
                    kf.parent,
                    kf.children.iter().copied().collect::<Vec<_>>(),
                ),
                None => continue,
            };
            for neighbor in neighbors
                .into_iter()
                .chain(children)
                .chain(parent)
            {
                if expanded.len() >= MAX_LOCAL_KEYFRAMES {
                    break;
                }
                if map.get_keyframe(neighbor).is_some() && included.insert(neighbor) {
                    expanded.push(neighbor);
                }
            }
        }

        self.keyframes = expanded;
        best
    }

    fn update_points(&mut self, map: &Map) {
        let mut seen: HashSet<MapPointId> = HashSet::new();
        self.points.clear();
        for &kf_id in &self.keyframes {
            let Some(kf) = map.get_keyframe(kf_id) else {
                continue;
            };
            for (_, mp_id) in kf.tracked_point_ids() {
                if map.get_map_point(mp_id).is_some() && seen.insert(mp_id) {
                    self.points.push(mp_id);
                }
            }
        }
    }

    fn update_lines(&mut self, map: &Map) {
        let mut seen: HashSet<MapLineId> = HashSet::new();
        self.lines.clear();
        for &kf_id in &self.keyframes {
            let Some(kf) = map.get_keyframe(kf_id) else {
                continue;
            };
            for ml_id in kf.map_lines.iter().flatten() {
                if map.get_map_line(*ml_id).is_some() && seen.insert(*ml_id) {
                    self.lines.push(*ml_id);
                }
            }
        }
    }

    /// Frustum-test the local points against the frame pose and cache the
    /// projections for the matcher. Landmarks already carried by the frame
    /// are skipped; every landmark entering the frustum gets its visible
    /// counter bumped.
    pub fn point_candidates(&self, frame: &Frame, map: &mut Map) -> Vec<TrackCandidate> {
        let Some(pose_cw) = frame.pose_cw() else {
            return Vec::new();
        };
        let rcw = pose_cw.rotation_matrix();
        let tcw = pose_cw.translation;
        let ow = -rcw.transpose() * tcw;

        let in_frame: HashSet<MapPointId> =
            frame.map_points.iter().flatten().copied().collect();
        // Landmarks the frame already tracks were evidently visible.
        for mp_id in &in_frame {
            if let Some(mp) = map.get_map_point_mut(*mp_id) {
                mp.increase_visible();
            }
        }

        let mut candidates = Vec::new();
        for &mp_id in &self.points {
            if in_frame.contains(&mp_id) {
                continue;
            }
            let Some(mp) = map.get_map_point_mut(mp_id) else {
                continue;
            };

            let p_cam = rcw * mp.position + tcw;
            if p_cam.z <= 0.0 {
                continue;
            }
            let inv_z = 1.0 / p_cam.z;
            let u = frame.camera.fx * p_cam.x * inv_z + frame.camera.cx;
            let v = frame.camera.fy * p_cam.y * inv_z + frame.camera.cy;
            if !frame.camera.is_in_image(u, v) {
                continue;
            }

            let po = mp.position - ow;
            let dist = po.norm();
            if !mp.is_in_distance_range(dist) {
                continue;
            }
            let view_cos = po.dot(&mp.normal) / dist;
            if view_cos < MIN_VIEW_COS {
                continue;
            }

            let predicted_level = mp.predict_scale(dist, &frame.pyramid);
            mp.increase_visible();
            candidates.push(TrackCandidate {
                id: mp_id,
                descriptor: mp.descriptor,
                proj_x: u,
                proj_y: v,
                proj_xr: u - frame.camera.bf * inv_z,
                predicted_level,
                view_cos,
            });
        }
        candidates
    }

    /// Project local lines into the frame for the line matcher. A candidate
    /// needs both endpoints in front of the camera and its midpoint inside
    /// the image.
    pub fn line_candidates(&self, frame: &Frame, map: &mut Map) -> Vec<LineCandidate> {
        let Some(pose_cw) = frame.pose_cw().cloned() else {
            return Vec::new();
        };

        let in_frame: HashSet<MapLineId> = frame.map_lines.iter().flatten().copied().collect();

        let mut candidates = Vec::new();
        for &ml_id in &self.lines {
            if in_frame.contains(&ml_id) {
                continue;
            }
            let Some(ml) = map.get_map_line_mut(ml_id) else {
                continue;
            };

            let s_cam = pose_cw.transform_point(&ml.start);
            let e_cam = pose_cw.transform_point(&ml.end);
            let (Some(s_proj), Some(e_proj)) =
                (frame.camera.project(&s_cam), frame.camera.project(&e_cam))
            else {
                continue;
            };
            let mid = (s_proj + e_proj) * 0.5;
            if !frame.camera.is_in_image(mid.x, mid.y) {
                continue;
            }

            ml.increase_visible();
            candidates.push(LineCandidate {
                id: ml_id,
                descriptor: ml.descriptor,
                start_proj: s_proj,
                end_proj: e_proj,
            });
        }
        candidates
    }

    /// All map planes as association candidates. Planes are few and global;
    /// the angle/offset gating happens in the matcher.
    pub fn plane_candidates(map: &Map) -> Vec<PlaneCandidate> {
        map.map_planes()
            .map(|pl| PlaneCandidate {
                id: pl.id,
                coeffs_world: pl.coeffs,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::descriptor::Descriptor;
    use crate::frame::features::{FrameFeatures, KeyPoint, ScalePyramid};
    use crate::frame::image::DepthImage;
    use crate::frame::CameraModel;
    use crate::geometry::SE3;
    use nalgebra::Vector3;
    use std::sync::Arc;

    fn camera() -> CameraModel {
        CameraModel::new(500.0, 500.0, 320.0, 240.0, [0.0; 5], 40.0, 640, 480)
    }

    fn posed_frame(n: usize) -> Frame {
        let depth = DepthImage::new(vec![2.0; 640 * 480], 640, 480);
        let features = FrameFeatures {
            keypoints: (0..n)
                .map(|i| KeyPoint {
                    x: 100.0 + 20.0 * i as f32,
                    y: 120.0,
                    octave: 0,
                    angle: 0.0,
                })
                .collect(),
            descriptors: vec![Descriptor::default(); n],
            lines: vec![],
            planes: vec![],
        };
        let mut frame = Frame::new(
            0.0,
            features,
            &depth,
            camera(),
            Arc::new(ScalePyramid::new(8, 1.2)),
            3.0,
        );
        frame.set_pose(SE3::identity());
        frame
    }

    /// Build a map with one keyframe observing `n` landmarks, and a frame
    /// sharing those landmark associations.
    fn map_with_keyframe(n: usize) -> (Map, Frame, KeyFrameId) {
        let mut map = Map::new();
        let mut frame = posed_frame(n);
        for i in 0..n {
            let pos = frame.unproject_keypoint(i).unwrap();
            let mp = map.create_map_point(pos, Descriptor::default(), KeyFrameId(0));
            frame.map_points[i] = Some(mp);
        }
        let kf_id = map.insert_keyframe(&frame);
        for mp_id in frame.map_points.iter().flatten() {
            map.refresh_point_descriptor(*mp_id);
        }
        (map, frame, kf_id)
    }

    #[test]
    fn test_update_selects_observing_keyframe() {
        let (mut map, frame, kf_id) = map_with_keyframe(20);
        let mut local = LocalMap::new();
        let best = local.update(&frame, &mut map);
        assert_eq!(best, Some(kf_id));
        assert_eq!(local.keyframes, vec![kf_id]);
        assert_eq!(local.points.len(), 20);
    }

    #[test]
    fn test_candidates_exclude_points_already_in_frame() {
        let (mut map, frame, _) = map_with_keyframe(10);
        let mut local = LocalMap::new();
        local.update(&frame, &mut map);

        // Every local point is already associated with the frame.
        let candidates = local.point_candidates(&frame, &mut map);
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_candidates_include_unseen_visible_points() {
        let (mut map, mut frame, kf_id) = map_with_keyframe(10);
        let extra = map.create_map_point(
            Vector3::new(0.0, 0.0, 2.0),
            Descriptor::default(),
            kf_id,
        );
        {
            let kf_center = map.get_keyframe(kf_id).unwrap().camera_center();
            let pyramid = ScalePyramid::new(8, 1.2);
            let mp = map.get_map_point_mut(extra).unwrap();
            mp.update_normal_and_depth([kf_center].iter(), &kf_center, 0, &pyramid);
        }
        let mut local = LocalMap::new();
        local.update(&frame, &mut map);
        local.points.push(extra);

        frame.set_pose(SE3::identity());
        let candidates = local.point_candidates(&frame, &mut map);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, extra);
        // Center pixel projection.
        assert!((candidates[0].proj_x - 320.0).abs() < 1e-9);
        assert!(candidates[0].view_cos > 0.99);
    }

    #[test]
    fn test_frustum_rejects_point_behind_camera() {
        let (mut map, frame, kf_id) = map_with_keyframe(5);
        let behind = map.create_map_point(
            Vector3::new(0.0, 0.0, -1.0),
            Descriptor::default(),
            kf_id,
        );
        let mut local = LocalMap::new();
        local.update(&frame, &mut map);
        local.points.push(behind);

        let candidates = local.point_candidates(&frame, &mut map);
        assert!(candidates.iter().all(|c| c.id != behind));
    }
}
