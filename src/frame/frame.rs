//! The per-image `Frame` record.
//!
//! A `Frame` is transient: it is built on ingest, tracked against the map,
//! kept around as "last frame" for one more iteration, and then dropped
//! (unless promoted to a [`KeyFrame`](crate::map::KeyFrame)). Landmark
//! associations and outlier flags therefore live on the frame, not on the
//! shared landmarks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nalgebra::{Matrix3, Vector3};

use crate::frame::camera::CameraModel;
use crate::frame::descriptor::Descriptor;
use crate::frame::features::{FrameFeatures, KeyPoint, LineSegment, PlaneObservation, ScalePyramid};
use crate::frame::grid::FeatureGrid;
use crate::frame::image::DepthImage;
use crate::geometry::SE3;
use crate::map::{MapLineId, MapPlaneId, MapPointId};
use crate::vocabulary::{BowVector, FeatureVector, OrbVocabulary};

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonically increasing frame id.
    pub id: u64,
    pub timestamp: f64,

    pub camera: CameraModel,
    pub pyramid: Arc<ScalePyramid>,
    /// Close/far depth threshold in meters.
    pub th_depth: f64,

    /// Undistorted keypoints and their descriptors.
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,

    /// Depth per keypoint in meters; negative when unavailable.
    pub depths: Vec<f32>,
    /// Virtual right-image coordinate `uR = u - bf/z`; negative when the
    /// keypoint has no valid depth.
    pub u_right: Vec<f32>,

    /// Detected line segments and their endpoints back-projected to the
    /// camera frame where depth allowed it.
    pub lines: Vec<LineSegment>,
    pub line_endpoints_cam: Vec<Option<(Vector3<f64>, Vector3<f64>)>>,

    /// Depth-segmented planes in the camera frame.
    pub planes: Vec<PlaneObservation>,

    /// Landmark associations per feature slot, with per-slot outlier flags
    /// written by the pose optimizer.
    pub map_points: Vec<Option<MapPointId>>,
    pub outliers: Vec<bool>,
    pub map_lines: Vec<Option<MapLineId>>,
    pub line_outliers: Vec<bool>,
    pub map_planes: Vec<Option<MapPlaneId>>,

    /// Bag-of-words representation, computed on demand.
    pub bow: Option<(BowVector, FeatureVector)>,

    pub grid: FeatureGrid,

    /// World-to-camera pose; unset until tracking assigns one.
    pose_cw: Option<SE3>,
}

impl Frame {
    /// Build a frame from raw extractor output.
    ///
    /// Keypoint and line coordinates in `features` are raw (distorted)
    /// pixels: depth is sampled at the raw position, then the coordinates
    /// are undistorted for all further geometry.
    pub fn new(
        timestamp: f64,
        features: FrameFeatures,
        depth: &DepthImage,
        camera: CameraModel,
        pyramid: Arc<ScalePyramid>,
        th_depth: f64,
    ) -> Self {
        let id = NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed);
        let FrameFeatures {
            keypoints,
            descriptors,
            lines,
            planes,
        } = features;

        let n = keypoints.len();
        let mut depths = Vec::with_capacity(n);
        let mut u_right = Vec::with_capacity(n);
        let mut undistorted = Vec::with_capacity(n);

        for kp in &keypoints {
            let z = depth.sample(kp.x, kp.y).unwrap_or(-1.0);
            let p = camera.undistort_point(kp.x as f64, kp.y as f64);
            let kp_un = KeyPoint {
                x: p.x as f32,
                y: p.y as f32,
                ..*kp
            };
            depths.push(z);
            u_right.push(if z > 0.0 {
                (p.x - camera.bf / z as f64) as f32
            } else {
                -1.0
            });
            undistorted.push(kp_un);
        }

        let line_endpoints_cam = lines
            .iter()
            .map(|line| {
                let zs = depth.sample(line.start_x, line.start_y)?;
                let ze = depth.sample(line.end_x, line.end_y)?;
                let s = camera.unproject(line.start_x as f64, line.start_y as f64, zs as f64);
                let e = camera.unproject(line.end_x as f64, line.end_y as f64, ze as f64);
                Some((s, e))
            })
            .collect();

        let grid = FeatureGrid::new(&camera, &undistorted);
        let n_lines = lines.len();
        let n_planes = planes.len();

        Self {
            id,
            timestamp,
            camera,
            pyramid,
            th_depth,
            keypoints: undistorted,
            descriptors,
            depths,
            u_right,
            lines,
            line_endpoints_cam,
            planes,
            map_points: vec![None; n],
            outliers: vec![false; n],
            map_lines: vec![None; n_lines],
            line_outliers: vec![false; n_lines],
            map_planes: vec![None; n_planes],
            bow: None,
            grid,
            pose_cw: None,
        }
    }

    pub fn num_keypoints(&self) -> usize {
        self.keypoints.len()
    }

    /// A keypoint is "close" when its depth is reliable enough to create a
    /// landmark from this single view.
    pub fn is_close(&self, idx: usize) -> bool {
        let z = self.depths[idx];
        z > 0.0 && (z as f64) < self.th_depth
    }

    pub fn set_pose(&mut self, pose_cw: SE3) {
        self.pose_cw = Some(pose_cw);
    }

    pub fn clear_pose(&mut self) {
        self.pose_cw = None;
    }

    pub fn pose_cw(&self) -> Option<&SE3> {
        self.pose_cw.as_ref()
    }

    pub fn rotation_cw(&self) -> Option<Matrix3<f64>> {
        self.pose_cw.as_ref().map(|p| p.rotation_matrix())
    }

    /// Camera center in world frame: `-R_cw^T * t_cw`.
    pub fn camera_center(&self) -> Option<Vector3<f64>> {
        self.pose_cw.as_ref().map(|p| p.inverse().translation)
    }

    /// Back-project keypoint `idx` to world coordinates using its depth.
    /// Requires a pose and valid depth.
    pub fn unproject_keypoint(&self, idx: usize) -> Option<Vector3<f64>> {
        let z = self.depths[idx];
        if z <= 0.0 {
            return None;
        }
        let pose = self.pose_cw.as_ref()?;
        let kp = &self.keypoints[idx];
        let p_cam = self.camera.unproject(kp.x as f64, kp.y as f64, z as f64);
        Some(pose.inverse().transform_point(&p_cam))
    }

    /// Back-project line `idx`'s endpoints to world coordinates.
    pub fn unproject_line(&self, idx: usize) -> Option<(Vector3<f64>, Vector3<f64>)> {
        let (s_cam, e_cam) = self.line_endpoints_cam[idx]?;
        let t_wc = self.pose_cw.as_ref()?.inverse();
        Some((t_wc.transform_point(&s_cam), t_wc.transform_point(&e_cam)))
    }

    /// Keypoint indices inside a square window, both octave bounds inclusive
    /// (negative bound = unbounded).
    pub fn features_in_area(
        &self,
        u: f64,
        v: f64,
        r: f64,
        min_level: i32,
        max_level: i32,
    ) -> Vec<usize> {
        self.grid
            .features_in_area(&self.keypoints, u, v, r, min_level, max_level)
    }

    /// Compute the bag-of-words representation if not already present.
    pub fn compute_bow(&mut self, vocabulary: &OrbVocabulary) {
        if self.bow.is_none() {
            self.bow = Some(vocabulary.transform(&self.descriptors));
        }
    }

    /// Number of keypoint slots currently associated to a landmark.
    pub fn num_tracked_points(&self) -> usize {
        self.map_points.iter().filter(|m| m.is_some()).count()
    }

    /// Drop associations flagged as outliers by the optimizer.
    pub fn discard_outlier_points(&mut self) -> usize {
        let mut dropped = 0;
        for i in 0..self.map_points.len() {
            if self.outliers[i] && self.map_points[i].is_some() {
                self.map_points[i] = None;
                self.outliers[i] = false;
                dropped += 1;
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::features::FrameFeatures;

    fn camera() -> CameraModel {
        CameraModel::new(500.0, 500.0, 320.0, 240.0, [0.0; 5], 500.0 * 0.08, 640, 480)
    }

    fn flat_depth(z: f32) -> DepthImage {
        DepthImage::new(vec![z; 640 * 480], 640, 480)
    }

    fn frame_with_keypoints(kps: Vec<KeyPoint>, depth: &DepthImage) -> Frame {
        let n = kps.len();
        let features = FrameFeatures {
            keypoints: kps,
            descriptors: vec![Descriptor::default(); n],
            lines: vec![],
            planes: vec![],
        };
        Frame::new(
            0.0,
            features,
            depth,
            camera(),
            Arc::new(ScalePyramid::new(8, 1.2)),
            3.0,
        )
    }

    #[test]
    fn test_frame_ids_are_monotonic() {
        let depth = flat_depth(2.0);
        let a = frame_with_keypoints(vec![], &depth);
        let b = frame_with_keypoints(vec![], &depth);
        assert!(b.id > a.id);
    }

    #[test]
    fn test_virtual_right_coordinate() {
        let depth = flat_depth(2.0);
        let f = frame_with_keypoints(
            vec![KeyPoint {
                x: 400.0,
                y: 200.0,
                octave: 0,
                angle: 0.0,
            }],
            &depth,
        );
        // uR = u - bf/z = 400 - 40/2 = 380.
        assert!((f.u_right[0] - 380.0).abs() < 1e-4);
        assert!(f.is_close(0));
    }

    #[test]
    fn test_missing_depth_yields_invalid_stereo() {
        let depth = DepthImage::new(vec![0.0; 640 * 480], 640, 480);
        let f = frame_with_keypoints(
            vec![KeyPoint {
                x: 100.0,
                y: 100.0,
                octave: 0,
                angle: 0.0,
            }],
            &depth,
        );
        assert_eq!(f.u_right[0], -1.0);
        assert!(!f.is_close(0));
    }

    #[test]
    fn test_far_point_is_not_close() {
        let depth = flat_depth(5.0);
        let f = frame_with_keypoints(
            vec![KeyPoint {
                x: 100.0,
                y: 100.0,
                octave: 0,
                angle: 0.0,
            }],
            &depth,
        );
        assert!(f.u_right[0] > 0.0);
        assert!(!f.is_close(0));
    }

    #[test]
    fn test_unproject_keypoint_with_identity_pose() {
        let depth = flat_depth(2.0);
        let mut f = frame_with_keypoints(
            vec![KeyPoint {
                x: 320.0,
                y: 240.0,
                octave: 0,
                angle: 0.0,
            }],
            &depth,
        );
        assert!(f.unproject_keypoint(0).is_none()); // no pose yet
        f.set_pose(SE3::identity());
        let p = f.unproject_keypoint(0).unwrap();
        assert!((p - Vector3::new(0.0, 0.0, 2.0)).norm() < 1e-9);
    }

    #[test]
    fn test_discard_outliers() {
        let depth = flat_depth(2.0);
        let mut f = frame_with_keypoints(
            vec![
                KeyPoint {
                    x: 10.0,
                    y: 10.0,
                    octave: 0,
                    angle: 0.0,
                },
                KeyPoint {
                    x: 20.0,
                    y: 20.0,
                    octave: 0,
                    angle: 0.0,
                },
            ],
            &depth,
        );
        f.map_points[0] = Some(MapPointId(1));
        f.map_points[1] = Some(MapPointId(2));
        f.outliers[0] = true;
        assert_eq!(f.discard_outlier_points(), 1);
        assert!(f.map_points[0].is_none());
        assert_eq!(f.num_tracked_points(), 1);
    }
}
