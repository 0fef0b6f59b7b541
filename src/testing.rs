//! Synthetic scene generation for integration-style tests.
//!
//! Builds a random 3D point cloud (optionally with orthogonal planes) and
//! renders it into `Frame`s under arbitrary camera poses, with controllable
//! degradation (depth dropout, fresh scene content, pure noise). Landmark
//! descriptors are random but stable per landmark, so descriptor matching
//! behaves like a perfect detector over an unambiguous scene.

use std::sync::Arc;

use nalgebra::{Vector3, Vector4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::frame::features::PlaneObservation;
use crate::frame::{CameraModel, DepthImage, Descriptor, Frame, FrameFeatures, KeyPoint, ScalePyramid};
use crate::geometry::SE3;
use crate::map::{shared_map, SharedMap};
use crate::mapping::{LocalMapping, QueuedLocalMapper};
use crate::matcher::transform_plane;
use crate::tracking::{Tracker, TrackerConfig};
use crate::vocabulary::{KeyFrameDatabase, OrbVocabulary};

pub fn random_descriptor(rng: &mut StdRng) -> Descriptor {
    let mut words = [0u32; 8];
    for w in &mut words {
        *w = rng.gen();
    }
    Descriptor(words)
}

#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    /// Fraction of keypoints rendered without a depth measurement.
    pub depth_dropout: f64,
    /// Replace every descriptor with random noise (an unmatchable frame).
    pub scramble_descriptors: bool,
    /// Fraction of landmarks rendered with a brand-new descriptor, as if
    /// fresh scene content had replaced them.
    pub fresh_fraction: f64,
}

pub struct SyntheticScene {
    pub points: Vec<Vector3<f64>>,
    pub descriptors: Vec<Descriptor>,
    /// World planes `(n, d)`; rendered as camera-frame observations.
    pub planes: Vec<Vector4<f64>>,
    pub camera: CameraModel,
    pub pyramid: Arc<ScalePyramid>,
}

impl SyntheticScene {
    /// Random points in the frustum of the identity camera, depths in
    /// [0.5, 5] m, focal length 500.
    pub fn new(n_points: usize, seed: u64) -> Self {
        let camera = CameraModel::new(500.0, 500.0, 320.0, 240.0, [0.0; 5], 40.0, 640, 480);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut points = Vec::with_capacity(n_points);
        let mut descriptors = Vec::with_capacity(n_points);
        for _ in 0..n_points {
            let u = rng.gen_range(30.0..610.0);
            let v = rng.gen_range(30.0..450.0);
            let z = rng.gen_range(0.5..5.0);
            points.push(camera.unproject(u, v, z));
            descriptors.push(random_descriptor(&mut rng));
        }
        Self {
            points,
            descriptors,
            planes: Vec::new(),
            camera,
            pyramid: Arc::new(ScalePyramid::new(8, 1.2)),
        }
    }

    /// Add a floor and two walls: three mutually orthogonal planes.
    pub fn with_planes(mut self) -> Self {
        self.planes = vec![
            Vector4::new(0.0, 1.0, 0.0, -1.5),  // floor at y = 1.5 (y points down)
            Vector4::new(1.0, 0.0, 0.0, -2.5),  // wall at x = 2.5
            Vector4::new(0.0, 0.0, 1.0, -6.0),  // wall at z = 6
        ];
        self
    }

    /// Render the scene from a camera pose into a frame.
    pub fn render(
        &self,
        pose_cw: &SE3,
        timestamp: f64,
        options: &RenderOptions,
        rng: &mut StdRng,
    ) -> Frame {
        let mut keypoints = Vec::new();
        let mut descriptors = Vec::new();
        let mut depth_data = vec![0.0f32; (self.camera.width * self.camera.height) as usize];

        for (i, point) in self.points.iter().enumerate() {
            let p_cam = pose_cw.transform_point(point);
            if p_cam.z < 0.05 {
                continue;
            }
            let Some(uv) = self.camera.project(&p_cam) else {
                continue;
            };
            if uv.x < 1.0
                || uv.y < 1.0
                || uv.x >= (self.camera.width - 1) as f64
                || uv.y >= (self.camera.height - 1) as f64
            {
                continue;
            }

            let fresh = (i as f64) < options.fresh_fraction * self.points.len() as f64;
            let descriptor = if options.scramble_descriptors || fresh {
                random_descriptor(rng)
            } else {
                self.descriptors[i]
            };

            keypoints.push(KeyPoint {
                x: uv.x as f32,
                y: uv.y as f32,
                octave: 0,
                angle: ((i * 37) % 360) as f32,
            });
            descriptors.push(descriptor);

            if rng.gen::<f64>() >= options.depth_dropout {
                let px = uv.x.round() as usize;
                let py = uv.y.round() as usize;
                depth_data[py * self.camera.width as usize + px] = p_cam.z as f32;
            }
        }

        let planes = self
            .planes
            .iter()
            .map(|plane_world| {
                let (n_cam, d_cam) = transform_plane(plane_world, pose_cw);
                PlaneObservation {
                    coeffs: Vector4::new(n_cam.x, n_cam.y, n_cam.z, d_cam),
                    inliers: Vec::new(),
                }
            })
            .collect();

        let depth = DepthImage::new(depth_data, self.camera.width, self.camera.height);
        Frame::new(
            timestamp,
            FrameFeatures {
                keypoints,
                descriptors,
                lines: Vec::new(),
                planes,
            },
            &depth,
            self.camera,
            Arc::clone(&self.pyramid),
            3.0,
        )
    }
}

/// Wire a tracker over a fresh map with a flat vocabulary built from the
/// scene's landmark descriptors. The queue receiver is returned so the
/// channel stays connected for the test's lifetime.
pub fn make_tracker(
    scene: &SyntheticScene,
    config: TrackerConfig,
) -> (
    Tracker,
    SharedMap,
    Arc<QueuedLocalMapper>,
    crossbeam_channel::Receiver<crate::map::KeyFrameId>,
) {
    let map = shared_map();
    let (mapper, receiver) = QueuedLocalMapper::new(3);
    let vocabulary = Arc::new(OrbVocabulary::from_words(scene.descriptors.clone()));
    let keyframe_db = Arc::new(KeyFrameDatabase::new());
    let tracker = Tracker::new(
        Arc::clone(&map),
        Arc::clone(&mapper) as Arc<dyn LocalMapping>,
        vocabulary,
        keyframe_db,
        config,
    );
    (tracker, map, mapper, receiver)
}
