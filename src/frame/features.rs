//! Feature primitives and the extraction seams.
//!
//! The tracking core consumes three feature modalities per frame: oriented
//! keypoints with binary descriptors, line segments with binary descriptors,
//! and depth-derived planes. The extractors themselves (ORB, LSD, plane
//! segmentation) live behind traits so the core never depends on how the
//! frontend produces them.

use anyhow::Result;
use nalgebra::{Vector3, Vector4};

use crate::frame::camera::CameraModel;
use crate::frame::descriptor::Descriptor;
use crate::frame::image::{DepthImage, GrayImage};

/// An oriented multi-scale keypoint with undistorted pixel coordinates.
#[derive(Debug, Clone, Copy)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    /// Pyramid level the point was detected at.
    pub octave: i32,
    /// Canonical orientation in degrees, [0, 360).
    pub angle: f32,
}

/// A detected 2D line segment with its binary descriptor.
#[derive(Debug, Clone, Copy)]
pub struct LineSegment {
    pub start_x: f32,
    pub start_y: f32,
    pub end_x: f32,
    pub end_y: f32,
    pub descriptor: Descriptor,
}

impl LineSegment {
    /// Normalized homogeneous line coefficients `(a, b, c)` with
    /// `a^2 + b^2 = 1`, so `a*u + b*v + c` is a signed pixel distance.
    pub fn coefficients(&self) -> Vector3<f64> {
        let p1 = Vector3::new(self.start_x as f64, self.start_y as f64, 1.0);
        let p2 = Vector3::new(self.end_x as f64, self.end_y as f64, 1.0);
        let l = p1.cross(&p2);
        let n = (l.x * l.x + l.y * l.y).sqrt();
        if n > 0.0 {
            l / n
        } else {
            l
        }
    }

    /// Segment length in pixels.
    pub fn length(&self) -> f32 {
        let dx = self.end_x - self.start_x;
        let dy = self.end_y - self.start_y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Segment direction angle in degrees, [0, 180).
    pub fn angle_deg(&self) -> f32 {
        let a = (self.end_y - self.start_y)
            .atan2(self.end_x - self.start_x)
            .to_degrees();
        a.rem_euclid(180.0)
    }
}

/// A plane segmented from the depth image, expressed in the camera frame.
#[derive(Debug, Clone)]
pub struct PlaneObservation {
    /// Plane coefficients `(nx, ny, nz, d)` with unit normal and
    /// `n . p + d = 0` for points `p` on the plane.
    pub coeffs: Vector4<f64>,
    /// A sparse sample of camera-frame inlier points on the plane.
    pub inliers: Vec<Vector3<f64>>,
}

impl PlaneObservation {
    pub fn normal(&self) -> Vector3<f64> {
        self.coeffs.xyz()
    }
}

/// Everything the extractors produce for one image.
#[derive(Debug, Clone, Default)]
pub struct FrameFeatures {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    pub lines: Vec<LineSegment>,
    pub planes: Vec<PlaneObservation>,
}

impl Default for KeyPoint {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            octave: 0,
            angle: 0.0,
        }
    }
}

/// Scale pyramid metadata shared by extraction, matching and optimization.
#[derive(Debug, Clone)]
pub struct ScalePyramid {
    pub n_levels: usize,
    pub scale_factor: f64,
    pub scale_factors: Vec<f64>,
    pub inv_scale_factors: Vec<f64>,
    pub level_sigma2: Vec<f64>,
    pub inv_level_sigma2: Vec<f64>,
    log_scale_factor: f64,
}

impl ScalePyramid {
    pub fn new(n_levels: usize, scale_factor: f64) -> Self {
        let mut scale_factors = Vec::with_capacity(n_levels);
        let mut inv_scale_factors = Vec::with_capacity(n_levels);
        let mut level_sigma2 = Vec::with_capacity(n_levels);
        let mut inv_level_sigma2 = Vec::with_capacity(n_levels);
        let mut s = 1.0f64;
        for _ in 0..n_levels {
            scale_factors.push(s);
            inv_scale_factors.push(1.0 / s);
            level_sigma2.push(s * s);
            inv_level_sigma2.push(1.0 / (s * s));
            s *= scale_factor;
        }
        Self {
            n_levels,
            scale_factor,
            scale_factors,
            inv_scale_factors,
            level_sigma2,
            inv_level_sigma2,
            log_scale_factor: scale_factor.ln(),
        }
    }

    /// Predicted pyramid level for observing a landmark at distance `dist`
    /// given its maximum scale-invariance distance.
    pub fn predict_scale(&self, dist: f64, max_distance: f64) -> usize {
        if dist <= 0.0 {
            return 0;
        }
        let ratio = max_distance / dist;
        let level = (ratio.ln() / self.log_scale_factor).ceil() as i64;
        level.clamp(0, self.n_levels as i64 - 1) as usize
    }
}

/// Oriented-keypoint + descriptor extractor (ORB in the reference frontend).
pub trait FeatureExtractor: Send {
    fn pyramid(&self) -> &ScalePyramid;

    /// Detect keypoints and compute their descriptors. Coordinates are raw
    /// (distorted) pixels; the frame builder undistorts them afterwards.
    fn extract(&self, image: &GrayImage) -> Result<(Vec<KeyPoint>, Vec<Descriptor>)>;
}

/// Line-segment extractor (LSD + LBD in the reference frontend).
pub trait LineExtractor: Send {
    fn extract(&self, image: &GrayImage) -> Result<Vec<LineSegment>>;
}

/// Plane segmenter over the depth image.
pub trait PlaneSegmenter: Send {
    fn segment(&self, depth: &DepthImage, camera: &CameraModel) -> Result<Vec<PlaneObservation>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pyramid_scales() {
        let pyr = ScalePyramid::new(8, 1.2);
        assert_eq!(pyr.scale_factors.len(), 8);
        assert!((pyr.scale_factors[0] - 1.0).abs() < 1e-12);
        assert!((pyr.scale_factors[2] - 1.44).abs() < 1e-9);
        assert!((pyr.level_sigma2[1] - 1.44).abs() < 1e-9);
        assert!((pyr.inv_level_sigma2[1] * pyr.level_sigma2[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_predict_scale_clamps_to_pyramid() {
        let pyr = ScalePyramid::new(8, 1.2);
        // At the maximum distance the point is seen at the finest level.
        assert_eq!(pyr.predict_scale(10.0, 10.0), 0);
        // Closer than max distance: coarser levels.
        let mid = pyr.predict_scale(10.0 / 1.2f64.powi(3), 10.0);
        assert_eq!(mid, 3);
        // Absurdly close: clamped to the coarsest level.
        assert_eq!(pyr.predict_scale(1e-6, 10.0), 7);
    }

    #[test]
    fn test_line_coefficients_measure_pixel_distance() {
        let line = LineSegment {
            start_x: 0.0,
            start_y: 10.0,
            end_x: 100.0,
            end_y: 10.0,
            descriptor: Descriptor::default(),
        };
        let l = line.coefficients();
        // Horizontal line v=10: distance of (50, 14) is 4 pixels.
        let d = l.x * 50.0 + l.y * 14.0 + l.z;
        assert!((d.abs() - 4.0).abs() < 1e-9);
        assert!((line.angle_deg() - 0.0).abs() < 1e-6);
    }
}
