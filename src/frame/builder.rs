//! OpenCV-backed frame construction frontend.
//!
//! This is the only tracking-side module touching OpenCV types: it converts
//! the incoming color image to grayscale honoring the configured channel
//! order, scales raw depth to meters, runs the extractors and hands a fully
//! typed [`Frame`] to the tracker.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use opencv::core::{no_array, Mat, Ptr, Vector, CV_32F, CV_8UC1, CV_8UC3, CV_8UC4};
use opencv::features2d::{ORB_ScoreType, ORB};
use opencv::imgproc;
use opencv::prelude::*;
use tracing::warn;

use crate::frame::camera::CameraModel;
use crate::frame::descriptor::Descriptor;
use crate::frame::features::{
    FeatureExtractor, FrameFeatures, KeyPoint, LineExtractor, PlaneSegmenter, ScalePyramid,
};
use crate::frame::image::{DepthImage, GrayImage};
use crate::frame::Frame;

pub struct FrameBuilder {
    camera: CameraModel,
    extractor: Box<dyn FeatureExtractor>,
    line_extractor: Option<Box<dyn LineExtractor>>,
    plane_segmenter: Option<Box<dyn PlaneSegmenter>>,
    /// Channel order of incoming color images: true = RGB, false = BGR.
    rgb_order: bool,
    /// Multiplier turning raw depth values into meters (1 / DepthMapFactor).
    depth_scale: f64,
    th_depth: f64,
    pyramid: Arc<ScalePyramid>,
}

impl FrameBuilder {
    pub fn new(
        camera: CameraModel,
        extractor: Box<dyn FeatureExtractor>,
        rgb_order: bool,
        depth_map_factor: f64,
        th_depth: f64,
    ) -> Self {
        let pyramid = Arc::new(extractor.pyramid().clone());
        Self {
            camera,
            extractor,
            line_extractor: None,
            plane_segmenter: None,
            rgb_order,
            depth_scale: 1.0 / depth_map_factor,
            th_depth,
            pyramid,
        }
    }

    pub fn with_line_extractor(mut self, extractor: Box<dyn LineExtractor>) -> Self {
        self.line_extractor = Some(extractor);
        self
    }

    pub fn with_plane_segmenter(mut self, segmenter: Box<dyn PlaneSegmenter>) -> Self {
        self.plane_segmenter = Some(segmenter);
        self
    }

    /// Build a frame from a raw RGB-D pair. An image that yields zero
    /// keypoints still produces a frame; the tracker treats it as a
    /// tracking failure for that frame.
    pub fn build(&self, color: &Mat, depth: &Mat, timestamp: f64) -> Result<Frame> {
        let gray = self.to_gray(color)?;
        let depth = self.scale_depth(depth)?;

        let (keypoints, descriptors) = self.extractor.extract(&gray)?;
        if keypoints.is_empty() {
            warn!(timestamp, "no keypoints extracted");
        }

        let lines = match &self.line_extractor {
            Some(extractor) => extractor.extract(&gray)?,
            None => Vec::new(),
        };
        let planes = match &self.plane_segmenter {
            Some(segmenter) => segmenter.segment(&depth, &self.camera)?,
            None => Vec::new(),
        };

        Ok(Frame::new(
            timestamp,
            FrameFeatures {
                keypoints,
                descriptors,
                lines,
                planes,
            },
            &depth,
            self.camera,
            Arc::clone(&self.pyramid),
            self.th_depth,
        ))
    }

    fn to_gray(&self, color: &Mat) -> Result<GrayImage> {
        let gray = match color.typ() {
            CV_8UC1 => color.try_clone().context("cloning grayscale image")?,
            CV_8UC3 => {
                let code = if self.rgb_order {
                    imgproc::COLOR_RGB2GRAY
                } else {
                    imgproc::COLOR_BGR2GRAY
                };
                let mut gray = Mat::default();
                imgproc::cvt_color_def(color, &mut gray, code).context("color conversion")?;
                gray
            }
            CV_8UC4 => {
                let code = if self.rgb_order {
                    imgproc::COLOR_RGBA2GRAY
                } else {
                    imgproc::COLOR_BGRA2GRAY
                };
                let mut gray = Mat::default();
                imgproc::cvt_color_def(color, &mut gray, code).context("color conversion")?;
                gray
            }
            other => bail!("unsupported color image type {}", other),
        };

        let gray = if gray.is_continuous() {
            gray
        } else {
            gray.try_clone().context("making gray image continuous")?
        };
        let data = gray
            .data_bytes()
            .context("accessing gray image data")?
            .to_vec();
        Ok(GrayImage::new(data, gray.cols() as u32, gray.rows() as u32))
    }

    fn scale_depth(&self, depth: &Mat) -> Result<DepthImage> {
        let mut scaled = Mat::default();
        depth
            .convert_to(&mut scaled, CV_32F, self.depth_scale, 0.0)
            .context("scaling depth image")?;
        let scaled = if scaled.is_continuous() {
            scaled
        } else {
            scaled.try_clone().context("making depth image continuous")?
        };
        let data = scaled
            .data_typed::<f32>()
            .context("accessing depth data")?
            .to_vec();
        Ok(DepthImage::new(
            data,
            scaled.cols() as u32,
            scaled.rows() as u32,
        ))
    }
}

/// ORB keypoint extractor backed by OpenCV's pyramid implementation.
pub struct OrbExtractor {
    orb: Mutex<Ptr<ORB>>,
    pyramid: ScalePyramid,
}

impl OrbExtractor {
    pub fn new(
        n_features: i32,
        scale_factor: f64,
        n_levels: usize,
        ini_th_fast: i32,
    ) -> Result<Self> {
        let orb = ORB::create(
            n_features,
            scale_factor as f32,
            n_levels as i32,
            31,
            0,
            2,
            ORB_ScoreType::HARRIS_SCORE,
            31,
            ini_th_fast,
        )
        .context("creating ORB extractor")?;
        Ok(Self {
            orb: Mutex::new(orb),
            pyramid: ScalePyramid::new(n_levels, scale_factor),
        })
    }
}

// The OpenCV smart pointer is an opaque handle; the extractor is only ever
// used behind the mutex.
unsafe impl Send for OrbExtractor {}

impl FeatureExtractor for OrbExtractor {
    fn pyramid(&self) -> &ScalePyramid {
        &self.pyramid
    }

    fn extract(&self, image: &GrayImage) -> Result<(Vec<KeyPoint>, Vec<Descriptor>)> {
        let mat = Mat::from_slice(&image.data)
            .context("wrapping gray image")?
            .reshape(1, image.height as i32)
            .context("reshaping gray image")?
            .try_clone()
            .context("cloning gray image")?;

        let mut cv_keypoints = Vector::<opencv::core::KeyPoint>::new();
        let mut cv_descriptors = Mat::default();
        self.orb
            .lock()
            .detect_and_compute(
                &mat,
                &no_array(),
                &mut cv_keypoints,
                &mut cv_descriptors,
                false,
            )
            .context("ORB detection")?;

        let mut keypoints = Vec::with_capacity(cv_keypoints.len());
        let mut descriptors = Vec::with_capacity(cv_keypoints.len());
        for (i, kp) in cv_keypoints.iter().enumerate() {
            let row = cv_descriptors
                .at_row::<u8>(i as i32)
                .context("reading descriptor row")?;
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(&row[..32]);
            keypoints.push(KeyPoint {
                x: kp.pt().x,
                y: kp.pt().y,
                octave: kp.octave(),
                angle: kp.angle(),
            });
            descriptors.push(Descriptor::from_bytes(&bytes));
        }
        Ok((keypoints, descriptors))
    }
}
