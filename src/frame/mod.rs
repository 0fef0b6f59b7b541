//! Frame-level processing: camera model, feature primitives, grid index and
//! the per-image `Frame` record.

pub mod builder;
pub mod camera;
pub mod descriptor;
pub mod features;
#[allow(clippy::module_inception)]
pub mod frame;
pub mod grid;
pub mod image;

pub use camera::CameraModel;
pub use descriptor::Descriptor;
pub use features::{
    FeatureExtractor, FrameFeatures, KeyPoint, LineExtractor, LineSegment, PlaneObservation,
    PlaneSegmenter, ScalePyramid,
};
pub use frame::Frame;
pub use grid::FeatureGrid;
pub use image::{DepthImage, GrayImage};
