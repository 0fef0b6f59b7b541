//! Tracking thread: per-frame pose estimation against the shared map.
//!
//! - Frame ingestion and the tracking-strategy cascade (motion model,
//!   reference keyframe) live in [`tracker`].
//! - The covisibility-based working set and frustum tests live in
//!   [`local_map`].
//! - Dominant orthogonal structure detection lives in [`manhattan`].
//! - The full-trajectory recovery log lives in [`trajectory`].

pub mod local_map;
pub mod manhattan;
pub mod state;
pub mod tracker;
pub mod trajectory;

pub use state::TrackingState;
pub use tracker::{Tracker, TrackerConfig};
