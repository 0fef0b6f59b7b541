//! Top-level ingest entry point.
//!
//! Bundles the OpenCV-backed frame builder with the tracker so callers feed
//! raw RGB-D pairs and get poses back. Wiring of the map, vocabulary,
//! keyframe database and mapper handle stays with the caller, which shares
//! those with the mapping collaborator's thread.

use anyhow::Result;
use opencv::core::Mat;

use crate::frame::builder::FrameBuilder;
use crate::geometry::SE3;
use crate::tracking::{Tracker, TrackingState};

pub struct RgbdSlam {
    builder: FrameBuilder,
    tracker: Tracker,
}

impl RgbdSlam {
    pub fn new(builder: FrameBuilder, tracker: Tracker) -> Self {
        Self { builder, tracker }
    }

    /// Ingest one RGB-D pair and return the estimated world-to-camera pose.
    /// Identity is returned while the tracker has no pose (not yet
    /// initialized, or lost).
    pub fn grab_image(&mut self, rgb: &Mat, depth: &Mat, timestamp: f64) -> Result<SE3> {
        let frame = self.builder.build(rgb, depth, timestamp)?;
        Ok(self.tracker.track(frame))
    }

    pub fn state(&self) -> TrackingState {
        self.tracker.state()
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut Tracker {
        &mut self.tracker
    }
}
