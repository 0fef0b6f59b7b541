//! TUM RGB-D dataset reader.
//!
//! Reads the association file produced by the benchmark's `associate.py`
//! (lines of `rgb_ts rgb_path depth_ts depth_path`) and loads the paired
//! images on demand. Depth images stay in raw sensor units here; the frame
//! builder applies `DepthMapFactor`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use csv::ReaderBuilder;
use opencv::core::Mat;
use opencv::imgcodecs::{self, IMREAD_UNCHANGED};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct AssociationRecord {
    rgb_timestamp: f64,
    rgb_path: String,
    #[allow(dead_code)]
    depth_timestamp: f64,
    depth_path: String,
}

#[derive(Debug, Clone)]
pub struct TumFrameEntry {
    pub timestamp: f64,
    pub rgb_path: String,
    pub depth_path: String,
}

#[derive(Debug)]
pub struct TumDataset {
    root: PathBuf,
    entries: Vec<TumFrameEntry>,
}

/// A loaded RGB-D pair.
pub struct RgbdPair {
    pub rgb: Mat,
    pub depth: Mat,
    pub timestamp: f64,
}

impl TumDataset {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(root: P, associations: Q) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let assoc_path = root.join(associations.as_ref());
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .delimiter(b' ')
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(&assoc_path)
            .with_context(|| format!("opening associations file {}", assoc_path.display()))?;

        let mut entries = Vec::new();
        for record in reader.deserialize::<AssociationRecord>() {
            let record = record.context("parsing associations line")?;
            entries.push(TumFrameEntry {
                timestamp: record.rgb_timestamp,
                rgb_path: record.rgb_path,
                depth_path: record.depth_path,
            });
        }
        if entries.is_empty() {
            bail!("no frames in associations file {}", assoc_path.display());
        }

        Ok(Self { root, entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TumFrameEntry] {
        &self.entries
    }

    /// Load the RGB and depth images of frame `idx`.
    pub fn frame(&self, idx: usize) -> Result<RgbdPair> {
        let entry = self
            .entries
            .get(idx)
            .with_context(|| format!("no frame at index {}", idx))?;

        let rgb_path = self.root.join(&entry.rgb_path);
        let rgb = imgcodecs::imread(
            rgb_path.to_str().context("non-utf8 rgb path")?,
            IMREAD_UNCHANGED,
        )
        .with_context(|| format!("reading {}", rgb_path.display()))?;
        if rgb.empty() {
            bail!("empty color image {}", rgb_path.display());
        }

        let depth_path = self.root.join(&entry.depth_path);
        let depth = imgcodecs::imread(
            depth_path.to_str().context("non-utf8 depth path")?,
            IMREAD_UNCHANGED,
        )
        .with_context(|| format!("reading {}", depth_path.display()))?;
        if depth.empty() {
            bail!("empty depth image {}", depth_path.display());
        }

        Ok(RgbdPair {
            rgb,
            depth,
            timestamp: entry.timestamp,
        })
    }
}
