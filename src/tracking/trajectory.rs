//! Full-trajectory recovery log.
//!
//! Tracking stores one entry per frame: the pose relative to the reference
//! keyframe at that time, plus the lost flag. The absolute trajectory is
//! recovered at export time by composing each relative pose with the final
//! pose of its reference keyframe, so poses refined later by the mapping
//! collaborator propagate into the exported trajectory.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::geometry::SE3;
use crate::map::{KeyFrameId, Map};

#[derive(Debug, Clone)]
pub struct TrajectoryEntry {
    /// `T_cr`: current camera relative to the reference keyframe's camera.
    pub relative_cw: SE3,
    pub reference: Option<KeyFrameId>,
    pub timestamp: f64,
    pub lost: bool,
}

#[derive(Debug, Default)]
pub struct TrajectoryLog {
    entries: Vec<TrajectoryEntry>,
}

impl TrajectoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TrajectoryEntry) {
        self.entries.push(entry);
    }

    /// Log a frame that produced no pose: duplicate the previous relative
    /// pose with the lost flag raised, as the trajectory must keep one line
    /// per frame.
    pub fn push_lost(&mut self, timestamp: f64) {
        if let Some(last) = self.entries.last().cloned() {
            self.entries.push(TrajectoryEntry {
                timestamp,
                lost: true,
                ..last
            });
        } else {
            self.entries.push(TrajectoryEntry {
                relative_cw: SE3::identity(),
                reference: None,
                timestamp,
                lost: true,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TrajectoryEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Absolute camera-to-world pose of entry `i`, resolved against the
    /// current keyframe poses in the map.
    pub fn absolute_pose_wc(&self, i: usize, map: &Map) -> Option<SE3> {
        let entry = self.entries.get(i)?;
        let reference_cw = match entry.reference {
            Some(kf_id) => map.get_keyframe(kf_id)?.pose_cw.clone(),
            None => SE3::identity(),
        };
        // T_cw = T_cr * T_rw, exported as its inverse T_wc.
        Some(entry.relative_cw.compose(&reference_cw).inverse())
    }

    /// Write the trajectory in TUM format:
    /// `timestamp tx ty tz qx qy qz qw`, one line per frame.
    pub fn save<P: AsRef<Path>>(&self, path: P, map: &Map) -> Result<()> {
        let file = File::create(path.as_ref())
            .with_context(|| format!("creating trajectory file {}", path.as_ref().display()))?;
        let mut writer = BufWriter::new(file);

        for i in 0..self.entries.len() {
            let entry = &self.entries[i];
            let pose_wc = self
                .absolute_pose_wc(i, map)
                .unwrap_or_else(SE3::identity);
            let t = pose_wc.translation;
            let q = pose_wc.rotation.quaternion();
            writeln!(
                writer,
                "{:.6} {:.7} {:.7} {:.7} {:.7} {:.7} {:.7} {:.7}",
                entry.timestamp, t.x, t.y, t.z, q.i, q.j, q.k, q.w
            )
            .context("writing trajectory entry")?;
        }
        info!(
            entries = self.entries.len(),
            path = %path.as_ref().display(),
            "saved trajectory"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn test_push_lost_duplicates_last_entry() {
        let mut log = TrajectoryLog::new();
        log.push(TrajectoryEntry {
            relative_cw: SE3 {
                rotation: nalgebra::UnitQuaternion::identity(),
                translation: Vector3::new(1.0, 0.0, 0.0),
            },
            reference: None,
            timestamp: 0.0,
            lost: false,
        });
        log.push_lost(1.0);

        assert_eq!(log.len(), 2);
        let entries = log.entries();
        assert!(entries[1].lost);
        assert_eq!(entries[1].relative_cw.translation.x, 1.0);
        assert_eq!(entries[1].timestamp, 1.0);
    }

    #[test]
    fn test_absolute_pose_without_reference() {
        let mut log = TrajectoryLog::new();
        let t_cw = SE3 {
            rotation: nalgebra::UnitQuaternion::identity(),
            translation: Vector3::new(0.0, 0.0, -2.0),
        };
        log.push(TrajectoryEntry {
            relative_cw: t_cw.clone(),
            reference: None,
            timestamp: 0.0,
            lost: false,
        });
        let map = Map::new();
        let pose_wc = log.absolute_pose_wc(0, &map).unwrap();
        assert!((pose_wc.translation - Vector3::new(0.0, 0.0, 2.0)).norm() < 1e-12);
    }
}
