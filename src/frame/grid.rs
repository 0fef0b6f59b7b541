//! Spatial grid index over a frame's keypoints.
//!
//! The image is divided into a fixed 64x48 cell grid; each cell stores the
//! indices of the keypoints falling inside it. Radius queries then only touch
//! the cells overlapping the search window instead of every keypoint.

use crate::frame::camera::CameraModel;
use crate::frame::features::KeyPoint;

pub const GRID_COLS: usize = 64;
pub const GRID_ROWS: usize = 48;

#[derive(Debug, Clone)]
pub struct FeatureGrid {
    cells: Vec<Vec<usize>>,
    min_x: f64,
    min_y: f64,
    /// Cells per pixel.
    inv_cell_width: f64,
    inv_cell_height: f64,
}

impl FeatureGrid {
    /// Index undistorted keypoints into the grid. Keypoints outside the valid
    /// image bounds (possible after undistortion) are simply not indexed.
    pub fn new(camera: &CameraModel, keypoints: &[KeyPoint]) -> Self {
        let min_x = camera.min_x;
        let min_y = camera.min_y;
        let inv_cell_width = GRID_COLS as f64 / (camera.max_x - camera.min_x);
        let inv_cell_height = GRID_ROWS as f64 / (camera.max_y - camera.min_y);

        let mut cells = vec![Vec::new(); GRID_COLS * GRID_ROWS];
        for (idx, kp) in keypoints.iter().enumerate() {
            let cx = ((kp.x as f64 - min_x) * inv_cell_width).floor() as i64;
            let cy = ((kp.y as f64 - min_y) * inv_cell_height).floor() as i64;
            if cx < 0 || cy < 0 || cx >= GRID_COLS as i64 || cy >= GRID_ROWS as i64 {
                continue;
            }
            cells[cy as usize * GRID_COLS + cx as usize].push(idx);
        }

        Self {
            cells,
            min_x,
            min_y,
            inv_cell_width,
            inv_cell_height,
        }
    }

    /// Indices of keypoints within a square window of half-size `r` around
    /// `(u, v)`, optionally restricted to a pyramid level range.
    ///
    /// Both level bounds are inclusive; a negative bound means unbounded on
    /// that side.
    pub fn features_in_area(
        &self,
        keypoints: &[KeyPoint],
        u: f64,
        v: f64,
        r: f64,
        min_level: i32,
        max_level: i32,
    ) -> Vec<usize> {
        let mut indices = Vec::new();
        if r <= 0.0 {
            return indices;
        }

        let min_cell_x = (((u - self.min_x - r) * self.inv_cell_width).floor() as i64)
            .max(0) as usize;
        let max_cell_x = (((u - self.min_x + r) * self.inv_cell_width).floor() as i64)
            .min(GRID_COLS as i64 - 1);
        let min_cell_y = (((v - self.min_y - r) * self.inv_cell_height).floor() as i64)
            .max(0) as usize;
        let max_cell_y = (((v - self.min_y + r) * self.inv_cell_height).floor() as i64)
            .min(GRID_ROWS as i64 - 1);
        if max_cell_x < min_cell_x as i64 || max_cell_y < min_cell_y as i64 {
            return indices;
        }

        let check_levels = min_level >= 0 || max_level >= 0;

        for cy in min_cell_y..=max_cell_y as usize {
            for cx in min_cell_x..=max_cell_x as usize {
                for &idx in &self.cells[cy * GRID_COLS + cx] {
                    let kp = &keypoints[idx];
                    if check_levels {
                        if min_level >= 0 && kp.octave < min_level {
                            continue;
                        }
                        if max_level >= 0 && kp.octave > max_level {
                            continue;
                        }
                    }
                    let dx = kp.x as f64 - u;
                    let dy = kp.y as f64 - v;
                    if dx.abs() < r && dy.abs() < r {
                        indices.push(idx);
                    }
                }
            }
        }

        indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> CameraModel {
        CameraModel::new(500.0, 500.0, 320.0, 240.0, [0.0; 5], 40.0, 640, 480)
    }

    fn kp(x: f32, y: f32, octave: i32) -> KeyPoint {
        KeyPoint {
            x,
            y,
            octave,
            angle: 0.0,
        }
    }

    #[test]
    fn test_query_contains_own_keypoint() {
        let cam = camera();
        let kps = vec![kp(10.5, 20.5, 0), kp(600.0, 400.0, 2), kp(320.0, 240.0, 5)];
        let grid = FeatureGrid::new(&cam, &kps);

        for (i, k) in kps.iter().enumerate() {
            for eps in [0.5, 2.0, 30.0] {
                let found = grid.features_in_area(&kps, k.x as f64, k.y as f64, eps, -1, -1);
                assert!(found.contains(&i), "kp {} missing for eps {}", i, eps);
            }
        }
    }

    #[test]
    fn test_level_bounds_are_inclusive() {
        let cam = camera();
        let kps = vec![kp(100.0, 100.0, 1), kp(101.0, 100.0, 2), kp(102.0, 100.0, 3)];
        let grid = FeatureGrid::new(&cam, &kps);

        let found = grid.features_in_area(&kps, 101.0, 100.0, 10.0, 2, 2);
        assert_eq!(found, vec![1]);

        let found = grid.features_in_area(&kps, 101.0, 100.0, 10.0, 1, 3);
        assert_eq!(found.len(), 3);

        // Negative bound disables the check on that side.
        let found = grid.features_in_area(&kps, 101.0, 100.0, 10.0, -1, 2);
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_window_is_square_not_circular() {
        let cam = camera();
        // Corner of a square window: inside the box but outside the circle.
        let kps = vec![kp(109.0, 109.0, 0)];
        let grid = FeatureGrid::new(&cam, &kps);
        let found = grid.features_in_area(&kps, 100.0, 100.0, 10.0, -1, -1);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_far_away_query_is_empty() {
        let cam = camera();
        let kps = vec![kp(10.0, 10.0, 0)];
        let grid = FeatureGrid::new(&cam, &kps);
        assert!(grid
            .features_in_area(&kps, 500.0, 400.0, 5.0, -1, -1)
            .is_empty());
    }
}
