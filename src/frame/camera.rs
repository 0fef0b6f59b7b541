//! Pinhole camera model with radial-tangential distortion.

use nalgebra::{Vector2, Vector3};

/// Calibrated RGB-D pinhole camera.
///
/// `bf = fx * baseline` is the virtual stereo baseline term used to derive
/// the virtual right-image coordinate `uR = u - bf / depth` from depth.
#[derive(Debug, Clone, Copy)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Distortion coefficients `[k1, k2, p1, p2, k3]`.
    pub dist: [f64; 5],
    /// `fx * baseline` (pixels * meters).
    pub bf: f64,
    /// Image size in pixels.
    pub width: u32,
    pub height: u32,
    /// Undistorted image bounds, computed from the undistorted corners.
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl CameraModel {
    pub fn new(
        fx: f64,
        fy: f64,
        cx: f64,
        cy: f64,
        dist: [f64; 5],
        bf: f64,
        width: u32,
        height: u32,
    ) -> Self {
        let mut cam = Self {
            fx,
            fy,
            cx,
            cy,
            dist,
            bf,
            width,
            height,
            min_x: 0.0,
            max_x: width as f64,
            min_y: 0.0,
            max_y: height as f64,
        };
        cam.compute_image_bounds();
        cam
    }

    /// Virtual stereo baseline in meters.
    pub fn baseline(&self) -> f64 {
        self.bf / self.fx
    }

    fn has_distortion(&self) -> bool {
        self.dist.iter().any(|&d| d != 0.0)
    }

    /// Undistorting moves the image corners; the valid keypoint region is the
    /// bounding box of the undistorted corners.
    fn compute_image_bounds(&mut self) {
        if !self.has_distortion() {
            return;
        }
        let w = self.width as f64;
        let h = self.height as f64;
        let corners = [
            self.undistort_point(0.0, 0.0),
            self.undistort_point(w, 0.0),
            self.undistort_point(0.0, h),
            self.undistort_point(w, h),
        ];
        self.min_x = corners[0].x.min(corners[2].x);
        self.max_x = corners[1].x.max(corners[3].x);
        self.min_y = corners[0].y.min(corners[1].y);
        self.max_y = corners[2].y.max(corners[3].y);
    }

    /// Apply the distortion model to normalized coordinates.
    fn distort_normalized(&self, x: f64, y: f64) -> (f64, f64) {
        let [k1, k2, p1, p2, k3] = self.dist;
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
        (xd, yd)
    }

    /// Undistort a pixel coordinate by fixed-point iteration of the inverse
    /// distortion model.
    pub fn undistort_point(&self, u: f64, v: f64) -> Vector2<f64> {
        if !self.has_distortion() {
            return Vector2::new(u, v);
        }
        let xd = (u - self.cx) / self.fx;
        let yd = (v - self.cy) / self.fy;
        let mut x = xd;
        let mut y = yd;
        for _ in 0..8 {
            let (dx, dy) = self.distort_normalized(x, y);
            x += xd - dx;
            y += yd - dy;
        }
        Vector2::new(self.fx * x + self.cx, self.fy * y + self.cy)
    }

    /// Project a camera-frame point to undistorted pixel coordinates.
    /// Returns `None` for points at or behind the camera.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= 0.0 {
            return None;
        }
        let inv_z = 1.0 / p_cam.z;
        Some(Vector2::new(
            self.fx * p_cam.x * inv_z + self.cx,
            self.fy * p_cam.y * inv_z + self.cy,
        ))
    }

    /// Back-project an undistorted pixel with known depth to a camera-frame
    /// point.
    pub fn unproject(&self, u: f64, v: f64, z: f64) -> Vector3<f64> {
        Vector3::new((u - self.cx) * z / self.fx, (v - self.cy) * z / self.fy, z)
    }

    /// Whether an undistorted coordinate falls inside the valid image region.
    pub fn is_in_image(&self, u: f64, v: f64) -> bool {
        u >= self.min_x && u < self.max_x && v >= self.min_y && v < self.max_y
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ideal_camera() -> CameraModel {
        CameraModel::new(500.0, 500.0, 320.0, 240.0, [0.0; 5], 500.0 * 0.08, 640, 480)
    }

    #[test]
    fn test_project_unproject_roundtrip() {
        let cam = ideal_camera();
        let p = Vector3::new(0.4, -0.2, 2.5);
        let uv = cam.project(&p).unwrap();
        let q = cam.unproject(uv.x, uv.y, p.z);
        assert!((q - p).norm() < 1e-12);
    }

    #[test]
    fn test_project_rejects_points_behind_camera() {
        let cam = ideal_camera();
        assert!(cam.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
        assert!(cam.project(&Vector3::new(0.0, 0.0, 0.0)).is_none());
    }

    #[test]
    fn test_undistort_identity_without_coefficients() {
        let cam = ideal_camera();
        let p = cam.undistort_point(123.4, 56.7);
        assert!((p.x - 123.4).abs() < 1e-12);
        assert!((p.y - 56.7).abs() < 1e-12);
    }

    #[test]
    fn test_undistort_inverts_distortion() {
        let cam = CameraModel::new(
            500.0,
            500.0,
            320.0,
            240.0,
            [-0.2, 0.05, 0.001, -0.001, 0.0],
            40.0,
            640,
            480,
        );
        // Distort a known normalized point, then undo it.
        let (x, y) = ((100.0 - cam.cx) / cam.fx, (400.0 - cam.cy) / cam.fy);
        let (xd, yd) = cam.distort_normalized(x, y);
        let distorted_u = cam.fx * xd + cam.cx;
        let distorted_v = cam.fy * yd + cam.cy;
        let undone = cam.undistort_point(distorted_u, distorted_v);
        assert!((undone.x - 100.0).abs() < 1e-3);
        assert!((undone.y - 400.0).abs() < 1e-3);
    }

    #[test]
    fn test_bounds_match_image_without_distortion() {
        let cam = ideal_camera();
        assert_eq!(cam.min_x, 0.0);
        assert_eq!(cam.max_x, 640.0);
        assert!(cam.is_in_image(0.0, 0.0));
        assert!(!cam.is_in_image(640.0, 100.0));
    }
}
