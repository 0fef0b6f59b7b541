//! Dominant orthogonal frame detection from plane normals.
//!
//! Indoor scenes often expose three mutually orthogonal dominant directions
//! (floor plus two walls). When the current frame observes three planes with
//! pairwise near-orthogonal normals, their directions are orthogonalized
//! into a proper rotation that serves as a soft rotation prior for the pose
//! optimizer. The prior never replaces the optimizer's solution.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use tracing::debug;

use crate::frame::Frame;

/// Detects a Manhattan frame among the current frame's plane normals.
#[derive(Debug, Clone)]
pub struct ManhattanDetector {
    /// Two normals count as orthogonal when `|cos(angle)|` is below this.
    orthogonality_cos: f64,
}

impl ManhattanDetector {
    /// `max_deviation_deg` is how far from 90 degrees a pair of normals may
    /// be while still counting as orthogonal (e.g. 5 degrees).
    pub fn new(max_deviation_deg: f64) -> Self {
        Self {
            orthogonality_cos: (90.0 - max_deviation_deg).to_radians().cos(),
        }
    }

    /// Find three pairwise near-orthogonal plane normals in the camera frame
    /// and return the rotation `R_cm` mapping Manhattan axes to the camera.
    ///
    /// Two observed planes are enough: the third axis is completed by the
    /// cross product.
    pub fn detect(&self, frame: &Frame) -> Option<UnitQuaternion<f64>> {
        let normals: Vec<Vector3<f64>> = frame.planes.iter().map(|p| p.normal()).collect();
        if normals.len() < 2 {
            return None;
        }

        // Search for an orthogonal pair, then try to extend it to a triple.
        for i in 0..normals.len() {
            for j in (i + 1)..normals.len() {
                if !self.orthogonal(&normals[i], &normals[j]) {
                    continue;
                }
                let third = normals
                    .iter()
                    .enumerate()
                    .filter(|(k, _)| *k != i && *k != j)
                    .find(|(_, n)| self.orthogonal(n, &normals[i]) && self.orthogonal(n, &normals[j]))
                    .map(|(_, n)| *n)
                    .unwrap_or_else(|| normals[i].cross(&normals[j]).normalize());

                let rotation = orthogonalize(&normals[i], &normals[j], &third);
                debug!("manhattan frame detected");
                return Some(rotation);
            }
        }
        None
    }

    fn orthogonal(&self, a: &Vector3<f64>, b: &Vector3<f64>) -> bool {
        a.dot(b).abs() < self.orthogonality_cos
    }
}

/// Resolve the axis-labelling ambiguity of a detected Manhattan frame.
///
/// Plane normals carry no canonical order or sign, so two detections of the
/// same structure can differ by a signed axis permutation. This picks the
/// proper signed permutation of `candidate`'s columns closest to
/// `expected`.
pub fn align_manhattan_axes(
    expected: &UnitQuaternion<f64>,
    candidate: &UnitQuaternion<f64>,
) -> UnitQuaternion<f64> {
    let e = expected.to_rotation_matrix().into_inner();
    let c = candidate.to_rotation_matrix().into_inner();

    let permutations: [[usize; 3]; 6] = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];

    let mut best_score = f64::NEG_INFINITY;
    let mut best = c;
    for perm in permutations {
        for signs in 0..8u8 {
            let mut m = Matrix3::zeros();
            for (dst, &src) in perm.iter().enumerate() {
                let sign = if signs & (1 << dst) != 0 { -1.0 } else { 1.0 };
                m.set_column(dst, &(sign * c.column(src)));
            }
            if m.determinant() < 0.0 {
                continue;
            }
            let score = (m.transpose() * e).trace();
            if score > best_score {
                best_score = score;
                best = m;
            }
        }
    }
    UnitQuaternion::from_rotation_matrix(&nalgebra::Rotation3::from_matrix_unchecked(best))
}

/// Project three roughly orthogonal directions onto the closest proper
/// rotation via SVD: `R = U V^T`, with a sign flip if the determinant comes
/// out negative.
fn orthogonalize(a: &Vector3<f64>, b: &Vector3<f64>, c: &Vector3<f64>) -> UnitQuaternion<f64> {
    let m = Matrix3::from_columns(&[*a, *b, *c]);
    let svd = m.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return UnitQuaternion::identity();
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u = u;
        u.column_mut(2).neg_mut();
        r = u * v_t;
    }
    UnitQuaternion::from_rotation_matrix(&nalgebra::Rotation3::from_matrix_unchecked(r))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::features::PlaneObservation;
    use crate::frame::{CameraModel, DepthImage, FrameFeatures, ScalePyramid};
    use nalgebra::Vector4;
    use std::sync::Arc;

    fn frame_with_planes(normals: &[Vector3<f64>]) -> Frame {
        let camera = CameraModel::new(500.0, 500.0, 320.0, 240.0, [0.0; 5], 40.0, 640, 480);
        let depth = DepthImage::new(vec![2.0; 640 * 480], 640, 480);
        let features = FrameFeatures {
            planes: normals
                .iter()
                .map(|n| PlaneObservation {
                    coeffs: Vector4::new(n.x, n.y, n.z, -1.0),
                    inliers: vec![],
                })
                .collect(),
            ..Default::default()
        };
        Frame::new(
            0.0,
            features,
            &depth,
            camera,
            Arc::new(ScalePyramid::new(8, 1.2)),
            3.0,
        )
    }

    #[test]
    fn test_detects_three_orthogonal_planes() {
        let frame = frame_with_planes(&[
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
        ]);
        let detector = ManhattanDetector::new(5.0);
        let r = detector.detect(&frame).expect("should detect");
        let m = r.to_rotation_matrix().into_inner();
        assert!((m.transpose() * m - Matrix3::identity()).norm() < 1e-9);
        assert!((m.determinant() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_two_planes_complete_the_third_axis() {
        let frame = frame_with_planes(&[
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
        ]);
        let detector = ManhattanDetector::new(5.0);
        assert!(detector.detect(&frame).is_some());
    }

    #[test]
    fn test_rejects_parallel_planes() {
        let frame = frame_with_planes(&[
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.0, 0.02, 1.0).normalize(),
        ]);
        let detector = ManhattanDetector::new(5.0);
        assert!(detector.detect(&frame).is_none());
    }

    #[test]
    fn test_axis_alignment_fixes_permuted_detection() {
        let expected = UnitQuaternion::from_scaled_axis(Vector3::new(0.05, -0.02, 0.1));
        // Same frame, but detected with axes swapped and one sign flipped.
        let e = expected.to_rotation_matrix().into_inner();
        let mut permuted = Matrix3::zeros();
        permuted.set_column(0, &(-e.column(1)));
        permuted.set_column(1, &e.column(0));
        permuted.set_column(2, &e.column(2));
        let candidate = UnitQuaternion::from_rotation_matrix(
            &nalgebra::Rotation3::from_matrix_unchecked(permuted),
        );

        let aligned = align_manhattan_axes(&expected, &candidate);
        assert!(aligned.angle_to(&expected) < 1e-9);
    }

    #[test]
    fn test_orthogonalizes_noisy_normals() {
        // Slightly skewed wall/floor normals still produce a proper rotation
        // close to the ideal axes.
        let frame = frame_with_planes(&[
            Vector3::new(1.0, 0.02, -0.01).normalize(),
            Vector3::new(0.015, 1.0, 0.02).normalize(),
            Vector3::new(-0.01, 0.01, 1.0).normalize(),
        ]);
        let detector = ManhattanDetector::new(5.0);
        let r = detector.detect(&frame).expect("should detect");
        let m = r.to_rotation_matrix().into_inner();
        assert!((m.determinant() - 1.0).abs() < 1e-9);
        // Columns should be within ~2 degrees of the input normals.
        assert!(m.column(0).dot(&Vector3::new(1.0, 0.0, 0.0)) > 0.99);
    }
}
