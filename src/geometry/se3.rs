//! SE(3) rigid transforms.
//!
//! Poses in this crate are stored as `T_cw` (world-to-camera) following the
//! classical visual SLAM convention: `p_cam = T_cw * p_world`. The type itself
//! is convention-free; the field names of the owning structs say which
//! direction a given transform points.

use nalgebra::{Matrix3, Matrix4, UnitQuaternion, Vector3};

/// A rigid transform in SE(3): rotation followed by translation.
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build from a rotation matrix and translation vector.
    ///
    /// The matrix is re-orthonormalized through the quaternion conversion, so
    /// small numerical drift in the input is absorbed here.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_rotation_matrix(
            &nalgebra::Rotation3::from_matrix(&rotation),
        );
        Self {
            rotation,
            translation,
        }
    }

    /// Exponential-map constructor from a twist `[omega, v]`.
    ///
    /// The rotation is `exp([omega]x)`; the translation is taken directly
    /// (first-order coupling is handled by the optimizer's small steps).
    pub fn from_scaled_axis(omega: Vector3<f64>, v: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(omega),
            translation: v,
        }
    }

    /// Rotation part as a 3x3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Inverse transform: if `self` maps a to b, the result maps b to a.
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Composition: `self.compose(&other)` applies `other` first, then `self`.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Apply the transform to a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Rotate a direction vector (no translation).
    pub fn transform_direction(&self, d: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * d
    }

    /// Homogeneous 4x4 matrix form.
    pub fn to_homogeneous(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation_matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}
