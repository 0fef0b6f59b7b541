//! Geometry utilities: SE3 transforms and small Lie-group helpers.

pub mod se3;

pub use se3::SE3;

use nalgebra::{Matrix3, Vector3};

/// Constructs the skew-symmetric matrix `[v]x` such that `[v]x u = v x u`.
///
/// ```text
/// [v]x = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
#[rustfmt::skip]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skew_is_cross_product() {
        let v = Vector3::new(1.0, -2.0, 0.5);
        let u = Vector3::new(0.3, 0.7, -1.1);
        assert!((skew(&v) * u - v.cross(&u)).norm() < 1e-14);
    }
}
