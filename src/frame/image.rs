//! Owned image buffers handed from the frontend to the extractors.
//!
//! Keeping these crate-local means the extraction traits and everything
//! downstream stay independent of the OpenCV binding types used by the
//! frontend and dataset readers.

/// Row-major 8-bit grayscale image.
#[derive(Debug, Clone)]
pub struct GrayImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl GrayImage {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        debug_assert_eq!(data.len(), (width * height) as usize);
        Self {
            data,
            width,
            height,
        }
    }

    #[inline]
    pub fn at(&self, x: u32, y: u32) -> u8 {
        self.data[(y * self.width + x) as usize]
    }
}

/// Row-major 32-bit float depth image in meters (already scaled by the
/// configured depth map factor). Non-positive values mean "no depth".
#[derive(Debug, Clone)]
pub struct DepthImage {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

impl DepthImage {
    pub fn new(data: Vec<f32>, width: u32, height: u32) -> Self {
        debug_assert_eq!(data.len(), (width * height) as usize);
        Self {
            data,
            width,
            height,
        }
    }

    /// Depth at integer pixel coordinates, `None` outside the image or where
    /// the sensor produced no measurement.
    #[inline]
    pub fn at(&self, x: i64, y: i64) -> Option<f32> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return None;
        }
        let z = self.data[(y as u32 * self.width + x as u32) as usize];
        if z > 0.0 && z.is_finite() {
            Some(z)
        } else {
            None
        }
    }

    /// Depth sampled at (rounded) subpixel coordinates.
    #[inline]
    pub fn sample(&self, u: f32, v: f32) -> Option<f32> {
        self.at(u.round() as i64, v.round() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_lookup_and_invalid_values() {
        let mut data = vec![0.0f32; 16];
        data[5] = 1.5; // (x=1, y=1) in a 4x4 image
        data[6] = f32::NAN;
        let depth = DepthImage::new(data, 4, 4);

        assert_eq!(depth.at(1, 1), Some(1.5));
        assert_eq!(depth.at(2, 1), None); // NaN
        assert_eq!(depth.at(0, 0), None); // zero depth
        assert_eq!(depth.at(-1, 0), None);
        assert_eq!(depth.at(4, 0), None);
        assert_eq!(depth.sample(1.2, 0.8), Some(1.5));
    }
}
