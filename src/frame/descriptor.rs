//! 256-bit binary feature descriptors.
//!
//! ORB and LBD descriptors are both 256-bit binary strings compared under
//! Hamming distance. They are stored as eight 32-bit words so the distance
//! can use the parallel bit-count from the Stanford bit-twiddling hacks, the
//! same kernel classical SLAM systems use.

/// Number of 32-bit words in a descriptor.
pub const DESCRIPTOR_WORDS: usize = 8;

/// A 256-bit binary descriptor (ORB for keypoints, LBD for line segments).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Descriptor(pub [u32; DESCRIPTOR_WORDS]);

impl Descriptor {
    /// Total number of bits.
    pub const BITS: u32 = 256;

    /// Build from the 32-byte row layout produced by feature extractors.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let mut words = [0u32; DESCRIPTOR_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u32::from_le_bytes([
                bytes[4 * i],
                bytes[4 * i + 1],
                bytes[4 * i + 2],
                bytes[4 * i + 3],
            ]);
        }
        Self(words)
    }

    /// Hamming distance to another descriptor, in [0, 256].
    ///
    /// Popcount of the 32-byte XOR using the SWAR parallel bit count.
    pub fn distance(&self, other: &Descriptor) -> u32 {
        let mut dist = 0u32;
        for i in 0..DESCRIPTOR_WORDS {
            let mut v = self.0[i] ^ other.0[i];
            v = v - ((v >> 1) & 0x5555_5555);
            v = (v & 0x3333_3333) + ((v >> 2) & 0x3333_3333);
            dist += (((v + (v >> 4)) & 0x0F0F_0F0F).wrapping_mul(0x0101_0101)) >> 24;
        }
        dist
    }

    /// Pick the most representative descriptor out of a set: the one whose
    /// median distance to all the others is smallest.
    ///
    /// Used to refresh a landmark's descriptor after its observation set
    /// changes. Returns `None` for an empty set.
    pub fn most_distinctive(descriptors: &[Descriptor]) -> Option<Descriptor> {
        if descriptors.is_empty() {
            return None;
        }
        if descriptors.len() == 1 {
            return Some(descriptors[0]);
        }

        let n = descriptors.len();
        let mut best_median = u32::MAX;
        let mut best_idx = 0;
        for i in 0..n {
            let mut dists: Vec<u32> = (0..n)
                .map(|j| descriptors[i].distance(&descriptors[j]))
                .collect();
            dists.sort_unstable();
            let median = dists[(n - 1) / 2];
            if median < best_median {
                best_median = median;
                best_idx = i;
            }
        }
        Some(descriptors[best_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_zero_on_self() {
        let d = Descriptor([0xDEADBEEF, 0x12345678, 0, u32::MAX, 7, 42, 0xF0F0F0F0, 1]);
        assert_eq!(d.distance(&d), 0);
    }

    #[test]
    fn test_distance_symmetric() {
        let a = Descriptor([0xFF00FF00, 0, 1, 2, 3, 4, 5, 6]);
        let b = Descriptor([0x00FF00FF, 9, 8, 7, 6, 5, 4, 3]);
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn test_distance_range() {
        let zeros = Descriptor([0; DESCRIPTOR_WORDS]);
        let ones = Descriptor([u32::MAX; DESCRIPTOR_WORDS]);
        assert_eq!(zeros.distance(&ones), Descriptor::BITS);

        let one_bit = Descriptor([1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(zeros.distance(&one_bit), 1);
    }

    #[test]
    fn test_from_bytes_roundtrip_distance() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0b1010_1010;
        bytes[31] = 0b0000_1111;
        let d = Descriptor::from_bytes(&bytes);
        let zeros = Descriptor::default();
        assert_eq!(d.distance(&zeros), 8);
    }

    #[test]
    fn test_most_distinctive_prefers_central_descriptor() {
        let center = Descriptor([0b1111, 0, 0, 0, 0, 0, 0, 0]);
        let near_a = Descriptor([0b0111, 0, 0, 0, 0, 0, 0, 0]);
        let near_b = Descriptor([0b1110, 0, 0, 0, 0, 0, 0, 0]);
        let far = Descriptor([u32::MAX, u32::MAX, 0, 0, 0, 0, 0, 0]);

        let picked = Descriptor::most_distinctive(&[near_a, center, near_b, far]).unwrap();
        assert_eq!(picked, center);

        assert!(Descriptor::most_distinctive(&[]).is_none());
    }
}
