//! Stable integer ids for map entities.
//!
//! Landmarks and keyframes reference each other by id instead of owning
//! pointers, which breaks the observation cycles of the classical design.
//! The arena in [`crate::map::Map`] owns every entity.

/// Unique identifier for a KeyFrame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyFrameId(pub u64);

/// Unique identifier for a MapPoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapPointId(pub u64);

/// Unique identifier for a MapLine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapLineId(pub u64);

/// Unique identifier for a MapPlane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapPlaneId(pub u64);

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}

impl std::fmt::Display for MapLineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ML{}", self.0)
    }
}

impl std::fmt::Display for MapPlaneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PL{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_ids_as_map_keys() {
        let mut m: HashMap<MapPointId, &str> = HashMap::new();
        m.insert(MapPointId(3), "a");
        assert_eq!(m.get(&MapPointId(3)), Some(&"a"));
        assert_eq!(m.get(&MapPointId(4)), None);
        assert_eq!(format!("{}", KeyFrameId(7)), "KF7");
    }
}
