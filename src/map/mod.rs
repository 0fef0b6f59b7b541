//! The shared map: keyframes, points, lines and planes.

pub mod keyframe;
#[allow(clippy::module_inception)]
pub mod map;
pub mod map_line;
pub mod map_plane;
pub mod map_point;
pub mod types;

pub use keyframe::KeyFrame;
pub use map::{shared_map, Map, SharedMap};
pub use map_line::MapLine;
pub use map_plane::MapPlane;
pub use map_point::MapPoint;
pub use types::{KeyFrameId, MapLineId, MapPlaneId, MapPointId};
