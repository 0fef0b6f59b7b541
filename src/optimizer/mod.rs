//! Motion-only optimization of the current frame pose.

pub mod pose_optimizer;

pub use pose_optimizer::{
    optimize_pose, Observation, PoseOptimization, PoseOptimizerConfig,
};
