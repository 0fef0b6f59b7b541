//! Settings and dataset IO.

pub mod settings;
pub mod tum;

pub use settings::Settings;
pub use tum::TumDataset;
