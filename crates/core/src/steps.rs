// Concrete steps bundled with the engine

pub mod file_map;
pub mod split;

pub use file_map::{CopyTransform, FileMapStep};
pub use split::SplitDatasetStep;
