// Core types and functionality for the Strata pipeline engine

pub mod config;
pub mod dataset;
pub mod error;
pub mod events;
pub mod hashing;
pub mod params;
pub mod registry;
pub mod steps;
pub mod storage;
pub mod types;
pub mod workflow;

pub use config::Settings;
pub use dataset::{DatasetHandle, DatasetStore};
pub use error::{ItemFailure, PipelineError, PipelineResult};
pub use params::ParameterDocument;
pub use registry::{RunHandle, RunRegistry};
pub use types::*;
