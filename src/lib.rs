pub mod aggregate;
pub mod boundary;
pub mod config;
pub mod data;
pub mod dissolve;
pub mod errors;
pub mod export;
pub mod normalize;
pub mod pipeline;
pub mod reproject;
pub mod server;
pub mod types;

pub use errors::{BoundaryError, PipelineError};
pub use types::{AggregatedGroup, Level, LevelReport};
