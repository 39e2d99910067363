use std::io;

use thiserror::Error;

use crate::types::Level;

/// Structural failures that abort one level of a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{level} level needs a {column} column; none of these headers matched: {}", .expected.join(", "))]
    MissingIdentifierColumn {
        level: Level,
        column: &'static str,
        expected: Vec<&'static str>,
    },
    #[error("input table has no rows")]
    EmptyInput,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("failed to serialize feature collection: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures from a single boundary source. Never fatal to a run.
#[derive(Debug, Error)]
pub enum BoundaryError {
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },
    #[error("archive error: {0}")]
    Archive(String),
    #[error("shapefile error: {0}")]
    Shapefile(String),
    #[error("geojson error: {0}")]
    GeoJson(String),
    #[error("source '{source_name}' does not serve the {level} level")]
    Unsupported { source_name: String, level: Level },
    #[error(transparent)]
    Io(#[from] io::Error),
}
