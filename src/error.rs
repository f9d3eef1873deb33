use std::path::PathBuf;
use thiserror::Error;

use crate::merge::MergeError;

/// The main error type for tilefuse operations.
///
/// Per-tile detector failures are not in here: they are recoverable and
/// travel as [`DetectorError`](crate::detect::DetectorError) inside a
/// [`ProcessOutcome`](crate::pipeline::ProcessOutcome). Everything below is
/// fatal for the image (or the command) it was raised for.
#[derive(Debug, Error)]
pub enum TilefuseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration for '{field}': {message}")]
    InvalidConfig { field: String, message: String },

    #[error("Failed to parse config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Failed to parse class names from {path}: {source}")]
    ClassNamesParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Image not found: {image_id}")]
    ImageNotFound { image_id: String },

    #[error("Failed to decode image {image_id}: {source}")]
    ImageDecode {
        image_id: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Merge failed after {succeeded_tiles} tile(s) succeeded: {source}")]
    MergeFailed {
        succeeded_tiles: usize,
        #[source]
        source: MergeError,
    },

    #[error("Merge failed: {0}")]
    Merge(#[from] MergeError),

    #[error("Detection failed for {image_id}: all {failed_tiles} of {total_tiles} tile(s) failed")]
    DetectionFailed {
        image_id: String,
        failed_tiles: usize,
        total_tiles: usize,
    },

    #[error("Cancelled after {completed_tiles} of {total_tiles} tile(s) completed")]
    Cancelled {
        completed_tiles: usize,
        total_tiles: usize,
    },

    #[error("Failed to parse detections JSON from {path}: {source}")]
    DetectionsJsonParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write JSON to {path}: {source}")]
    JsonWrite {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

impl TilefuseError {
    /// Shorthand for [`TilefuseError::InvalidConfig`].
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        TilefuseError::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }
}
