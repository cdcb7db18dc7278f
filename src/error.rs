use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced at the crate's typed seams: input validation, dataset
/// layout and checkpoint compatibility.
#[derive(Debug, Error)]
pub enum ColorizeError {
    #[error("input too small: {height}x{width} (spatial dims must be non-zero)")]
    InputTooSmall { height: usize, width: usize },

    #[error("expected {expected} input channel(s), found {found}")]
    ChannelMismatch { expected: usize, found: usize },

    #[error("directory not found: {0}")]
    MissingDirectory(PathBuf),

    #[error("no .png/.jpg images in {0}")]
    EmptyDirectory(PathBuf),

    #[error("missing {kind} for {stem}: expected {path}")]
    MissingPair {
        kind: &'static str,
        stem: String,
        path: PathBuf,
    },

    #[error("label {label} in {path} is out of range for {num_classes} classes")]
    LabelOutOfRange {
        path: PathBuf,
        label: u64,
        num_classes: usize,
    },

    #[error("invalid label file {path}: {reason}")]
    InvalidLabel { path: PathBuf, reason: String },

    #[error("checkpoint not found: {0}")]
    CheckpointMissing(PathBuf),

    #[error("checkpoint {path} does not match the model architecture: {reason}")]
    IncompatibleCheckpoint { path: PathBuf, reason: String },

    #[error("invalid {name} {value}: {reason}")]
    InvalidEnhancement {
        name: &'static str,
        value: f32,
        reason: &'static str,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}
