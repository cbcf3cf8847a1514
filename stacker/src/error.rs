//! Error kinds for loading and running the pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading a single FITS frame.
///
/// A `MissingKeyword` frame is rejected with a warning and processing
/// continues; the group-structure checks in [`RunError`] decide whether the
/// run can still proceed.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to read {path:?}: {source}")]
    Fits {
        path: PathBuf,
        source: fitsio::errors::Error,
    },
    #[error("{path:?} is missing required keyword {keyword}")]
    MissingKeyword { path: PathBuf, keyword: String },
    #[error("{path:?} is not a 2-dimensional image")]
    NotAnImage { path: PathBuf },
}

/// Errors that abort a run before Phase 1.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("expected exactly 3 image groups, found {0}")]
    GroupCount(usize),
    #[error("image group {0} has no usable frames")]
    EmptyGroup(usize),
    #[error("frames disagree on image dimensions ({0} vs {1})")]
    MixedDimensions(shared::ImageSize, shared::ImageSize),
}
