//! Error taxonomy shared by every stage.

use std::path::PathBuf;

use nifti::error::NiftiError;
use thiserror::Error;

/// Errors raised while loading, composing or applying transforms.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An input file does not exist.
    #[error("input not found: {}", path.display())]
    InputNotFound {
        /// The missing path.
        path: PathBuf,
    },

    /// Two arrays disagree on an axis where no truncation is tolerated.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A transform chain was requested with nothing in it.
    #[error("no transform provided: at least one affine or warp is required")]
    NoTransformProvided,

    /// The b-value scan found no volume at or below the threshold.
    #[error("no reference volume with b-value <= {threshold} found; pass an explicit index or raise the threshold")]
    NoReferenceFound {
        /// The threshold that was applied.
        threshold: f64,
    },

    /// The volume and gradient table cannot be reconciled without an explicit index.
    #[error("ambiguous reference: {0}")]
    AmbiguousReference(String),

    /// An ensemble member could not be loaded or run.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// The delegated registration solver failed.
    #[error("registration failed: {0}")]
    RegistrationFailure(String),

    /// Applying a transform or displacement failed.
    #[error("resampling failed: {0}")]
    ResamplingFailure(String),

    /// A requested shell index does not exist.
    #[error("index {index} out of range for {len} volumes")]
    IndexOutOfRange {
        /// The requested index, possibly negative.
        index: i64,
        /// The number of volumes available.
        len: usize,
    },

    /// A text file (bval, bvec, affine) could not be parsed.
    #[error("could not parse {}: {message}", path.display())]
    Parse {
        /// The offending file.
        path: PathBuf,
        /// What was wrong with it.
        message: String,
    },

    /// A caller-supplied parameter is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation was cancelled before all work was scheduled.
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Nifti(#[from] NiftiError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Field-less discriminant of [`Error`], convenient for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InputNotFound,
    ShapeMismatch,
    NoTransformProvided,
    NoReferenceFound,
    AmbiguousReference,
    ModelUnavailable,
    RegistrationFailure,
    ResamplingFailure,
    IndexOutOfRange,
    Parse,
    InvalidArgument,
    Cancelled,
    Nifti,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InputNotFound { .. } => ErrorKind::InputNotFound,
            Error::ShapeMismatch(_) => ErrorKind::ShapeMismatch,
            Error::NoTransformProvided => ErrorKind::NoTransformProvided,
            Error::NoReferenceFound { .. } => ErrorKind::NoReferenceFound,
            Error::AmbiguousReference(_) => ErrorKind::AmbiguousReference,
            Error::ModelUnavailable(_) => ErrorKind::ModelUnavailable,
            Error::RegistrationFailure(_) => ErrorKind::RegistrationFailure,
            Error::ResamplingFailure(_) => ErrorKind::ResamplingFailure,
            Error::IndexOutOfRange { .. } => ErrorKind::IndexOutOfRange,
            Error::Parse { .. } => ErrorKind::Parse,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Nifti(_) => ErrorKind::Nifti,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::Parse {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Fails with [`Error::InputNotFound`] unless `path` exists.
pub fn ensure_exists(path: &std::path::Path) -> Result<(), Error> {
    if path.exists() {
        Ok(())
    } else {
        Err(Error::InputNotFound {
            path: path.to_path_buf(),
        })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
