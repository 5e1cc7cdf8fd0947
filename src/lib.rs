//! Spatial transform and distortion correction tools for diffusion MRI.
//!
//! The command line tools under `src/bin` are thin wrappers around the
//! components exported here.

pub mod affine_file;
pub mod cli;
pub mod common;
pub mod correction;
pub mod displacement;
pub mod engine;
pub mod ensemble;
pub mod error;
pub mod gradient;
pub mod interpolate;
pub mod logging;
pub mod series;
pub mod split;
pub mod transform;
pub mod volume;

pub use error::{Error, ErrorKind, Result};
