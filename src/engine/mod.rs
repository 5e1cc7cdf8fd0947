//! Narrow interface to the registration collaborator.
//!
//! Solving for transforms is always delegated. Engines also own the
//! low-level apply-operator, which consumes its transform list last-applied
//! first; callers should go through [`crate::transform::TransformChain`]
//! rather than build such lists by hand.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::common::Direction;
use crate::error::{Error, Result};
use crate::interpolate::Interpolation;
use crate::transform::TransformHandle;

pub mod ants;
pub mod native;

pub use ants::AntsEngine;
pub use native::NativeEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RegistrationMode {
    Rigid,
    Affine,
    /// Affine followed by a deformable stage.
    Syn,
}

/// Transforms produced by a full registration of `moving` onto `fixed`.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub affine: TransformHandle,
    pub warp: Option<TransformHandle>,
    pub inverse_affine: TransformHandle,
    pub inverse_warp: Option<TransformHandle>,
}

/// Deformation restricted to one physical axis.
#[derive(Debug, Clone, PartialEq)]
pub struct RestrictedRegistration {
    pub warp: TransformHandle,
    pub inverse_warp: TransformHandle,
}

/// Per-level iteration counts of a multi-resolution solve, coarse to fine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationSchedule(Vec<u32>);

/// Shrink factors are powers of two, so the pyramid must fit in a `u32`.
pub const MAX_LEVELS: usize = 32;

impl IterationSchedule {
    pub fn new(levels: Vec<u32>) -> Result<Self> {
        if levels.is_empty() {
            return Err(Error::InvalidArgument(
                "iteration schedule needs at least one level".to_string(),
            ));
        }
        if levels.len() > MAX_LEVELS {
            return Err(Error::InvalidArgument(format!(
                "iteration schedule has {} levels, at most {MAX_LEVELS} are supported",
                levels.len()
            )));
        }
        Ok(Self(levels))
    }

    pub fn levels(&self) -> &[u32] {
        &self.0
    }

    /// Shrink factors halving per level, ending at full resolution (`8x4x2x1`).
    pub fn shrink_factors(&self) -> String {
        let n = self.0.len() as u32;
        join_x((0..n).rev().map(|i| 1u32 << i))
    }

    /// Smoothing sigmas in voxels, one fewer per level (`3x2x1x0vox`).
    pub fn smoothing_sigmas(&self) -> String {
        let n = self.0.len() as u32;
        format!("{}vox", join_x((0..n).rev()))
    }
}

impl Default for IterationSchedule {
    fn default() -> Self {
        Self(vec![100, 70, 50, 20])
    }
}

impl fmt::Display for IterationSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", join_x(self.0.iter().copied()))
    }
}

impl FromStr for IterationSchedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let levels = s
            .split('x')
            .map(|tok| {
                tok.trim().parse::<u32>().map_err(|e| {
                    Error::InvalidArgument(format!("bad iteration schedule '{s}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(levels)
    }
}

/// Axis mask in the `0x1x0` form understood by restricted registration.
pub fn axis_mask_string(mask: [f64; 3]) -> String {
    mask.iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("x")
}

/// Mask that frees exactly one physical axis.
pub fn axis_mask(axis: Direction) -> [f64; 3] {
    axis.mask()
}

fn join_x(values: impl Iterator<Item = u32>) -> String {
    values.map(|v| v.to_string()).collect::<Vec<_>>().join("x")
}

/// Registration collaborator. Every call may be slow; none mutate their inputs.
pub trait RegistrationEngine: Send + Sync {
    /// Solves `moving` onto `fixed`; outputs are written under `output_prefix`.
    fn register(
        &self,
        fixed: &Path,
        moving: &Path,
        mode: RegistrationMode,
        output_prefix: &Path,
    ) -> Result<Registration>;

    /// Deformable solve whose displacement is confined to the axes set in `axis_mask`.
    fn register_restricted(
        &self,
        fixed: &Path,
        moving: &Path,
        axis_mask: [f64; 3],
        schedule: &IterationSchedule,
        output_prefix: &Path,
    ) -> Result<RestrictedRegistration>;

    /// Resamples `moving` onto `reference`. `transforms` is in operator order:
    /// the last entry is applied to the image first.
    fn apply(
        &self,
        moving: &Path,
        reference: &Path,
        transforms: &[&TransformHandle],
        interpolation: Interpolation,
        output: &Path,
    ) -> Result<()>;

    /// A handle that applies `transform` in the opposite direction.
    fn invert(&self, transform: &TransformHandle) -> Result<TransformHandle>;
}
