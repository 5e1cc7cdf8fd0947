//! Transform handles and ordered transform chains.
//!
//! A [`TransformChain`] is always described in forward application order:
//! the first step is the one applied to the moving image first. The
//! delegated apply-operator wants the opposite, so the list is reversed
//! exactly once, in [`TransformChain::operator_order`], right before it is
//! handed to a [`RegistrationEngine`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nifti::NiftiHeader;
use tracing::{debug, info};

use crate::engine::RegistrationEngine;
use crate::error::{ensure_exists, Error, Result};
use crate::interpolate::Interpolation;
use crate::series::SeriesRunner;
use crate::volume::Volume;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformKind {
    /// A linear map stored in a transform file.
    Affine,
    /// A dense displacement field stored as a volume.
    Warp,
}

/// Reference to a transform on disk. Handles are never modified in place.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransformHandle {
    path: PathBuf,
    kind: TransformKind,
    inverted: bool,
}

impl TransformHandle {
    pub fn affine(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: TransformKind::Affine,
            inverted: false,
        }
    }

    pub fn warp(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: TransformKind::Warp,
            inverted: false,
        }
    }

    /// Guesses the kind from the file name: volumes are warps, anything else an affine.
    pub fn infer(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(".nii") || name.ends_with(".nii.gz") {
            Self::warp(path)
        } else {
            Self::affine(path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> TransformKind {
        self.kind
    }

    pub fn is_inverted(&self) -> bool {
        self.inverted
    }

    /// The same file applied in the opposite direction. Engines decide whether
    /// they can honour this for a given kind.
    pub(crate) fn toggled(&self) -> Self {
        Self {
            inverted: !self.inverted,
            ..self.clone()
        }
    }
}

/// Parses the `path` / `path,1` / `[path,1]` notation; the trailing flag inverts.
impl FromStr for TransformHandle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let s = s
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(s);
        let (path, inverted) = match s.rsplit_once(',') {
            Some((path, "1")) => (path, true),
            Some((path, "0")) => (path, false),
            _ => (s, false),
        };
        if path.is_empty() {
            return Err(Error::InvalidArgument("empty transform path".to_string()));
        }
        let handle = Self::infer(path);
        if inverted {
            if handle.kind == TransformKind::Warp {
                return Err(Error::InvalidArgument(format!(
                    "{path} is a displacement field; pass its inverse warp instead"
                )));
            }
            return Ok(handle.toggled());
        }
        Ok(handle)
    }
}

impl fmt::Display for TransformHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inverted {
            write!(f, "[{},1]", self.path.display())
        } else {
            write!(f, "{}", self.path.display())
        }
    }
}

/// The three named slots of a chain: affine first, then primary warp, then secondary warp.
#[derive(Debug, Clone, Copy, Default)]
pub struct NamedTransforms<'a> {
    pub affine: Option<&'a TransformHandle>,
    pub primary_warp: Option<&'a TransformHandle>,
    pub secondary_warp: Option<&'a TransformHandle>,
}

/// Ordered, borrowed list of transforms; stateless and reusable across images.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformChain<'a> {
    steps: Vec<&'a TransformHandle>,
}

impl<'a> TransformChain<'a> {
    /// Applies the affine first, the primary warp second and the secondary warp third.
    pub fn from_named(named: NamedTransforms<'a>) -> Result<Self> {
        let steps = [named.affine, named.primary_warp, named.secondary_warp]
            .into_iter()
            .flatten()
            .collect();
        Self::from_list(steps)
    }

    /// Takes an explicit list in forward application order.
    pub fn from_list(steps: Vec<&'a TransformHandle>) -> Result<Self> {
        if steps.is_empty() {
            return Err(Error::NoTransformProvided);
        }
        Ok(Self { steps })
    }

    /// Forward application order.
    pub fn steps(&self) -> &[&'a TransformHandle] {
        &self.steps
    }

    /// The list as the apply-operator consumes it: last-applied first.
    pub fn operator_order(&self) -> Vec<&'a TransformHandle> {
        self.steps.iter().rev().copied().collect()
    }

    pub fn validate(&self) -> Result<()> {
        for step in &self.steps {
            ensure_exists(step.path())?;
        }
        Ok(())
    }

    /// Resamples `moving` into `reference` space and writes `output`.
    ///
    /// A 4D moving image is split and each volume is sent through the engine
    /// separately on `runner`'s worker pool.
    pub fn apply(
        &self,
        engine: &dyn RegistrationEngine,
        moving: &Path,
        reference: &Path,
        output: &Path,
        interpolation: Interpolation,
        runner: &SeriesRunner,
    ) -> Result<()> {
        ensure_exists(moving)?;
        ensure_exists(reference)?;
        self.validate()?;
        let operator = self.operator_order();
        info!(
            "Applying {} transform(s) to {} ({})",
            operator.len(),
            moving.display(),
            interpolation
        );
        debug!("Operator order: {}", describe(&operator));

        let header = NiftiHeader::from_file(moving)?;
        let is_series = header.dim[0] >= 4 && header.dim[4] > 1;
        if !is_series {
            return engine.apply(moving, reference, &operator, interpolation, output);
        }

        let series = Volume::load(moving)?;
        let scratch = tempfile::tempdir()?;
        let out = runner.run(&series, scratch.path(), |_, src, dst| {
            engine.apply(src, reference, &operator, interpolation, dst)
        })?;
        out.save(output)
    }
}

pub(crate) fn describe(handles: &[&TransformHandle]) -> String {
    handles
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn empty_chain_is_rejected() {
        let err = TransformChain::from_named(NamedTransforms::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoTransformProvided);
        assert_eq!(
            TransformChain::from_list(vec![]).unwrap_err().kind(),
            ErrorKind::NoTransformProvided
        );
    }

    #[test]
    fn named_slots_reach_operator_reversed() {
        let affine = TransformHandle::affine("a.txt");
        let primary = TransformHandle::warp("w1.nii.gz");
        let secondary = TransformHandle::warp("w2.nii.gz");
        let chain = TransformChain::from_named(NamedTransforms {
            affine: Some(&affine),
            primary_warp: Some(&primary),
            secondary_warp: Some(&secondary),
        })
        .unwrap();

        assert_eq!(chain.steps(), &[&affine, &primary, &secondary]);
        assert_eq!(chain.operator_order(), vec![&secondary, &primary, &affine]);
    }

    #[test]
    fn missing_slots_are_skipped() {
        let primary = TransformHandle::warp("w1.nii.gz");
        let chain = TransformChain::from_named(NamedTransforms {
            primary_warp: Some(&primary),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(chain.operator_order(), vec![&primary]);
    }

    #[test]
    fn kind_is_inferred_from_extension() {
        assert_eq!(TransformHandle::infer("x/1Warp.nii.gz").kind(), TransformKind::Warp);
        assert_eq!(TransformHandle::infer("x/0GenericAffine.mat").kind(), TransformKind::Affine);
        assert_eq!(TransformHandle::affine("a.mat").toggled().to_string(), "[a.mat,1]");
    }

    #[test]
    fn inversion_flag_is_parsed() {
        let h: TransformHandle = "reg/0GenericAffine.mat,1".parse().unwrap();
        assert!(h.is_inverted());
        assert_eq!(h.kind(), TransformKind::Affine);
        let h: TransformHandle = "[reg/0GenericAffine.mat,1]".parse().unwrap();
        assert_eq!(h.path(), Path::new("reg/0GenericAffine.mat"));
        let h: TransformHandle = "reg/1Warp.nii.gz".parse().unwrap();
        assert!(!h.is_inverted());
        assert_eq!(h.kind(), TransformKind::Warp);
        let err = "reg/1Warp.nii.gz,1".parse::<TransformHandle>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn missing_transform_file_is_reported() {
        let handle = TransformHandle::affine("/nonexistent/affine.txt");
        let chain = TransformChain::from_list(vec![&handle]).unwrap();
        assert_eq!(chain.validate().unwrap_err().kind(), ErrorKind::InputNotFound);
    }
}
