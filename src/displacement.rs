//! Direct voxel-space displacement along the phase-encoding axis.
//!
//! Each output voxel `(x, y, z)` is pulled from the input at
//! `(x, y + d(x, y, z), z)` (for the default Y axis) with linear
//! interpolation. Coordinates that fall off the grid are clamped, so edges
//! repeat instead of filling with zeros.

use ndarray::{Array3, Array4, ArrayD, ArrayView3, ArrayViewMutD, Axis, Ix3, Ix4, Slice};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::common::{Direction, Vol3D};
use crate::error::{Error, Result};
use crate::interpolate::{sample, Boundary, Method};
use crate::volume::{Volume, SHELL_AXIS};

/// Voxel-unit offsets, either along one axis or as full 3-vectors.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplacementField {
    /// One offset per voxel along the resampler's axis.
    Scalar(Array3<f64>),
    /// One offset vector per voxel; components on the trailing axis.
    Vector(Array4<f64>),
}

impl DisplacementField {
    /// Interprets a loaded nifti as a field.
    ///
    /// 3D data is a scalar field. Data whose trailing axis has length 3 is a
    /// vector field; a singleton 4th axis before it (`x, y, z, 1, 3`) is dropped.
    pub fn from_volume(vol: &Volume) -> Result<Self> {
        let data = vol.data();
        let shape = data.shape();
        match shape.len() {
            3 => Ok(Self::Scalar(into_3d(data.clone())?)),
            4 if shape[3] == 3 => Ok(Self::Vector(into_4d(data.clone())?)),
            5 if shape[3] == 1 && shape[4] == 3 => {
                Ok(Self::Vector(into_4d(data.index_axis(Axis(3), 0).to_owned())?))
            }
            _ => Err(Error::ShapeMismatch(format!(
                "displacement field shape {shape:?} is neither scalar nor 3-vector"
            ))),
        }
    }

    pub fn spatial_shape(&self) -> [usize; 3] {
        let s = match self {
            Self::Scalar(d) => d.shape(),
            Self::Vector(d) => d.shape(),
        };
        [s[0], s[1], s[2]]
    }

    /// Multiplies every offset, e.g. Hz times total readout time.
    pub fn scaled(self, factor: f64) -> Self {
        match self {
            Self::Scalar(d) => Self::Scalar(d * factor),
            Self::Vector(d) => Self::Vector(d * factor),
        }
    }

    /// Zeroes every component except `axis`; returns the largest magnitude removed.
    pub fn restrict_to_axis(&mut self, axis: Direction) -> f64 {
        match self {
            Self::Scalar(_) => 0.0,
            Self::Vector(d) => zero_off_axis(d.view_mut().into_dyn(), axis),
        }
    }

    /// Brings the field onto `target`, truncating the corrected axis from the start
    /// when the field is longer there. Any other disagreement is an error.
    fn conform(&self, target: [usize; 3], axis: Direction) -> Result<Self> {
        let have = self.spatial_shape();
        let a = axis.to_usize();
        for i in 0..3 {
            if i != a && have[i] != target[i] {
                return Err(Error::ShapeMismatch(format!(
                    "displacement field {have:?} and volume {target:?} disagree on axis {i}"
                )));
            }
        }
        if have[a] < target[a] {
            return Err(Error::ShapeMismatch(format!(
                "displacement field {have:?} is shorter than volume {target:?} on axis {a}"
            )));
        }
        if have[a] == target[a] {
            return Ok(self.clone());
        }
        warn!(
            "Truncating displacement field from {} to {} voxels on axis {}",
            have[a], target[a], a
        );
        let keep = Slice::from(0..target[a]);
        Ok(match self {
            Self::Scalar(d) => Self::Scalar(d.slice_axis(Axis(a), keep).to_owned()),
            Self::Vector(d) => Self::Vector(d.slice_axis(Axis(a), keep).to_owned()),
        })
    }
}

/// Zeroes the non-`axis` components of a vector field stored with its
/// components on the trailing axis; returns the largest magnitude removed.
pub fn restrict_components(data: &mut ArrayD<f64>, axis: Direction) -> Result<f64> {
    let last = data.ndim().checked_sub(1).ok_or_else(|| {
        Error::ShapeMismatch("cannot restrict a zero-dimensional field".to_string())
    })?;
    if data.shape()[last] != 3 {
        return Err(Error::ShapeMismatch(format!(
            "field shape {:?} has no trailing 3-vector axis",
            data.shape()
        )));
    }
    Ok(zero_off_axis(data.view_mut(), axis))
}

fn zero_off_axis(mut data: ArrayViewMutD<f64>, axis: Direction) -> f64 {
    let last = Axis(data.ndim() - 1);
    let mut removed: f64 = 0.0;
    for c in (0..3).filter(|&c| c != axis.to_usize()) {
        let mut comp = data.index_axis_mut(last, c);
        removed = comp.iter().fold(removed, |m, v| m.max(v.abs()));
        comp.fill(0.0);
    }
    removed
}

/// Applies displacement fields to 3D volumes or, shell by shell, to 4D series.
#[derive(Debug, Clone)]
pub struct DisplacementResampler {
    axis: Direction,
    shell_axis: usize,
}

impl Default for DisplacementResampler {
    fn default() -> Self {
        Self::new(Direction::Y)
    }
}

impl DisplacementResampler {
    pub fn new(axis: Direction) -> Self {
        Self {
            axis,
            shell_axis: SHELL_AXIS,
        }
    }

    pub fn with_shell_axis(mut self, shell_axis: usize) -> Self {
        self.shell_axis = shell_axis;
        self
    }

    pub fn axis(&self) -> Direction {
        self.axis
    }

    /// Resamples a single 3D array.
    pub fn resample(&self, img: &ArrayView3<f64>, field: &DisplacementField) -> Result<Array3<f64>> {
        let shape = img.shape();
        let target = [shape[0], shape[1], shape[2]];
        let field = field.conform(target, self.axis)?;
        let a = self.axis.to_usize();
        let out = match &field {
            DisplacementField::Scalar(d) => Array3::from_shape_fn(target, |(x, y, z)| {
                let mut p = [x as f64, y as f64, z as f64];
                p[a] += d[[x, y, z]];
                sample(img, p, Method::Linear, Boundary::Clamp)
            }),
            DisplacementField::Vector(d) => Array3::from_shape_fn(target, |(x, y, z)| {
                let p = [
                    x as f64 + d[[x, y, z, 0]],
                    y as f64 + d[[x, y, z, 1]],
                    z as f64 + d[[x, y, z, 2]],
                ];
                sample(img, p, Method::Linear, Boundary::Clamp)
            }),
        };
        Ok(out)
    }

    /// Resamples a 3D volume, or every shell of a 4D series independently.
    ///
    /// Shells are processed in parallel and restacked by their original index.
    pub fn apply(&self, vol: &Volume, field: &DisplacementField) -> Result<Volume> {
        match vol.ndim() {
            3 => {
                let out = self.resample(&vol.as_array3()?, field)?;
                Ok(vol.with_data(out.into_dyn()))
            }
            4 => {
                let shells = vol.split(self.shell_axis)?;
                debug!("Resampling {} shells along axis {}", shells.len(), self.axis);
                let corrected = shells
                    .into_par_iter()
                    .map(|s| {
                        let out = self.resample(&s.vol.view(), field)?;
                        Ok(Vol3D::new(out, s.index))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Volume::stack(corrected, self.shell_axis, vol.header())
            }
            n => Err(Error::ShapeMismatch(format!(
                "expected a 3D or 4D volume, got {n} dimensions"
            ))),
        }
    }
}

fn into_3d(data: ArrayD<f64>) -> Result<Array3<f64>> {
    data.into_dimensionality::<Ix3>()
        .map_err(|e| Error::ShapeMismatch(e.to_string()))
}

fn into_4d(data: ArrayD<f64>) -> Result<Array4<f64>> {
    data.into_dimensionality::<Ix4>()
        .map_err(|e| Error::ShapeMismatch(e.to_string()))
}
