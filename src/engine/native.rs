//! In-process apply-operator for ITK text affines and displacement fields.
//!
//! Output voxels are pulled back from the reference grid: each voxel centre
//! is mapped to world space, pushed through the transforms in operator order
//! and sampled from the moving image. Registration itself is not available.

use std::path::Path;

use nalgebra::{Matrix4, Vector3, Vector4};
use ndarray::{Array3, Array4, ArrayD, ArrayView3, Axis, Ix3, Ix4};
use rayon::prelude::*;
use tracing::debug;

use super::{
    IterationSchedule, Registration, RegistrationEngine, RegistrationMode, RestrictedRegistration,
};
use crate::affine_file::AffineTransform;
use crate::error::{Error, Result};
use crate::interpolate::{sample, Boundary, Interpolation, Method};
use crate::transform::{TransformHandle, TransformKind};
use crate::volume::Volume;

#[derive(Debug, Clone, Default)]
pub struct NativeEngine;

impl NativeEngine {
    pub fn new() -> Self {
        Self
    }
}

/// One loaded step of the pull-back mapping.
enum PointMap {
    Affine(Matrix4<f64>),
    Warp {
        /// LPS displacement in mm, components on the last axis.
        field: Array4<f64>,
        world_to_voxel: Matrix4<f64>,
    },
}

impl PointMap {
    fn load(handle: &TransformHandle) -> Result<Self> {
        match handle.kind() {
            TransformKind::Affine => {
                let affine = AffineTransform::load(handle.path())?;
                let affine = if handle.is_inverted() {
                    affine.inverse()?
                } else {
                    affine
                };
                Ok(PointMap::Affine(affine.to_ras_matrix()))
            }
            TransformKind::Warp => {
                if handle.is_inverted() {
                    return Err(Error::ResamplingFailure(format!(
                        "cannot invert displacement field {} in place",
                        handle.path().display()
                    )));
                }
                let vol = Volume::load(handle.path())?;
                let world_to_voxel = invert(&vol.affine())?;
                Ok(PointMap::Warp {
                    field: vector_field(vol.into_data())?,
                    world_to_voxel,
                })
            }
        }
    }

    fn map(&self, p: Vector3<f64>) -> Vector3<f64> {
        match self {
            PointMap::Affine(m) => transform_point(m, &p),
            PointMap::Warp {
                field,
                world_to_voxel,
            } => {
                let q = transform_point(world_to_voxel, &p);
                let q = [q.x, q.y, q.z];
                let d: Vec<f64> = (0..3)
                    .map(|c| {
                        sample(
                            &field.index_axis(Axis(3), c),
                            q,
                            Method::Linear,
                            Boundary::Constant(0.0),
                        )
                    })
                    .collect();
                // stored in LPS
                p + Vector3::new(-d[0], -d[1], d[2])
            }
        }
    }
}

fn transform_point(m: &Matrix4<f64>, p: &Vector3<f64>) -> Vector3<f64> {
    let h = m * Vector4::new(p.x, p.y, p.z, 1.0);
    Vector3::new(h.x, h.y, h.z)
}

fn invert(m: &Matrix4<f64>) -> Result<Matrix4<f64>> {
    m.try_inverse()
        .ok_or_else(|| Error::ResamplingFailure("image affine is singular".to_string()))
}

fn vector_field(data: ArrayD<f64>) -> Result<Array4<f64>> {
    let shape = data.shape().to_vec();
    let data = match shape.len() {
        4 if shape[3] == 3 => data,
        5 if shape[3] == 1 && shape[4] == 3 => data.index_axis_move(Axis(3), 0),
        _ => {
            return Err(Error::ShapeMismatch(format!(
                "warp field shape {shape:?} is not a 3-vector field"
            )))
        }
    };
    data.into_dimensionality::<Ix4>()
        .map_err(|e| Error::ShapeMismatch(e.to_string()))
}

impl RegistrationEngine for NativeEngine {
    fn register(
        &self,
        _fixed: &Path,
        _moving: &Path,
        _mode: RegistrationMode,
        _output_prefix: &Path,
    ) -> Result<Registration> {
        Err(Error::RegistrationFailure(
            "the native engine cannot solve registrations; use the ants engine".to_string(),
        ))
    }

    fn register_restricted(
        &self,
        _fixed: &Path,
        _moving: &Path,
        _axis_mask: [f64; 3],
        _schedule: &IterationSchedule,
        _output_prefix: &Path,
    ) -> Result<RestrictedRegistration> {
        Err(Error::RegistrationFailure(
            "the native engine cannot solve registrations; use the ants engine".to_string(),
        ))
    }

    fn apply(
        &self,
        moving: &Path,
        reference: &Path,
        transforms: &[&TransformHandle],
        interpolation: Interpolation,
        output: &Path,
    ) -> Result<()> {
        if transforms.is_empty() {
            return Err(Error::NoTransformProvided);
        }
        let method = interpolation.native_method().ok_or_else(|| {
            Error::ResamplingFailure(format!(
                "{interpolation} interpolation needs the ants engine"
            ))
        })?;
        let maps = transforms
            .iter()
            .map(|t| PointMap::load(t))
            .collect::<Result<Vec<_>>>()?;
        let moving_vol = Volume::load(moving)?;
        let reference_vol = Volume::load(reference)?;
        let ref_to_world = reference_vol.affine();
        let world_to_moving = invert(&moving_vol.affine())?;
        let target = reference_vol.spatial_shape();
        debug!(
            "Native resampling of {} onto {:?} through {} map(s)",
            moving.display(),
            target,
            maps.len()
        );

        let coords: Vec<[f64; 3]> = (0..target[0] * target[1] * target[2])
            .into_par_iter()
            .map(|flat| {
                let z = flat % target[2];
                let y = (flat / target[2]) % target[1];
                let x = flat / (target[1] * target[2]);
                let mut p = transform_point(&ref_to_world, &Vector3::new(x as f64, y as f64, z as f64));
                for m in &maps {
                    p = m.map(p);
                }
                let q = transform_point(&world_to_moving, &p);
                [q.x, q.y, q.z]
            })
            .collect();

        let pull = |img: &ArrayView3<f64>| -> Result<Array3<f64>> {
            let values: Vec<f64> = coords
                .iter()
                .map(|&q| sample(img, q, method, Boundary::Constant(0.0)))
                .collect();
            // coords are laid out in standard (row-major) order
            Array3::from_shape_vec(target, values).map_err(|e| Error::ShapeMismatch(e.to_string()))
        };

        let out: ArrayD<f64> = match moving_vol.ndim() {
            3 => pull(&moving_vol.as_array3()?)?.into_dyn(),
            4 => {
                let shells: Vec<Array3<f64>> = moving_vol
                    .data()
                    .axis_iter(Axis(3))
                    .map(|s| {
                        let s = s
                            .into_dimensionality::<Ix3>()
                            .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
                        pull(&s)
                    })
                    .collect::<Result<_>>()?;
                let views: Vec<_> = shells.iter().map(|s| s.view()).collect();
                ndarray::stack(Axis(3), &views)
                    .map_err(|e| Error::ShapeMismatch(e.to_string()))?
                    .into_dyn()
            }
            n => {
                return Err(Error::ShapeMismatch(format!(
                    "cannot resample a {n}-dimensional moving image"
                )))
            }
        };
        reference_vol.with_data(out).save(output)
    }

    fn invert(&self, transform: &TransformHandle) -> Result<TransformHandle> {
        match transform.kind() {
            TransformKind::Affine => Ok(transform.toggled()),
            TransformKind::Warp => Err(Error::RegistrationFailure(format!(
                "{} is a displacement field and cannot be inverted by flag",
                transform.path().display()
            ))),
        }
    }
}
