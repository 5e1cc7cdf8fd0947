//! Loading, saving and reshaping 3D/4D nifti volumes.
//!
//! A [`Volume`] keeps the sample array together with the header it came from,
//! so every derived volume carries the original metadata forward and only the
//! dimension fields are touched.

use std::path::Path;

use nalgebra::Matrix4;
use ndarray::{ArrayD, ArrayView3, Axis, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use tracing::debug;

use crate::common::Vol3D;
use crate::error::{ensure_exists, Error, Result};

/// Default position of the shell (volume) axis in a 4D series.
pub const SHELL_AXIS: usize = 3;

#[derive(Debug, Clone)]
pub struct Volume {
    data: ArrayD<f64>,
    header: NiftiHeader,
}

impl Volume {
    pub fn new(data: ArrayD<f64>, header: NiftiHeader) -> Self {
        Self { data, header }
    }

    /// Wraps a bare array with a fresh header carrying `affine`.
    pub fn from_array(data: ArrayD<f64>, affine: &Matrix4<f64>) -> Self {
        let mut header = NiftiHeader::default();
        header.set_affine(affine);
        if header.sform_code == 0 {
            header.sform_code = 2;
        }
        for i in 0..3 {
            let spacing = (0..3).map(|r| affine[(r, i)].powi(2)).sum::<f64>().sqrt();
            header.pixdim[i + 1] = spacing as f32;
        }
        Self { data, header }
    }

    pub fn load(path: &Path) -> Result<Self> {
        ensure_exists(path)?;
        let obj = ReaderOptions::new().read_file(path)?;
        let header = obj.header().clone();
        let data = obj.into_volume().into_ndarray::<f64>()?;
        debug!("Loaded {} with shape {:?}", path.display(), data.shape());
        if data.ndim() < 3 || data.ndim() > 5 {
            return Err(Error::ShapeMismatch(format!(
                "{} has {} dimensions, expected 3 to 5",
                path.display(),
                data.ndim()
            )));
        }
        Ok(Self { data, header })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut header = self.header.clone();
        sync_dims(&mut header, self.data.shape())?;
        // samples are already scaled on load
        header.scl_slope = 1.0;
        header.scl_inter = 0.0;
        WriterOptions::new(path)
            .reference_header(&header)
            .write_nifti(&self.data)?;
        debug!("Wrote {} with shape {:?}", path.display(), self.data.shape());
        Ok(())
    }

    pub fn data(&self) -> &ArrayD<f64> {
        &self.data
    }

    pub fn into_data(self) -> ArrayD<f64> {
        self.data
    }

    pub fn header(&self) -> &NiftiHeader {
        &self.header
    }

    pub fn affine(&self) -> Matrix4<f64> {
        self.header.affine::<f64>()
    }

    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Spatial extent of the first three axes.
    pub fn spatial_shape(&self) -> [usize; 3] {
        let s = self.data.shape();
        [s[0], s[1], s[2]]
    }

    /// Builds a derived volume that inherits this volume's header.
    pub fn with_data(&self, data: ArrayD<f64>) -> Self {
        let mut header = self.header.clone();
        // dims are refreshed on save; keep dim[0] honest in memory too
        header.dim[0] = data.ndim() as u16;
        Self { data, header }
    }

    /// Number of entries along `axis`, or 1 for a 3D volume.
    pub fn shell_count(&self, axis: usize) -> usize {
        if self.data.ndim() == 3 {
            1
        } else {
            self.data.shape().get(axis).copied().unwrap_or(1)
        }
    }

    /// Views the samples as a single 3D array.
    pub fn as_array3(&self) -> Result<ArrayView3<'_, f64>> {
        let view = self.data.view();
        let view = match view.ndim() {
            4 if view.shape()[3] == 1 => view.index_axis_move(Axis(3), 0),
            _ => view,
        };
        view.into_dimensionality::<Ix3>().map_err(|e| {
            Error::ShapeMismatch(format!(
                "expected a 3D volume, got shape {:?}: {e}",
                self.data.shape()
            ))
        })
    }

    /// Cuts out the 3D volume at `index` along `axis`; negative indices count from the end.
    pub fn extract(&self, index: i64, axis: usize) -> Result<Volume> {
        self.check_series(axis)?;
        let i = resolve_index(index, self.data.shape()[axis])?;
        let vol = self.data.index_axis(Axis(axis), i).to_owned();
        Ok(self.with_data(vol))
    }

    /// Splits a 4D series into indexed 3D volumes.
    pub fn split(&self, axis: usize) -> Result<Vec<Vol3D>> {
        self.check_series(axis)?;
        let end_index = self.data.shape()[axis];
        let mut vols = Vec::with_capacity(end_index);
        for i in 0..end_index {
            let vol = self.data.index_axis(Axis(axis), i);
            // enforce 3D
            let vol = vol.into_dimensionality::<Ix3>().map_err(|e| {
                Error::ShapeMismatch(format!("volume {i} is not 3D: {e}"))
            })?;
            vols.push(Vol3D::new(vol.to_owned(), i));
        }
        Ok(vols)
    }

    /// Re-stacks 3D volumes along `axis`, ordered by their index.
    pub fn stack(mut vols: Vec<Vol3D>, axis: usize, header: &NiftiHeader) -> Result<Volume> {
        if vols.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot stack an empty list of volumes".to_string(),
            ));
        }
        if axis > 3 {
            return Err(Error::InvalidArgument(format!(
                "shell axis {axis} is out of range for a 4D series"
            )));
        }
        vols.sort_by_key(|v| v.index);
        let first = vols[0].vol.shape().to_vec();
        if let Some(bad) = vols.iter().find(|v| v.vol.shape() != first.as_slice()) {
            return Err(Error::ShapeMismatch(format!(
                "volume {} has shape {:?}, expected {:?}",
                bad.index,
                bad.vol.shape(),
                first
            )));
        }
        let views: Vec<ArrayView3<f64>> = vols.iter().map(|v| v.vol.view()).collect();
        let stacked = ndarray::stack(Axis(axis), &views)
            .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
        let mut header = header.clone();
        header.dim[0] = 4;
        Ok(Volume::new(stacked.into_dyn(), header))
    }

    fn check_series(&self, axis: usize) -> Result<()> {
        if self.data.ndim() != 4 {
            return Err(Error::ShapeMismatch(format!(
                "expected a 4D series, got shape {:?}",
                self.data.shape()
            )));
        }
        if axis >= 4 {
            return Err(Error::InvalidArgument(format!(
                "shell axis {axis} is out of range for a 4D series"
            )));
        }
        Ok(())
    }
}

/// `base` moved onto the voxel grid of `grid`.
///
/// Spatial dims, spacing and both orientation blocks come from `grid`;
/// everything else (time spacing, units, description, intent) stays as in `base`.
pub fn with_grid_of(base: &NiftiHeader, grid: &NiftiHeader) -> NiftiHeader {
    let mut header = base.clone();
    header.dim[1..4].copy_from_slice(&grid.dim[1..4]);
    // pixdim[0] carries the qform handedness
    header.pixdim[0..4].copy_from_slice(&grid.pixdim[0..4]);
    header.qform_code = grid.qform_code;
    header.sform_code = grid.sform_code;
    header.quatern_b = grid.quatern_b;
    header.quatern_c = grid.quatern_c;
    header.quatern_d = grid.quatern_d;
    header.quatern_x = grid.quatern_x;
    header.quatern_y = grid.quatern_y;
    header.quatern_z = grid.quatern_z;
    header.srow_x = grid.srow_x;
    header.srow_y = grid.srow_y;
    header.srow_z = grid.srow_z;
    header
}

/// Resolves a possibly negative index against `len` entries.
pub fn resolve_index(index: i64, len: usize) -> Result<usize> {
    let resolved = if index < 0 {
        len as i64 + index
    } else {
        index
    };
    if resolved < 0 || resolved >= len as i64 {
        return Err(Error::IndexOutOfRange { index, len });
    }
    Ok(resolved as usize)
}

fn sync_dims(header: &mut NiftiHeader, shape: &[usize]) -> Result<()> {
    header.dim = [1; 8];
    header.dim[0] = shape.len() as u16;
    for (i, &n) in shape.iter().enumerate() {
        header.dim[i + 1] = u16::try_from(n).map_err(|_| {
            Error::ShapeMismatch(format!("axis {i} of length {n} does not fit a nifti header"))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, Array3, Array4};

    fn series() -> Volume {
        let data = Array4::from_shape_fn((3, 4, 2, 5), |(x, y, z, t)| {
            (x + 10 * y + 100 * z + 1000 * t) as f64
        });
        Volume::from_array(data.into_dyn(), &Matrix4::identity())
    }

    #[test]
    fn negative_index_counts_from_end() {
        assert_eq!(resolve_index(-1, 5).unwrap(), 4);
        assert_eq!(resolve_index(2, 5).unwrap(), 2);
        assert!(resolve_index(5, 5).is_err());
        assert!(resolve_index(-6, 5).is_err());
    }

    #[test]
    fn extract_keeps_voxels() {
        let vol = series().extract(-2, SHELL_AXIS).unwrap();
        assert_eq!(vol.shape(), &[3, 4, 2]);
        assert_eq!(vol.as_array3().unwrap()[[1, 2, 1]], 1.0 + 20.0 + 100.0 + 3000.0);
    }

    #[test]
    fn split_then_stack_reverses_order_independent() {
        let original = series();
        let mut vols = original.split(SHELL_AXIS).unwrap();
        vols.reverse();
        let restacked = Volume::stack(vols, SHELL_AXIS, original.header()).unwrap();
        assert_eq!(restacked.data(), original.data());
    }

    #[test]
    fn stack_rejects_mixed_shapes() {
        let a = Vol3D::new(Array::zeros((2, 2, 2)), 0);
        let b = Vol3D::new(Array::zeros((2, 3, 2)), 1);
        let err = Volume::stack(vec![a, b], SHELL_AXIS, &NiftiHeader::default()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ShapeMismatch);
    }

    #[test]
    fn save_and_load_preserves_affine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.nii");
        let mut affine = Matrix4::identity();
        affine[(0, 0)] = 2.0;
        affine[(1, 3)] = -5.0;
        let data = Array3::from_shape_fn((4, 3, 2), |(x, y, z)| (x * y + z) as f64);
        Volume::from_array(data.clone().into_dyn(), &affine)
            .save(&path)
            .unwrap();

        let loaded = Volume::load(&path).unwrap();
        assert_eq!(loaded.data(), &data.into_dyn());
        assert!((loaded.affine() - affine).abs().max() < 1e-5);
    }

    #[test]
    fn grid_is_adopted_without_series_metadata() {
        let mut base = series().header().clone();
        base.pixdim[4] = 2.5;
        base.xyzt_units = 10;
        let mut grid_affine = Matrix4::identity();
        grid_affine[(0, 0)] = 1.5;
        grid_affine[(2, 3)] = 7.0;
        let grid = Volume::from_array(Array3::<f64>::zeros((6, 6, 6)).into_dyn(), &grid_affine);

        let header = with_grid_of(&base, grid.header());
        assert_eq!(header.pixdim[4], 2.5);
        assert_eq!(header.xyzt_units, 10);
        assert_eq!(header.pixdim[1], 1.5);
        assert_eq!(header.srow_z, grid.header().srow_z);
    }

    #[test]
    fn load_missing_file_is_input_not_found() {
        let err = Volume::load(Path::new("/nonexistent/nowhere.nii")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InputNotFound);
    }
}
