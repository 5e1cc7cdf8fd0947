//! ITK text affine transforms.
//!
//! Parameters are stored in LPS physical space as nine matrix entries
//! (row-major) followed by the translation; the fixed parameters hold the
//! centre of rotation. Points map as `y = A (x - c) + t + c`.

use std::fs;
use std::path::Path;

use nalgebra::{Matrix3, Matrix4, Vector3, Vector4};

use crate::error::{ensure_exists, Error, Result};

const HEADER: &str = "#Insight Transform File V1.0";
const TRANSFORM_TYPE: &str = "AffineTransform_double_3_3";

#[derive(Debug, Clone, PartialEq)]
pub struct AffineTransform {
    matrix: Matrix3<f64>,
    translation: Vector3<f64>,
    center: Vector3<f64>,
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineTransform {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix3::identity(),
            translation: Vector3::zeros(),
            center: Vector3::zeros(),
        }
    }

    /// Builds a transform from a homogeneous point mapping given in RAS world coordinates.
    pub fn from_ras_matrix(m: &Matrix4<f64>) -> Self {
        let lps = ras_lps_flip() * m * ras_lps_flip();
        Self {
            matrix: lps.fixed_slice::<3, 3>(0, 0).into_owned(),
            translation: lps.fixed_slice::<3, 1>(0, 3).into_owned(),
            center: Vector3::zeros(),
        }
    }

    /// Homogeneous point mapping in RAS world coordinates.
    pub fn to_ras_matrix(&self) -> Matrix4<f64> {
        let offset = self.translation + self.center - self.matrix * self.center;
        let mut lps = Matrix4::identity();
        lps.fixed_slice_mut::<3, 3>(0, 0).copy_from(&self.matrix);
        lps.fixed_slice_mut::<3, 1>(0, 3).copy_from(&offset);
        ras_lps_flip() * lps * ras_lps_flip()
    }

    /// Maps a RAS world point.
    pub fn map_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        let h = self.to_ras_matrix() * Vector4::new(p.x, p.y, p.z, 1.0);
        Vector3::new(h.x, h.y, h.z)
    }

    pub fn inverse(&self) -> Result<Self> {
        let inv = self.to_ras_matrix().try_inverse().ok_or_else(|| {
            Error::ResamplingFailure("affine transform is singular and cannot be inverted".into())
        })?;
        Ok(Self::from_ras_matrix(&inv))
    }

    pub fn load(path: &Path) -> Result<Self> {
        ensure_exists(path)?;
        let text = fs::read_to_string(path)?;
        let mut params: Option<Vec<f64>> = None;
        let mut fixed: Option<Vec<f64>> = None;
        for line in text.lines() {
            let line = line.trim();
            if let Some(kind) = line.strip_prefix("Transform:") {
                let kind = kind.trim();
                if !(kind.starts_with("AffineTransform") || kind.starts_with("MatrixOffsetTransformBase")) {
                    return Err(Error::parse(path, format!("unsupported transform type '{kind}'")));
                }
            } else if let Some(rest) = line.strip_prefix("Parameters:") {
                params = Some(parse_numbers(path, rest)?);
            } else if let Some(rest) = line.strip_prefix("FixedParameters:") {
                fixed = Some(parse_numbers(path, rest)?);
            }
        }
        let params = params.ok_or_else(|| Error::parse(path, "missing Parameters line"))?;
        if params.len() != 12 {
            return Err(Error::parse(
                path,
                format!("expected 12 parameters, found {}", params.len()),
            ));
        }
        let center = match fixed {
            Some(c) if c.len() == 3 => Vector3::new(c[0], c[1], c[2]),
            Some(c) => {
                return Err(Error::parse(
                    path,
                    format!("expected 3 fixed parameters, found {}", c.len()),
                ))
            }
            None => Vector3::zeros(),
        };
        Ok(Self {
            matrix: Matrix3::from_row_slice(&params[..9]),
            translation: Vector3::new(params[9], params[10], params[11]),
            center,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let m = &self.matrix;
        let params: Vec<String> = (0..3)
            .flat_map(|r| (0..3).map(move |c| m[(r, c)]))
            .chain(self.translation.iter().copied())
            .map(|v| v.to_string())
            .collect();
        let fixed: Vec<String> = self.center.iter().map(|v| v.to_string()).collect();
        let text = format!(
            "{HEADER}\n#Transform 0\nTransform: {TRANSFORM_TYPE}\nParameters: {}\nFixedParameters: {}\n",
            params.join(" "),
            fixed.join(" ")
        );
        fs::write(path, text)?;
        Ok(())
    }
}

fn ras_lps_flip() -> Matrix4<f64> {
    Matrix4::from_diagonal(&Vector4::new(-1.0, -1.0, 1.0, 1.0))
}

fn parse_numbers(path: &Path, text: &str) -> Result<Vec<f64>> {
    text.split_whitespace()
        .map(|tok| {
            tok.parse::<f64>()
                .map_err(|e| Error::parse(path, format!("bad number '{tok}': {e}")))
        })
        .collect()
}
