//! Paired b-value / b-vector tables in the FSL text layout.

use std::fs;
use std::path::Path;

use tracing::warn;

use crate::error::{ensure_exists, Error, Result};
use crate::volume::resolve_index;

/// b-values below or equal to this are treated as non-diffusion-weighted.
pub const DEFAULT_B0_THRESHOLD: f64 = 50.0;

#[derive(Debug, Clone, PartialEq)]
pub struct GradientTable {
    bvals: Vec<f64>,
    bvecs: Vec<[f64; 3]>,
}

impl GradientTable {
    pub fn new(bvals: Vec<f64>, bvecs: Vec<[f64; 3]>) -> Result<Self> {
        if bvals.len() != bvecs.len() {
            return Err(Error::ShapeMismatch(format!(
                "{} b-values but {} b-vectors",
                bvals.len(),
                bvecs.len()
            )));
        }
        Ok(Self { bvals, bvecs })
    }

    /// Reads a `.bval`/`.bvec` pair.
    pub fn load(bval_path: &Path, bvec_path: &Path) -> Result<Self> {
        let bvals = read_bvals(bval_path)?;
        let bvecs = read_bvecs(bvec_path)?;
        Self::new(bvals, bvecs)
    }

    /// Writes the canonical layout: one bval line, three bvec rows.
    pub fn save(&self, bval_path: &Path, bvec_path: &Path) -> Result<()> {
        write_bvals(bval_path, &self.bvals)?;
        let rows: Vec<String> = (0..3)
            .map(|c| join(self.bvecs.iter().map(|v| v[c])))
            .collect();
        fs::write(bvec_path, rows.join("\n") + "\n")?;
        Ok(())
    }

    pub fn bvals(&self) -> &[f64] {
        &self.bvals
    }

    pub fn bvecs(&self) -> &[[f64; 3]] {
        &self.bvecs
    }

    pub fn len(&self) -> usize {
        self.bvals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bvals.is_empty()
    }

    /// Index of the first entry at or below `threshold`, scanning in order.
    pub fn first_b0(&self, threshold: f64) -> Option<usize> {
        self.bvals.iter().position(|&b| b <= threshold)
    }

    /// Single-entry table for the volume at `index`.
    pub fn select(&self, index: i64) -> Result<GradientTable> {
        let i = resolve_index(index, self.len())?;
        Ok(Self {
            bvals: vec![self.bvals[i]],
            bvecs: vec![self.bvecs[i]],
        })
    }

    /// Every entry except `index`, in original order.
    pub fn exclude(&self, index: i64) -> Result<GradientTable> {
        let i = resolve_index(index, self.len())?;
        let mut rest = Self {
            bvals: Vec::with_capacity(self.len().saturating_sub(1)),
            bvecs: Vec::with_capacity(self.len().saturating_sub(1)),
        };
        for (j, (b, v)) in self.bvals.iter().zip(&self.bvecs).enumerate() {
            if j != i {
                rest.bvals.push(*b);
                rest.bvecs.push(*v);
            }
        }
        Ok(rest)
    }
}

pub fn read_bvals(path: &Path) -> Result<Vec<f64>> {
    ensure_exists(path)?;
    let text = fs::read_to_string(path)?;
    text.split_whitespace()
        .map(|tok| {
            tok.parse::<f64>()
                .map_err(|e| Error::parse(path, format!("bad b-value '{tok}': {e}")))
        })
        .collect()
}

pub fn write_bvals(path: &Path, bvals: &[f64]) -> Result<()> {
    fs::write(path, join(bvals.iter().copied()) + "\n")?;
    Ok(())
}

/// Reads three rows of per-shell components. A file of N rows by 3 columns is
/// transposed on the fly.
pub fn read_bvecs(path: &Path) -> Result<Vec<[f64; 3]>> {
    ensure_exists(path)?;
    let text = fs::read_to_string(path)?;
    let rows = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            line.split_whitespace()
                .map(|tok| {
                    tok.parse::<f64>()
                        .map_err(|e| Error::parse(path, format!("bad b-vector '{tok}': {e}")))
                })
                .collect::<Result<Vec<f64>>>()
        })
        .collect::<Result<Vec<Vec<f64>>>>()?;

    if rows.len() == 3 && rows.iter().all(|r| r.len() == rows[0].len()) {
        let n = rows[0].len();
        return Ok((0..n).map(|i| [rows[0][i], rows[1][i], rows[2][i]]).collect());
    }
    if !rows.is_empty() && rows.iter().all(|r| r.len() == 3) {
        warn!(
            "{} stores one b-vector per row; reading it transposed",
            path.display()
        );
        return Ok(rows.iter().map(|r| [r[0], r[1], r[2]]).collect());
    }
    Err(Error::parse(
        path,
        format!("expected 3 rows of equal length, found {} rows", rows.len()),
    ))
}

fn join(values: impl Iterator<Item = f64>) -> String {
    values
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}
