//! Reference (b≈0) selection and splitting of diffusion series.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::common::Vol3D;
use crate::error::{Error, Result};
use crate::gradient::{GradientTable, DEFAULT_B0_THRESHOLD};
use crate::volume::{resolve_index, Volume, SHELL_AXIS};

/// How a reference index was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceSource {
    /// The caller named the index.
    Explicit,
    /// First b-value at or below the threshold.
    Threshold,
    /// The input was already a single 3D volume.
    PreExtracted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceSelection {
    pub index: usize,
    pub source: ReferenceSource,
}

#[derive(Debug, Clone)]
pub struct B0SplitEngine {
    threshold: f64,
    shell_axis: usize,
}

impl Default for B0SplitEngine {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_B0_THRESHOLD,
            shell_axis: SHELL_AXIS,
        }
    }
}

impl B0SplitEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_shell_axis(mut self, shell_axis: usize) -> Self {
        self.shell_axis = shell_axis;
        self
    }

    pub fn shell_axis(&self) -> usize {
        self.shell_axis
    }

    /// Picks the reference volume.
    ///
    /// An explicit index always wins. Otherwise the first b-value at or below
    /// the threshold is used, even when several qualify.
    pub fn select(
        &self,
        vol: &Volume,
        table: Option<&GradientTable>,
        explicit: Option<i64>,
    ) -> Result<ReferenceSelection> {
        if vol.ndim() == 3 {
            return self.select_pre_extracted(table, explicit);
        }
        let shells = vol.shell_count(self.shell_axis);

        if let Some(index) = explicit {
            let index = resolve_index(index, shells)?;
            info!("Using explicit reference index {index}");
            return Ok(ReferenceSelection {
                index,
                source: ReferenceSource::Explicit,
            });
        }

        let table = table.ok_or_else(|| {
            Error::AmbiguousReference(
                "a 4D series needs a gradient table or an explicit reference index".to_string(),
            )
        })?;
        if table.len() != shells {
            return Err(Error::AmbiguousReference(format!(
                "{} gradient entries for {} volumes; pass an explicit reference index",
                table.len(),
                shells
            )));
        }
        let index = table
            .first_b0(self.threshold)
            .ok_or(Error::NoReferenceFound {
                threshold: self.threshold,
            })?;
        info!(
            "Selected volume {index} as reference (b={}, threshold {})",
            table.bvals()[index],
            self.threshold
        );
        Ok(ReferenceSelection {
            index,
            source: ReferenceSource::Threshold,
        })
    }

    fn select_pre_extracted(
        &self,
        table: Option<&GradientTable>,
        explicit: Option<i64>,
    ) -> Result<ReferenceSelection> {
        if let Some(index) = explicit {
            resolve_index(index, 1)?;
        }
        if let Some(table) = table.filter(|t| t.len() > 1) {
            let first = table.bvals()[0];
            if first > self.threshold {
                return Err(Error::AmbiguousReference(format!(
                    "3D volume with {} gradient entries and a weighted first entry (b={first})",
                    table.len()
                )));
            }
            warn!(
                "3D volume given with {} gradient entries; using the first (b={first})",
                table.len()
            );
        }
        Ok(ReferenceSelection {
            index: 0,
            source: ReferenceSource::PreExtracted,
        })
    }

    /// The 3D reference volume.
    pub fn reference_volume(&self, vol: &Volume, sel: &ReferenceSelection) -> Result<Volume> {
        if vol.ndim() == 3 {
            return Ok(vol.clone());
        }
        vol.extract(sel.index as i64, self.shell_axis)
    }

    /// Every other volume, in original order.
    pub fn complement_series(&self, vol: &Volume, sel: &ReferenceSelection) -> Result<Volume> {
        if vol.ndim() == 3 {
            return Err(Error::InvalidArgument(
                "a 3D volume has no complementary series".to_string(),
            ));
        }
        let rest: Vec<Vol3D> = vol
            .split(self.shell_axis)?
            .into_iter()
            .filter(|v| v.index != sel.index)
            .collect();
        if rest.is_empty() {
            return Err(Error::InvalidArgument(
                "the series holds only the reference volume".to_string(),
            ));
        }
        Volume::stack(rest, self.shell_axis, vol.header())
    }

    /// Single-entry table for the reference.
    pub fn reference_table(
        &self,
        table: &GradientTable,
        sel: &ReferenceSelection,
    ) -> Result<GradientTable> {
        table.select(sel.index as i64)
    }

    /// Every entry except the reference, in original order.
    pub fn complement_table(
        &self,
        table: &GradientTable,
        sel: &ReferenceSelection,
    ) -> Result<GradientTable> {
        if sel.source == ReferenceSource::PreExtracted {
            return Err(Error::InvalidArgument(
                "a pre-extracted reference has no complementary gradient table".to_string(),
            ));
        }
        table.exclude(sel.index as i64)
    }

    /// Writes whichever artifacts `request` asks for.
    pub fn write(
        &self,
        vol: &Volume,
        table: Option<&GradientTable>,
        sel: &ReferenceSelection,
        request: &SplitRequest,
    ) -> Result<()> {
        if let Some(path) = &request.reference {
            self.reference_volume(vol, sel)?.save(path)?;
            info!("Wrote reference volume to {}", path.display());
        }
        if let Some(path) = &request.complement {
            self.complement_series(vol, sel)?.save(path)?;
            info!("Wrote complementary series to {}", path.display());
        }
        if let Some((bval, bvec)) = &request.reference_table {
            let table = require_table(table)?;
            self.reference_table(table, sel)?.save(bval, bvec)?;
        }
        if let Some((bval, bvec)) = &request.complement_table {
            let table = require_table(table)?;
            self.complement_table(table, sel)?.save(bval, bvec)?;
        }
        Ok(())
    }
}

fn require_table(table: Option<&GradientTable>) -> Result<&GradientTable> {
    table.ok_or_else(|| {
        Error::InvalidArgument("gradient outputs were requested without gradient inputs".to_string())
    })
}

/// Output paths for the independently requested split artifacts.
#[derive(Debug, Clone, Default)]
pub struct SplitRequest {
    pub reference: Option<PathBuf>,
    pub complement: Option<PathBuf>,
    /// `(bval, bvec)` for the reference entry.
    pub reference_table: Option<(PathBuf, PathBuf)>,
    /// `(bval, bvec)` for every other entry.
    pub complement_table: Option<(PathBuf, PathBuf)>,
}

impl SplitRequest {
    pub fn is_empty(&self) -> bool {
        self.reference.is_none()
            && self.complement.is_none()
            && self.reference_table.is_none()
            && self.complement_table.is_none()
    }
}
