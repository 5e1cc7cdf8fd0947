//! Fixed-size worker pool that processes a 4D series one volume at a time.
//!
//! Each volume is written to a scratch file, handed to a per-volume job that
//! writes its result next to it, and the results are restacked by volume
//! index regardless of the order in which workers finish.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::common::Vol3D;
use crate::error::{Error, Result};
use crate::volume::{with_grid_of, Volume, SHELL_AXIS};

#[derive(Debug, Clone)]
pub struct SeriesRunner {
    threads: usize,
    shell_axis: usize,
    cancel: Option<Arc<AtomicBool>>,
}

impl Default for SeriesRunner {
    fn default() -> Self {
        Self {
            threads: 1,
            shell_axis: SHELL_AXIS,
            cancel: None,
        }
    }
}

impl SeriesRunner {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
            ..Self::default()
        }
    }

    pub fn with_shell_axis(mut self, shell_axis: usize) -> Self {
        self.shell_axis = shell_axis;
        self
    }

    /// Workers stop picking up new volumes once `flag` is set.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn shell_axis(&self) -> usize {
        self.shell_axis
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Runs `job(index, input, output)` for every volume of `series` and restacks the outputs.
    ///
    /// Any failing volume fails the whole series.
    pub fn run<F>(&self, series: &Volume, scratch: &Path, job: F) -> Result<Volume>
    where
        F: Fn(usize, &Path, &Path) -> Result<()> + Sync,
    {
        let vols = series.split(self.shell_axis)?;
        info!(
            "Processing {} volumes with {} worker(s)",
            vols.len(),
            self.threads
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .map_err(|e| Error::InvalidArgument(format!("could not build worker pool: {e}")))?;

        let outputs: Vec<Vol3D> = pool.install(|| {
            vols.into_par_iter()
                .map(|v| {
                    if self.cancelled() {
                        return Err(Error::Cancelled);
                    }
                    let (input, output) = scratch_paths(scratch, v.index);
                    series.with_data(v.vol.into_dyn()).save(&input)?;
                    job(v.index, &input, &output)?;
                    let done = Volume::load(&output)?;
                    debug!("Volume {} done", v.index);
                    Ok(Vol3D::new(done.as_array3()?.to_owned(), v.index))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        // outputs may sit on another grid; the series metadata is kept
        let template = Volume::load(&scratch_paths(scratch, 0).1)?;
        let header = with_grid_of(series.header(), template.header());
        Volume::stack(outputs, self.shell_axis, &header)
    }
}

fn scratch_paths(scratch: &Path, index: usize) -> (PathBuf, PathBuf) {
    (
        scratch.join(format!("vol-{index:04}.nii")),
        scratch.join(format!("vol-{index:04}_out.nii")),
    )
}
