//! Apply a displacement field along one axis to a 3D volume or 4D series.
//!
//! Each output voxel is pulled from the input at the voxel shifted by the
//! field along `--axis`. Shifts are in voxels unless `--scale` converts them.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use warpnii::cli::finish;
use warpnii::common::Direction;
use warpnii::displacement::{DisplacementField, DisplacementResampler};
use warpnii::logging::init_tracing;
use warpnii::volume::{Volume, SHELL_AXIS};
use warpnii::Result;

#[derive(Parser, Debug)]
#[command(author, about, version, long_about)]
struct Args {
    /// the nifti file to correct
    #[arg(short, long)]
    input: PathBuf,

    /// displacement field: a scalar volume or a 3-vector field
    #[arg(short, long)]
    field: PathBuf,

    /// an output name
    #[arg(short, long)]
    output: PathBuf,

    /// Number for the axis the displacement acts along:
    ///     0 -> X, 1 -> Y, 2 -> Z
    #[arg(short, long, default_value_t = 1)]
    axis: usize,

    /// multiplies the field, e.g. the total readout time for a fieldmap in Hz
    #[arg(long, default_value_t = 1.0, allow_hyphen_values = true)]
    scale: f64,

    /// drop the off-axis components of a vector field before applying it
    #[arg(long)]
    axis_only: bool,

    /// axis that indexes the volumes of a series
    #[arg(long, default_value_t = SHELL_AXIS)]
    shell_axis: usize,

    #[arg(short, long)]
    verbose: bool,
}

fn run(cli: Args) -> Result<()> {
    let axis = Direction::from_usize(cli.axis)?;
    let volume = Volume::load(&cli.input)?;
    let field = DisplacementField::from_volume(&Volume::load(&cli.field)?)?;
    let mut field = if cli.scale != 1.0 {
        info!("Scaling displacement by {}", cli.scale);
        field.scaled(cli.scale)
    } else {
        field
    };
    if cli.axis_only {
        let removed = field.restrict_to_axis(axis);
        info!("Restricted field to axis {axis}; removed up to {removed:.4} voxels");
    }
    let resampler = DisplacementResampler::new(axis).with_shell_axis(cli.shell_axis);
    let corrected = resampler.apply(&volume, &field)?;
    corrected.save(&cli.output)?;
    info!("Wrote {}", cli.output.display());
    Ok(())
}

fn main() {
    let cli = Args::parse();
    init_tracing(cli.verbose);
    finish(run(cli));
}
