//! Split a diffusion series into its reference (b0) volume and the rest.
//!
//! Every output is optional and written only when asked for. Without an
//! explicit `--index` the first volume with a b-value at or below
//! `--threshold` is used.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use warpnii::cli::finish;
use warpnii::gradient::{GradientTable, DEFAULT_B0_THRESHOLD};
use warpnii::logging::init_tracing;
use warpnii::split::{B0SplitEngine, SplitRequest};
use warpnii::volume::{Volume, SHELL_AXIS};
use warpnii::{Error, Result};

#[derive(Parser, Debug)]
#[command(author, about, version, long_about)]
struct Args {
    /// the diffusion series (4D) or a pre-extracted reference (3D)
    #[arg(short, long)]
    input: PathBuf,

    /// b-value file, one value per volume
    #[arg(long, requires = "bvec")]
    bval: Option<PathBuf>,

    /// b-vector file, three rows of per-volume components
    #[arg(long, requires = "bval")]
    bvec: Option<PathBuf>,

    /// explicit reference index; negative values count from the end
    #[arg(long, allow_hyphen_values = true)]
    index: Option<i64>,

    /// largest b-value still treated as unweighted
    #[arg(long, default_value_t = DEFAULT_B0_THRESHOLD)]
    threshold: f64,

    /// where to write the reference volume
    #[arg(long)]
    reference: Option<PathBuf>,

    /// where to write the series without the reference volume
    #[arg(long)]
    complement: Option<PathBuf>,

    /// b-value and b-vector files for the reference entry
    #[arg(long, num_args = 2, value_names = ["BVAL", "BVEC"])]
    reference_table: Option<Vec<PathBuf>>,

    /// b-value and b-vector files for every other entry
    #[arg(long, num_args = 2, value_names = ["BVAL", "BVEC"])]
    complement_table: Option<Vec<PathBuf>>,

    /// axis that indexes the volumes of the series
    #[arg(long, default_value_t = SHELL_AXIS)]
    shell_axis: usize,

    #[arg(short, long)]
    verbose: bool,
}

fn pair(paths: Option<Vec<PathBuf>>) -> Option<(PathBuf, PathBuf)> {
    match paths?.as_slice() {
        [bval, bvec] => Some((bval.clone(), bvec.clone())),
        _ => None,
    }
}

fn run(cli: Args) -> Result<()> {
    let request = SplitRequest {
        reference: cli.reference,
        complement: cli.complement,
        reference_table: pair(cli.reference_table),
        complement_table: pair(cli.complement_table),
    };
    if request.is_empty() {
        return Err(Error::InvalidArgument(
            "nothing to write; pass at least one output".to_string(),
        ));
    }

    let volume = Volume::load(&cli.input)?;
    let table = match (&cli.bval, &cli.bvec) {
        (Some(bval), Some(bvec)) => Some(GradientTable::load(bval, bvec)?),
        _ => None,
    };
    let engine = B0SplitEngine::new()
        .with_threshold(cli.threshold)
        .with_shell_axis(cli.shell_axis);
    let selection = engine.select(&volume, table.as_ref(), cli.index)?;
    info!("Reference is volume {} ({:?})", selection.index, selection.source);
    engine.write(&volume, table.as_ref(), &selection, &request)
}

fn main() {
    let cli = Args::parse();
    init_tracing(cli.verbose);
    finish(run(cli));
}
