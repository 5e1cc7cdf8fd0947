//! Distortion-correct a diffusion series without a reverse phase-encoded scan.
//!
//! An ensemble of trained models predicts an undistorted reference from the
//! T1 and the distorted b0. A deformation confined to the phase-encoding
//! axis is solved against it and applied to every volume of the series.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use warpnii::cli::{finish, EngineArgs};
use warpnii::common::PhaseEncoding;
use warpnii::correction::{CorrectionConfig, EnsembleCorrectionOrchestrator};
use warpnii::engine::IterationSchedule;
use warpnii::ensemble::{DirectoryModelLoader, ENSEMBLE_SIZE};
use warpnii::gradient::{GradientTable, DEFAULT_B0_THRESHOLD};
use warpnii::interpolate::Interpolation;
use warpnii::logging::init_tracing;
use warpnii::transform::TransformHandle;
use warpnii::volume::SHELL_AXIS;
use warpnii::Result;

#[derive(Parser, Debug)]
#[command(author, about, version, long_about)]
struct Args {
    /// the distorted diffusion series
    #[arg(short, long)]
    dwi: PathBuf,

    /// b-value file, one value per volume
    #[arg(long, requires = "bvec")]
    bval: Option<PathBuf>,

    /// b-vector file, three rows of per-volume components
    #[arg(long, requires = "bval")]
    bvec: Option<PathBuf>,

    /// T1-weighted anatomical image of the same subject
    #[arg(long)]
    t1: PathBuf,

    /// directory holding one artifact per fold (`*fold_<n>*`)
    #[arg(long)]
    model_dir: PathBuf,

    /// program that runs one model: `--model --anatomical --reference --output`
    #[arg(long)]
    inference: PathBuf,

    /// number of folds in a complete ensemble
    #[arg(long, default_value_t = ENSEMBLE_SIZE)]
    folds: usize,

    /// phase-encoding direction of the diffusion acquisition
    #[arg(short, long, value_enum)]
    phase_encoding: PhaseEncoding,

    /// iterations per resolution level of the deformable solve
    #[arg(long, default_value = "100x70x50x20")]
    schedule: String,

    /// explicit reference index; negative values count from the end
    #[arg(long, allow_hyphen_values = true)]
    index: Option<i64>,

    /// largest b-value still treated as unweighted
    #[arg(long, default_value_t = DEFAULT_B0_THRESHOLD)]
    threshold: f64,

    /// extra warp on the b0 grid, applied before the solved deformation
    #[arg(long)]
    secondary_warp: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Interpolation::Linear)]
    interpolation: Interpolation,

    /// copy the synthetic reference and deformation here
    #[arg(long)]
    keep_intermediates: Option<PathBuf>,

    /// where to write the corrected series
    #[arg(short, long)]
    output: PathBuf,

    #[command(flatten)]
    engine: EngineArgs,

    #[arg(short, long)]
    verbose: bool,
}

fn run(cli: Args) -> Result<()> {
    let engine = cli.engine.build();
    let loader = DirectoryModelLoader::new(&cli.model_dir, &cli.inference).with_expected(cli.folds);
    let table = match (&cli.bval, &cli.bvec) {
        (Some(bval), Some(bvec)) => Some(GradientTable::load(bval, bvec)?),
        _ => None,
    };
    let config = CorrectionConfig {
        phase_encoding: cli.phase_encoding,
        threads: cli.engine.threads,
        schedule: cli.schedule.parse::<IterationSchedule>()?,
        shell_axis: SHELL_AXIS,
        b0_threshold: cli.threshold,
        reference_index: cli.index,
        interpolation: cli.interpolation,
        secondary_warp: cli.secondary_warp.map(TransformHandle::warp),
        keep_intermediates: cli.keep_intermediates,
        cancel: None,
    };
    let orchestrator = EnsembleCorrectionOrchestrator::new(engine.as_ref(), &loader, config);
    let outcome = orchestrator.run(&cli.dwi, table.as_ref(), &cli.t1, &cli.output)?;
    info!(
        "Corrected with reference volume {} and {} ensemble member(s)",
        outcome.reference_index,
        outcome.members.len()
    );
    Ok(())
}

fn main() {
    let cli = Args::parse();
    init_tracing(cli.verbose);
    finish(run(cli));
}
