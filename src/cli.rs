//! Arguments and plumbing shared by the command line tools.

use std::path::PathBuf;

use tracing::error;

use crate::engine::{AntsEngine, NativeEngine, RegistrationEngine};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EngineChoice {
    /// shell out to antsRegistration / antsApplyTransforms
    Ants,
    /// resample in-process, no registration solves
    Native,
}

#[derive(clap::Args, Debug, Clone)]
pub struct EngineArgs {
    /// the registration backend
    #[arg(long, value_enum, default_value_t = EngineChoice::Ants)]
    pub engine: EngineChoice,

    /// directory holding the ANTs executables (PATH is searched when unset)
    #[arg(long, env = "ANTSPATH")]
    pub ants_path: Option<PathBuf>,

    /// how many volumes to process at once
    #[arg(short, long, default_value_t = 1)]
    pub threads: usize,
}

impl EngineArgs {
    pub fn build(&self) -> Box<dyn RegistrationEngine> {
        match self.engine {
            EngineChoice::Ants => Box::new(AntsEngine::new(self.ants_path.clone(), self.threads)),
            EngineChoice::Native => Box::new(NativeEngine::new()),
        }
    }
}

/// Logs the error and exits with status 1.
pub fn finish(result: Result<()>) {
    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}
