//! Adapter that shells out to the ANTs command line tools.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info};

use super::{
    axis_mask_string, IterationSchedule, Registration, RegistrationEngine, RegistrationMode,
    RestrictedRegistration,
};
use crate::error::{ensure_exists, Error, Result};
use crate::interpolate::Interpolation;
use crate::transform::{TransformHandle, TransformKind};

#[derive(Debug, Clone)]
pub struct AntsEngine {
    bin_dir: Option<PathBuf>,
    threads: usize,
}

impl Default for AntsEngine {
    fn default() -> Self {
        Self {
            bin_dir: None,
            threads: 1,
        }
    }
}

impl AntsEngine {
    /// `bin_dir` holds the ANTs executables; `None` searches `PATH`.
    pub fn new(bin_dir: Option<PathBuf>, threads: usize) -> Self {
        Self {
            bin_dir,
            threads: threads.max(1),
        }
    }

    fn command(&self, program: &str) -> Command {
        let exe = match &self.bin_dir {
            Some(dir) => dir.join(program),
            None => PathBuf::from(program),
        };
        let mut cmd = Command::new(exe);
        cmd.env(
            "ITK_GLOBAL_DEFAULT_NUMBER_OF_THREADS",
            self.threads.to_string(),
        )
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
        cmd
    }

    fn run(&self, mut cmd: Command, fail: fn(String) -> Error) -> Result<()> {
        debug!("Running {:?}", cmd);
        let output = cmd
            .output()
            .map_err(|e| fail(format!("could not start {:?}: {e}", cmd.get_program())))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let message = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        Err(fail(format!(
            "{:?} exited with {}: {message}",
            cmd.get_program(),
            output.status
        )))
    }
}

fn stage(args: &mut Vec<OsString>, transform: &str, metric: String, schedule: &IterationSchedule) {
    args.extend(
        [
            "--transform".to_string(),
            transform.to_string(),
            "--metric".to_string(),
            metric,
            "--convergence".to_string(),
            format!("[{schedule},1e-6,10]"),
            "--shrink-factors".to_string(),
            schedule.shrink_factors(),
            "--smoothing-sigmas".to_string(),
            schedule.smoothing_sigmas(),
        ]
        .map(OsString::from),
    );
}

fn common_args(output_prefix: &Path) -> Vec<OsString> {
    [
        "--dimensionality".to_string(),
        "3".to_string(),
        "--float".to_string(),
        "0".to_string(),
        "--output".to_string(),
        prefix_arg(output_prefix),
        "--interpolation".to_string(),
        "Linear".to_string(),
    ]
    .map(OsString::from)
    .to_vec()
}

/// `antsRegistration` arguments for a rigid, affine or affine + SyN solve.
fn registration_args(
    fixed: &Path,
    moving: &Path,
    mode: RegistrationMode,
    output_prefix: &Path,
) -> Result<Vec<OsString>> {
    let (f, m) = (fixed.display(), moving.display());
    let linear = IterationSchedule::new(vec![1000, 500, 250, 100])?;
    let mut args = common_args(output_prefix);
    args.extend(
        [
            "--winsorize-image-intensities".to_string(),
            "[0.005,0.995]".to_string(),
            "--use-histogram-matching".to_string(),
            "0".to_string(),
            "--initial-moving-transform".to_string(),
            format!("[{f},{m},1]"),
        ]
        .map(OsString::from),
    );

    let mi = format!("MI[{f},{m},1,32,Regular,0.25]");
    stage(&mut args, "Rigid[0.1]", mi.clone(), &linear);
    if matches!(mode, RegistrationMode::Affine | RegistrationMode::Syn) {
        stage(&mut args, "Affine[0.1]", mi, &linear);
    }
    if mode == RegistrationMode::Syn {
        stage(
            &mut args,
            "SyN[0.1,3,0]",
            format!("CC[{f},{m},1,4]"),
            &IterationSchedule::default(),
        );
    }
    Ok(args)
}

/// `antsRegistration` arguments for a SyN solve confined by `axis_mask`.
fn restricted_args(
    fixed: &Path,
    moving: &Path,
    axis_mask: [f64; 3],
    schedule: &IterationSchedule,
    output_prefix: &Path,
) -> Vec<OsString> {
    let mut args = common_args(output_prefix);
    args.push("--restrict-deformation".into());
    args.push(axis_mask_string(axis_mask).into());
    stage(
        &mut args,
        "SyN[0.1,3,0]",
        format!("CC[{},{},1,4]", fixed.display(), moving.display()),
        schedule,
    );
    args
}

/// `antsApplyTransforms` arguments; `transforms` is passed through in operator order.
fn apply_args(
    moving: &Path,
    reference: &Path,
    transforms: &[&TransformHandle],
    interpolation: Interpolation,
    output: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--dimensionality".into(),
        "3".into(),
        "--input".into(),
        moving.into(),
        "--reference-image".into(),
        reference.into(),
        "--output".into(),
        output.into(),
        "--interpolation".into(),
        interpolation.ants_token().into(),
    ];
    for t in transforms {
        args.push("--transform".into());
        args.push(t.to_string().into());
    }
    args
}

fn prefix_arg(prefix: &Path) -> String {
    format!("[{}]", prefix.display())
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut s = prefix.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

fn require(path: PathBuf, fail: fn(String) -> Error) -> Result<PathBuf> {
    if path.exists() {
        Ok(path)
    } else {
        Err(fail(format!("expected output {} was not written", path.display())))
    }
}

impl RegistrationEngine for AntsEngine {
    fn register(
        &self,
        fixed: &Path,
        moving: &Path,
        mode: RegistrationMode,
        output_prefix: &Path,
    ) -> Result<Registration> {
        ensure_exists(fixed)?;
        ensure_exists(moving)?;
        info!(
            "Registering {} to {} ({:?})",
            moving.display(),
            fixed.display(),
            mode
        );
        let args = registration_args(fixed, moving, mode, output_prefix)?;
        let mut cmd = self.command("antsRegistration");
        cmd.args(args);
        self.run(cmd, Error::RegistrationFailure)?;

        let affine = TransformHandle::affine(require(
            with_suffix(output_prefix, "0GenericAffine.mat"),
            Error::RegistrationFailure,
        )?);
        let inverse_affine = self.invert(&affine)?;
        let (warp, inverse_warp) = if mode == RegistrationMode::Syn {
            (
                Some(TransformHandle::warp(require(
                    with_suffix(output_prefix, "1Warp.nii.gz"),
                    Error::RegistrationFailure,
                )?)),
                Some(TransformHandle::warp(require(
                    with_suffix(output_prefix, "1InverseWarp.nii.gz"),
                    Error::RegistrationFailure,
                )?)),
            )
        } else {
            (None, None)
        };
        Ok(Registration {
            affine,
            warp,
            inverse_affine,
            inverse_warp,
        })
    }

    fn register_restricted(
        &self,
        fixed: &Path,
        moving: &Path,
        axis_mask: [f64; 3],
        schedule: &IterationSchedule,
        output_prefix: &Path,
    ) -> Result<RestrictedRegistration> {
        ensure_exists(fixed)?;
        ensure_exists(moving)?;
        info!(
            "Restricted registration of {} to {} (mask {}, schedule {schedule})",
            moving.display(),
            fixed.display(),
            axis_mask_string(axis_mask)
        );
        let args = restricted_args(fixed, moving, axis_mask, schedule, output_prefix);
        let mut cmd = self.command("antsRegistration");
        cmd.args(args);
        self.run(cmd, Error::RegistrationFailure)?;

        Ok(RestrictedRegistration {
            warp: TransformHandle::warp(require(
                with_suffix(output_prefix, "0Warp.nii.gz"),
                Error::RegistrationFailure,
            )?),
            inverse_warp: TransformHandle::warp(require(
                with_suffix(output_prefix, "0InverseWarp.nii.gz"),
                Error::RegistrationFailure,
            )?),
        })
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
        let mut cmd = self.command("antsApplyTransforms");
        cmd.args(apply_args(moving, reference, transforms, interpolation, output));
        self.run(cmd, Error::ResamplingFailure)?;
        require(output.to_path_buf(), Error::ResamplingFailure)?;
        Ok(())
    }

    fn invert(&self, transform: &TransformHandle) -> Result<TransformHandle> {
        match transform.kind() {
            TransformKind::Affine => Ok(transform.toggled()),
            TransformKind::Warp => Err(Error::RegistrationFailure(format!(
                "{} is a displacement field; use the inverse warp written by registration",
                transform.path().display()
            ))),
        }
    }
}
