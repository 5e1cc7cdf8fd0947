//! Susceptibility correction against a predicted undistorted reference.
//!
//! Used when no reverse phase-encoded acquisition exists. The reference b0 is
//! extracted, an ensemble predicts what it should look like without
//! distortion, a deformation confined to the phase-encoding axis is solved
//! between the two and every volume of the series is pushed through it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::common::{Direction, PhaseEncoding};
use crate::displacement::restrict_components;
use crate::engine::{axis_mask, IterationSchedule, RegistrationEngine, RegistrationMode};
use crate::ensemble::{run_ensemble, ModelLoader};
use crate::error::{ensure_exists, Error, Result};
use crate::gradient::{GradientTable, DEFAULT_B0_THRESHOLD};
use crate::interpolate::Interpolation;
use crate::series::SeriesRunner;
use crate::split::B0SplitEngine;
use crate::transform::{TransformChain, TransformHandle};
use crate::volume::{Volume, SHELL_AXIS};

#[derive(Debug, Clone)]
pub struct CorrectionConfig {
    pub phase_encoding: PhaseEncoding,
    pub threads: usize,
    pub schedule: IterationSchedule,
    pub shell_axis: usize,
    pub b0_threshold: f64,
    /// Overrides b-value based reference detection.
    pub reference_index: Option<i64>,
    pub interpolation: Interpolation,
    /// Warp on the b0 grid applied before the solved deformation, e.g. a motion field.
    pub secondary_warp: Option<TransformHandle>,
    /// Directory that receives the synthetic references and the deformation.
    pub keep_intermediates: Option<PathBuf>,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            phase_encoding: PhaseEncoding::Ap,
            threads: 1,
            schedule: IterationSchedule::default(),
            shell_axis: SHELL_AXIS,
            b0_threshold: DEFAULT_B0_THRESHOLD,
            reference_index: None,
            interpolation: Interpolation::Linear,
            secondary_warp: None,
            keep_intermediates: None,
            cancel: None,
        }
    }
}

/// What a finished correction used.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionOutcome {
    pub reference_index: usize,
    pub members: Vec<String>,
    pub skipped_members: usize,
    /// Largest off-axis displacement zeroed in the solved deformation.
    pub removed_off_axis: f64,
}

pub struct EnsembleCorrectionOrchestrator<'a> {
    engine: &'a dyn RegistrationEngine,
    loader: &'a dyn ModelLoader,
    config: CorrectionConfig,
}

impl<'a> EnsembleCorrectionOrchestrator<'a> {
    pub fn new(
        engine: &'a dyn RegistrationEngine,
        loader: &'a dyn ModelLoader,
        config: CorrectionConfig,
    ) -> Self {
        Self {
            engine,
            loader,
            config,
        }
    }

    pub fn config(&self) -> &CorrectionConfig {
        &self.config
    }

    fn check_cancel(&self) -> Result<()> {
        match &self.config.cancel {
            Some(flag) if flag.load(Ordering::SeqCst) => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }

    fn runner(&self) -> SeriesRunner {
        let runner = SeriesRunner::new(self.config.threads).with_shell_axis(self.config.shell_axis);
        match &self.config.cancel {
            Some(flag) => runner.with_cancel(Arc::clone(flag)),
            None => runner,
        }
    }

    /// Corrects `dwi` and writes the result to `output`.
    ///
    /// Nothing is written to `output` unless every volume succeeds. Scratch
    /// files are removed on every exit path.
    pub fn run(
        &self,
        dwi: &Path,
        table: Option<&GradientTable>,
        anatomical: &Path,
        output: &Path,
    ) -> Result<CorrectionOutcome> {
        ensure_exists(dwi)?;
        ensure_exists(anatomical)?;
        if let Some(secondary) = &self.config.secondary_warp {
            ensure_exists(secondary.path())?;
        }
        self.check_cancel()?;
        let scratch = tempfile::Builder::new().prefix("warpnii-").tempdir()?;
        let work = scratch.path();
        debug!("Scratch directory {}", work.display());

        info!("Step 1/5: extracting the reference volume");
        let series = Volume::load(dwi)?;
        let splitter = B0SplitEngine::new()
            .with_threshold(self.config.b0_threshold)
            .with_shell_axis(self.config.shell_axis);
        let selection = splitter.select(&series, table, self.config.reference_index)?;
        let b0 = work.join("reference_b0.nii.gz");
        splitter.reference_volume(&series, &selection)?.save(&b0)?;

        self.check_cancel()?;
        info!("Step 2/5: predicting the undistorted reference");
        let ensemble_dir = work.join("ensemble");
        std::fs::create_dir_all(&ensemble_dir)?;
        let ensemble = run_ensemble(self.loader, anatomical, &b0, &ensemble_dir)?;
        let synthetic = work.join("synthetic_reference.nii.gz");
        ensemble.synthetic.save(&synthetic)?;

        self.check_cancel()?;
        info!("Step 3/5: aligning the synthetic reference with the reference volume");
        let runner = self.runner();
        let alignment = self.engine.register(
            &synthetic,
            &b0,
            RegistrationMode::Affine,
            &work.join("b0_to_synthetic_"),
        )?;
        // the alignment pulls the b0 into the synthetic frame; its inverse
        // brings the synthetic onto the b0 grid, where the distortion lives
        let back_affine = self.engine.invert(&alignment.affine)?;
        let aligned = work.join("synthetic_aligned.nii.gz");
        TransformChain::from_list(vec![&back_affine])?.apply(
            self.engine,
            &synthetic,
            &b0,
            &aligned,
            Interpolation::Linear,
            &runner,
        )?;

        self.check_cancel()?;
        let axis = self.config.phase_encoding.axis();
        info!(
            "Step 4/5: solving the deformation along axis {axis} ({:?})",
            self.config.phase_encoding
        );
        let restricted = self.engine.register_restricted(
            &aligned,
            &b0,
            axis_mask(axis),
            &self.config.schedule,
            &work.join("restricted_"),
        )?;
        let (warp, removed_off_axis) =
            sanitize_warp(&restricted.warp, axis, &work.join("restricted_warp.nii.gz"))?;

        if let Some(dir) = &self.config.keep_intermediates {
            keep(dir, &[&synthetic, &aligned, warp.path(), &b0])?;
        }

        self.check_cancel()?;
        info!("Step 5/5: resampling the series");
        // image order: secondary warp, solved deformation, then into the synthetic frame
        let mut steps: Vec<&TransformHandle> = self.config.secondary_warp.iter().collect();
        steps.push(&warp);
        steps.push(&alignment.affine);
        let forward = TransformChain::from_list(steps)?;
        let back = TransformChain::from_list(vec![&back_affine])?;
        let (forward_ops, back_ops) = (forward.operator_order(), back.operator_order());
        let interpolation = self.config.interpolation;

        let correct = |src: &Path, mid: &Path, dst: &Path| -> Result<()> {
            self.engine
                .apply(src, &synthetic, &forward_ops, interpolation, mid)?;
            self.engine.apply(mid, &b0, &back_ops, interpolation, dst)
        };

        let series_dir = work.join("series");
        std::fs::create_dir_all(&series_dir)?;
        let corrected = if series.ndim() == 3 {
            let dst = series_dir.join("corrected.nii");
            correct(dwi, &series_dir.join("anatomical.nii"), &dst)?;
            Volume::load(&dst)?
        } else {
            runner.run(&series, &series_dir, |i, src, dst| {
                correct(src, &series_dir.join(format!("vol-{i:04}_anat.nii")), dst)
            })?
        };
        corrected.save(output)?;
        info!("Wrote corrected series to {}", output.display());

        Ok(CorrectionOutcome {
            reference_index: selection.index,
            members: ensemble.members,
            skipped_members: ensemble.skipped,
            removed_off_axis,
        })
    }
}

/// Writes a copy of `warp` with only the `axis` component left.
fn sanitize_warp(
    warp: &TransformHandle,
    axis: Direction,
    dest: &Path,
) -> Result<(TransformHandle, f64)> {
    let field = Volume::load(warp.path())?;
    let mut data = field.data().clone();
    let removed = restrict_components(&mut data, axis)?;
    if removed > 0.0 {
        warn!("Deformation had off-axis displacement up to {removed:.4} mm; zeroed");
    }
    field.with_data(data).save(dest)?;
    Ok((TransformHandle::warp(dest), removed))
}

fn keep(dir: &Path, files: &[&Path]) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    for file in files {
        if let Some(name) = file.file_name() {
            std::fs::copy(file, dir.join(name))?;
        }
    }
    info!("Kept intermediates in {}", dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine_file::AffineTransform;
    use crate::engine::{NativeEngine, Registration, RestrictedRegistration};
    use crate::ensemble::tests::ConstantLoader;
    use crate::error::ErrorKind;
    use nalgebra::{Matrix4, Vector3};
    use ndarray::{Array4, ArrayD, Axis, IxDyn};
    use std::sync::Mutex;

    fn suffixed(prefix: &Path, suffix: &str) -> PathBuf {
        let mut s = prefix.as_os_str().to_owned();
        s.push(suffix);
        PathBuf::from(s)
    }

    /// Solves with fixed answers and resamples in-process.
    struct ScriptedEngine {
        /// Written into every component of the restricted warp, in mm.
        displacement: f64,
        /// RAS point mapping written as the affine solution.
        alignment: Matrix4<f64>,
        /// Spatial shape of the fixed image and path of the moving image of the restricted solve.
        restricted: Mutex<Option<([usize; 3], PathBuf)>>,
    }

    impl ScriptedEngine {
        fn new(displacement: f64) -> Self {
            Self {
                displacement,
                alignment: Matrix4::identity(),
                restricted: Mutex::new(None),
            }
        }
    }

    impl RegistrationEngine for ScriptedEngine {
        fn register(
            &self,
            _fixed: &Path,
            _moving: &Path,
            _mode: RegistrationMode,
            output_prefix: &Path,
        ) -> Result<Registration> {
            let path = suffixed(output_prefix, "0GenericAffine.mat");
            AffineTransform::from_ras_matrix(&self.alignment).save(&path)?;
            let affine = TransformHandle::affine(path);
            Ok(Registration {
                inverse_affine: affine.toggled(),
                affine,
                warp: None,
                inverse_warp: None,
            })
        }

        fn register_restricted(
            &self,
            fixed: &Path,
            moving: &Path,
            _axis_mask: [f64; 3],
            _schedule: &IterationSchedule,
            output_prefix: &Path,
        ) -> Result<RestrictedRegistration> {
            let fixed = Volume::load(fixed)?;
            let [x, y, z] = fixed.spatial_shape();
            *self.restricted.lock().unwrap() = Some(([x, y, z], moving.to_path_buf()));
            let data = ArrayD::from_elem(IxDyn(&[x, y, z, 1, 3]), self.displacement);
            let field = Volume::from_array(data, &fixed.affine());
            let warp = suffixed(output_prefix, "0Warp.nii.gz");
            let inverse = suffixed(output_prefix, "0InverseWarp.nii.gz");
            field.save(&warp)?;
            field.save(&inverse)?;
            Ok(RestrictedRegistration {
                warp: TransformHandle::warp(warp),
                inverse_warp: TransformHandle::warp(inverse),
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
            NativeEngine::new().apply(moving, reference, transforms, interpolation, output)
        }

        fn invert(&self, transform: &TransformHandle) -> Result<TransformHandle> {
            NativeEngine::new().invert(transform)
        }
    }

    struct Inputs {
        dir: tempfile::TempDir,
        dwi: PathBuf,
        t1: PathBuf,
        table: GradientTable,
    }

    fn inputs() -> Inputs {
        inputs_with((4, 5, 3))
    }

    /// A linear ramp series with three volumes, the first unweighted.
    fn inputs_with((nx, ny, nz): (usize, usize, usize)) -> Inputs {
        let dir = tempfile::tempdir().unwrap();
        let data = Array4::from_shape_fn((nx, ny, nz, 3), |(x, y, z, t)| {
            (x + 2 * y + z) as f64 + 100.0 * t as f64
        });
        let dwi = dir.path().join("dwi.nii");
        Volume::from_array(data.into_dyn(), &Matrix4::identity())
            .save(&dwi)
            .unwrap();
        let t1 = dir.path().join("t1.nii");
        Volume::from_array(
            ndarray::Array3::<f64>::ones((nx, ny, nz)).into_dyn(),
            &Matrix4::identity(),
        )
        .save(&t1)
        .unwrap();
        let table = GradientTable::new(
            vec![0.0, 1000.0, 1000.0],
            vec![[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        )
        .unwrap();
        Inputs {
            dir,
            dwi,
            t1,
            table,
        }
    }

    fn loader(present: Vec<usize>) -> ConstantLoader {
        ConstantLoader {
            present,
            shape: (4, 5, 3),
        }
    }

    #[test]
    fn deformation_is_confined_to_phase_encoding_axis() {
        let inp = inputs();
        let kept = inp.dir.path().join("kept");
        let engine = ScriptedEngine::new(0.5);
        let models = loader(vec![1, 2, 3, 4, 5]);
        let config = CorrectionConfig {
            keep_intermediates: Some(kept.clone()),
            threads: 2,
            ..Default::default()
        };
        let output = inp.dir.path().join("corrected.nii");
        let outcome = EnsembleCorrectionOrchestrator::new(&engine, &models, config)
            .run(&inp.dwi, Some(&inp.table), &inp.t1, &output)
            .unwrap();

        assert_eq!(outcome.reference_index, 0);
        assert_eq!(outcome.skipped_members, 0);
        assert!((outcome.removed_off_axis - 0.5).abs() < 1e-6);

        let warp = Volume::load(&kept.join("restricted_warp.nii.gz")).unwrap();
        let data = warp.data();
        let last = Axis(data.ndim() - 1);
        assert!(data.index_axis(last, 0).iter().all(|&v| v == 0.0));
        assert!(data.index_axis(last, 2).iter().all(|&v| v == 0.0));
        assert!(data.index_axis(last, 1).iter().all(|&v| (v - 0.5).abs() < 1e-6));

        let corrected = Volume::load(&output).unwrap();
        assert_eq!(corrected.shape(), &[4, 5, 3, 3]);
    }

    #[test]
    fn zero_displacement_leaves_series_unchanged() {
        let inp = inputs();
        let engine = ScriptedEngine::new(0.0);
        let models = loader(vec![2, 4, 5]);
        let output = inp.dir.path().join("corrected.nii");
        let outcome = EnsembleCorrectionOrchestrator::new(&engine, &models, CorrectionConfig::default())
            .run(&inp.dwi, Some(&inp.table), &inp.t1, &output)
            .unwrap();
        assert_eq!(outcome.members.len(), 3);
        assert_eq!(outcome.skipped_members, 2);

        let original = Volume::load(&inp.dwi).unwrap();
        let corrected = Volume::load(&output).unwrap();
        for (a, b) in original.data().iter().zip(corrected.data().iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn deformation_is_solved_on_the_reference_grid() {
        // synthetic grid differs from the series grid and the alignment is a
        // 10 degree rotation about z through (4, 4, 1)
        let inp = inputs_with((9, 9, 3));
        let centre = Vector3::new(4.0, 4.0, 1.0);
        let rotation = Matrix4::new_rotation(Vector3::new(0.0, 0.0, 10f64.to_radians()));
        let engine = ScriptedEngine {
            alignment: Matrix4::new_translation(&centre)
                * rotation
                * Matrix4::new_translation(&-centre),
            ..ScriptedEngine::new(0.0)
        };
        let models = ConstantLoader {
            present: vec![1, 2],
            shape: (10, 10, 4),
        };
        let kept = inp.dir.path().join("kept");
        let config = CorrectionConfig {
            keep_intermediates: Some(kept.clone()),
            ..Default::default()
        };
        let output = inp.dir.path().join("corrected.nii");
        EnsembleCorrectionOrchestrator::new(&engine, &models, config)
            .run(&inp.dwi, Some(&inp.table), &inp.t1, &output)
            .unwrap();

        let (fixed_shape, moving) = engine.restricted.lock().unwrap().clone().unwrap();
        assert_eq!(fixed_shape, [9, 9, 3]);
        assert_eq!(moving.file_name().unwrap(), "reference_b0.nii.gz");
        let warp = Volume::load(&kept.join("restricted_warp.nii.gz")).unwrap();
        assert_eq!(warp.spatial_shape(), [9, 9, 3]);
        let aligned = Volume::load(&kept.join("synthetic_aligned.nii.gz")).unwrap();
        assert_eq!(aligned.spatial_shape(), [9, 9, 3]);

        // forward into the synthetic frame and back again is the identity
        let original = Volume::load(&inp.dwi).unwrap();
        let corrected = Volume::load(&output).unwrap();
        assert_eq!(corrected.shape(), &[9, 9, 3, 3]);
        for t in 0..3 {
            for x in 3..=5 {
                for y in 3..=5 {
                    let at = IxDyn(&[x, y, 1, t]);
                    assert!(
                        (original.data()[&at] - corrected.data()[&at]).abs() < 1e-6,
                        "voxel {x},{y},1 of volume {t}"
                    );
                }
            }
        }
    }

    #[test]
    fn empty_ensemble_writes_nothing() {
        let inp = inputs();
        let engine = ScriptedEngine::new(0.0);
        let models = loader(vec![]);
        let output = inp.dir.path().join("corrected.nii");
        let err = EnsembleCorrectionOrchestrator::new(&engine, &models, CorrectionConfig::default())
            .run(&inp.dwi, Some(&inp.table), &inp.t1, &output)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelUnavailable);
        assert!(!output.exists());
    }

    #[test]
    fn solver_failure_aborts() {
        let inp = inputs();
        let engine = NativeEngine::new();
        let models = loader(vec![1]);
        let output = inp.dir.path().join("corrected.nii");
        let err = EnsembleCorrectionOrchestrator::new(&engine, &models, CorrectionConfig::default())
            .run(&inp.dwi, Some(&inp.table), &inp.t1, &output)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RegistrationFailure);
        assert!(!output.exists());
    }

    #[test]
    fn cancelled_before_start() {
        let inp = inputs();
        let engine = ScriptedEngine::new(0.0);
        let models = loader(vec![1]);
        let config = CorrectionConfig {
            cancel: Some(Arc::new(AtomicBool::new(true))),
            ..Default::default()
        };
        let err = EnsembleCorrectionOrchestrator::new(&engine, &models, config)
            .run(&inp.dwi, Some(&inp.table), &inp.t1, &inp.dir.path().join("out.nii"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
