//! Ensemble prediction of a synthetic undistorted reference.
//!
//! Each member is an independently trained model run through a narrow
//! interface. Members that cannot be loaded or run are skipped; the
//! surviving candidates are averaged voxel by voxel.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use glob::{glob, Pattern};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{ensure_exists, Error, Result};
use crate::volume::Volume;

/// Number of folds a full ensemble is trained with.
pub const ENSEMBLE_SIZE: usize = 5;

pub trait PredictionModel: Send + Sync {
    fn name(&self) -> &str;

    /// Predicts one synthetic reference candidate; `scratch` is private to this call.
    fn predict(&self, anatomical: &Path, distorted_reference: &Path, scratch: &Path) -> Result<Volume>;
}

pub trait ModelLoader: Sync {
    /// How many members a complete ensemble has.
    fn expected(&self) -> usize;

    /// Loads member `fold` (1-based) or fails with [`Error::ModelUnavailable`].
    fn load(&self, fold: usize) -> Result<Box<dyn PredictionModel>>;
}

/// Discovers fold artifacts (`*fold_<n>*`) in a directory and runs each
/// through an external inference program.
#[derive(Debug, Clone)]
pub struct DirectoryModelLoader {
    dir: PathBuf,
    program: PathBuf,
    expected: usize,
}

impl DirectoryModelLoader {
    pub fn new(dir: impl Into<PathBuf>, program: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            program: program.into(),
            expected: ENSEMBLE_SIZE,
        }
    }

    pub fn with_expected(mut self, expected: usize) -> Self {
        self.expected = expected;
        self
    }

    fn find(&self, fold: usize) -> Result<Option<PathBuf>> {
        let tag = format!("fold_{fold}");
        let pattern = format!(
            "{}/*{tag}*",
            Pattern::escape(&self.dir.to_string_lossy())
        );
        let mut paths: Vec<PathBuf> = glob(&pattern)
            .map_err(|e| Error::InvalidArgument(format!("bad model pattern {pattern}: {e}")))?
            .filter_map(|entry| entry.ok())
            .filter(|p| names_fold(p, &tag))
            .collect();
        paths.sort();
        Ok(paths.into_iter().next())
    }
}

/// `fold_1` must not match `fold_12`.
fn names_fold(path: &Path, tag: &str) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.match_indices(tag).any(|(i, _)| {
        !name[i + tag.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
    })
}

impl ModelLoader for DirectoryModelLoader {
    fn expected(&self) -> usize {
        self.expected
    }

    fn load(&self, fold: usize) -> Result<Box<dyn PredictionModel>> {
        ensure_exists(&self.dir)?;
        let artifact = self.find(fold)?.ok_or_else(|| {
            Error::ModelUnavailable(format!(
                "no artifact for fold {fold} in {}",
                self.dir.display()
            ))
        })?;
        debug!("Fold {fold} uses {}", artifact.display());
        Ok(Box::new(ExternalModel {
            name: format!("fold_{fold}"),
            program: self.program.clone(),
            artifact,
        }))
    }
}

/// A model executed as
/// `<program> --model <artifact> --anatomical <t1> --reference <b0> --output <out>`.
#[derive(Debug, Clone)]
pub struct ExternalModel {
    name: String,
    program: PathBuf,
    artifact: PathBuf,
}

impl PredictionModel for ExternalModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, anatomical: &Path, distorted_reference: &Path, scratch: &Path) -> Result<Volume> {
        let output = scratch.join(format!("{}_prediction.nii.gz", self.name));
        let result = Command::new(&self.program)
            .arg("--model")
            .arg(&self.artifact)
            .arg("--anatomical")
            .arg(anatomical)
            .arg("--reference")
            .arg(distorted_reference)
            .arg("--output")
            .arg(&output)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| {
                Error::ModelUnavailable(format!(
                    "could not start {}: {e}",
                    self.program.display()
                ))
            })?;
        if !result.status.success() {
            return Err(Error::ModelUnavailable(format!(
                "{} failed ({}): {}",
                self.name,
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }
        Volume::load(&output)
    }
}

/// The averaged prediction and which members contributed to it.
#[derive(Debug)]
pub struct EnsembleOutcome {
    pub synthetic: Volume,
    pub members: Vec<String>,
    pub skipped: usize,
}

/// Runs every member in parallel and averages the candidates that succeed.
pub fn run_ensemble(
    loader: &dyn ModelLoader,
    anatomical: &Path,
    distorted_reference: &Path,
    scratch: &Path,
) -> Result<EnsembleOutcome> {
    ensure_exists(anatomical)?;
    ensure_exists(distorted_reference)?;
    let expected = loader.expected();
    let results: Vec<(usize, Result<(String, Volume)>)> = (1..=expected)
        .into_par_iter()
        .map(|fold| {
            let outcome = (|| {
                let model = loader.load(fold)?;
                let member_scratch = scratch.join(format!("fold_{fold}"));
                std::fs::create_dir_all(&member_scratch)?;
                let candidate = model.predict(anatomical, distorted_reference, &member_scratch)?;
                Ok((model.name().to_string(), candidate))
            })();
            (fold, outcome)
        })
        .collect();

    let mut members = Vec::new();
    let mut candidates = Vec::new();
    for (fold, result) in results {
        match result {
            Ok((name, candidate)) => {
                members.push(name);
                candidates.push(candidate);
            }
            Err(e) => warn!("Skipping ensemble member {fold}: {e}"),
        }
    }
    if candidates.is_empty() {
        return Err(Error::ModelUnavailable(format!(
            "none of the {expected} ensemble members produced a prediction"
        )));
    }
    let skipped = expected - candidates.len();
    if skipped > 0 {
        warn!(
            "Ensemble running with {} of {} members",
            candidates.len(),
            expected
        );
    } else {
        info!("All {expected} ensemble members produced a prediction");
    }

    Ok(EnsembleOutcome {
        synthetic: average(&candidates)?,
        members,
        skipped,
    })
}

/// Voxel-wise mean; the first candidate's header is kept.
pub fn average(candidates: &[Volume]) -> Result<Volume> {
    let first = candidates
        .first()
        .ok_or_else(|| Error::ModelUnavailable("no candidates to average".to_string()))?;
    let mut sum = first.data().clone();
    for c in &candidates[1..] {
        if c.shape() != first.shape() {
            return Err(Error::ShapeMismatch(format!(
                "ensemble candidate shape {:?} differs from {:?}",
                c.shape(),
                first.shape()
            )));
        }
        sum += c.data();
    }
    Ok(first.with_data(sum / candidates.len() as f64))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use nalgebra::Matrix4;
    use ndarray::Array3;

    /// Predicts a constant volume; absent folds fail to load.
    pub(crate) struct ConstantLoader {
        pub present: Vec<usize>,
        pub shape: (usize, usize, usize),
    }

    struct ConstantModel {
        name: String,
        value: f64,
        shape: (usize, usize, usize),
    }

    impl PredictionModel for ConstantModel {
        fn name(&self) -> &str {
            &self.name
        }

        fn predict(&self, _: &Path, _: &Path, _: &Path) -> Result<Volume> {
            let data = Array3::from_elem(self.shape, self.value).into_dyn();
            Ok(Volume::from_array(data, &Matrix4::identity()))
        }
    }

    impl ModelLoader for ConstantLoader {
        fn expected(&self) -> usize {
            ENSEMBLE_SIZE
        }

        fn load(&self, fold: usize) -> Result<Box<dyn PredictionModel>> {
            if !self.present.contains(&fold) {
                return Err(Error::ModelUnavailable(format!("fold {fold} missing")));
            }
            Ok(Box::new(ConstantModel {
                name: format!("fold_{fold}"),
                value: fold as f64,
                shape: self.shape,
            }))
        }
    }

    fn inputs(dir: &Path) -> (PathBuf, PathBuf) {
        let t1 = dir.join("t1.nii");
        let b0 = dir.join("b0.nii");
        for p in [&t1, &b0] {
            Volume::from_array(Array3::<f64>::zeros((2, 2, 2)).into_dyn(), &Matrix4::identity())
                .save(p)
                .unwrap();
        }
        (t1, b0)
    }

    #[test]
    fn degraded_ensemble_averages_available_members() {
        let dir = tempfile::tempdir().unwrap();
        let (t1, b0) = inputs(dir.path());
        let loader = ConstantLoader {
            present: vec![1, 3, 5],
            shape: (2, 2, 2),
        };
        let outcome = run_ensemble(&loader, &t1, &b0, dir.path()).unwrap();
        assert_eq!(outcome.members, vec!["fold_1", "fold_3", "fold_5"]);
        assert_eq!(outcome.skipped, 2);
        assert!(outcome.synthetic.data().iter().all(|&v| (v - 3.0).abs() < 1e-12));
    }

    #[test]
    fn empty_ensemble_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (t1, b0) = inputs(dir.path());
        let loader = ConstantLoader {
            present: vec![],
            shape: (2, 2, 2),
        };
        let err = run_ensemble(&loader, &t1, &b0, dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelUnavailable);
    }

    #[test]
    fn average_rejects_mismatched_candidates() {
        let a = Volume::from_array(Array3::<f64>::zeros((2, 2, 2)).into_dyn(), &Matrix4::identity());
        let b = Volume::from_array(Array3::<f64>::zeros((2, 3, 2)).into_dyn(), &Matrix4::identity());
        assert_eq!(average(&[a, b]).unwrap_err().kind(), ErrorKind::ShapeMismatch);
    }

    #[test]
    fn directory_loader_finds_folds_by_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("net_fold_1_of_5.pth"), b"").unwrap();
        std::fs::write(dir.path().join("net_fold_3_of_5.pth"), b"").unwrap();
        std::fs::write(dir.path().join("net_fold_12_of_20.pth"), b"").unwrap();
        let loader = DirectoryModelLoader::new(dir.path(), "infer");

        assert_eq!(loader.load(1).unwrap().name(), "fold_1");
        assert!(loader.load(3).is_ok());
        assert_eq!(
            loader.load(2).err().map(|e| e.kind()),
            Some(ErrorKind::ModelUnavailable)
        );
        // fold_12 must not satisfy fold 1 or fold 2
        assert_eq!(loader.find(1).unwrap().unwrap().file_name().unwrap(), "net_fold_1_of_5.pth");
    }
}
