use std::path::Path;

use nalgebra::Matrix4;
use ndarray::{Array3, Array4, Axis};

use warpnii::affine_file::AffineTransform;
use warpnii::common::Direction;
use warpnii::displacement::{DisplacementField, DisplacementResampler};
use warpnii::engine::NativeEngine;
use warpnii::gradient::GradientTable;
use warpnii::interpolate::Interpolation;
use warpnii::series::SeriesRunner;
use warpnii::split::{B0SplitEngine, SplitRequest};
use warpnii::transform::{NamedTransforms, TransformChain, TransformHandle};
use warpnii::volume::Volume;
use warpnii::ErrorKind;

fn write_series(path: &Path, shells: usize) -> Volume {
    let data = Array4::from_shape_fn((5, 6, 4, shells), |(x, y, z, t)| {
        (x * 7 + y * 3 + z) as f64 + 50.0 * t as f64
    });
    let mut affine = Matrix4::identity();
    affine[(0, 0)] = 2.0;
    affine[(1, 1)] = 2.0;
    affine[(2, 2)] = 2.5;
    affine[(0, 3)] = -5.0;
    let vol = Volume::from_array(data.into_dyn(), &affine);
    vol.save(path).unwrap();
    vol
}

#[test]
fn split_files_and_restack() {
    let dir = tempfile::tempdir().unwrap();
    let dwi = dir.path().join("dwi.nii.gz");
    let original = write_series(&dwi, 4);
    let (bval, bvec) = (dir.path().join("dwi.bval"), dir.path().join("dwi.bvec"));
    GradientTable::new(
        vec![5.0, 1000.0, 1000.0, 2000.0],
        vec![[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
    )
    .unwrap()
    .save(&bval, &bvec)
    .unwrap();

    let table = GradientTable::load(&bval, &bvec).unwrap();
    let volume = Volume::load(&dwi).unwrap();
    let engine = B0SplitEngine::new();
    let selection = engine.select(&volume, Some(&table), None).unwrap();
    assert_eq!(selection.index, 0);

    let request = SplitRequest {
        reference: Some(dir.path().join("b0.nii.gz")),
        complement: Some(dir.path().join("dwi_rest.nii.gz")),
        reference_table: Some((dir.path().join("b0.bval"), dir.path().join("b0.bvec"))),
        complement_table: Some((dir.path().join("rest.bval"), dir.path().join("rest.bvec"))),
    };
    engine.write(&volume, Some(&table), &selection, &request).unwrap();

    let b0 = Volume::load(&dir.path().join("b0.nii.gz")).unwrap();
    let rest = Volume::load(&dir.path().join("dwi_rest.nii.gz")).unwrap();
    assert_eq!(b0.shape(), &[5, 6, 4]);
    assert_eq!(rest.shape(), &[5, 6, 4, 3]);

    let mut views = vec![b0.data().view()];
    views.extend(rest.data().axis_iter(Axis(3)));
    let restacked = ndarray::stack(Axis(3), &views).unwrap();
    assert_eq!(restacked, *original.data());

    let rest_table = GradientTable::load(
        &dir.path().join("rest.bval"),
        &dir.path().join("rest.bvec"),
    )
    .unwrap();
    assert_eq!(rest_table.bvals(), &[1000.0, 1000.0, 2000.0]);
}

#[test]
fn identity_chain_preserves_series() {
    let dir = tempfile::tempdir().unwrap();
    let dwi = dir.path().join("dwi.nii");
    let original = write_series(&dwi, 3);
    let mut header = original.header().clone();
    header.pixdim[4] = 2.5;
    let original = Volume::new(original.into_data(), header);
    original.save(&dwi).unwrap();
    let affine_path = dir.path().join("identity.txt");
    AffineTransform::identity().save(&affine_path).unwrap();

    let affine = TransformHandle::affine(&affine_path);
    let chain = TransformChain::from_named(NamedTransforms {
        affine: Some(&affine),
        ..Default::default()
    })
    .unwrap();
    let output = dir.path().join("out.nii");
    chain
        .apply(
            &NativeEngine::new(),
            &dwi,
            &dwi,
            &output,
            Interpolation::Linear,
            &SeriesRunner::new(2),
        )
        .unwrap();

    let out = Volume::load(&output).unwrap();
    assert_eq!(out.shape(), original.shape());
    assert_eq!(out.header().pixdim[4], 2.5);
    for (a, b) in original.data().iter().zip(out.data().iter()) {
        assert!((a - b).abs() < 1e-6);
    }
}

#[test]
fn oversized_field_is_truncated_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let dwi = dir.path().join("dwi.nii");
    let original = write_series(&dwi, 2);

    let field_path = dir.path().join("field.nii");
    Volume::from_array(Array3::<f64>::zeros((5, 7, 4)).into_dyn(), &Matrix4::identity())
        .save(&field_path)
        .unwrap();
    let field = DisplacementField::from_volume(&Volume::load(&field_path).unwrap()).unwrap();
    let corrected = DisplacementResampler::new(Direction::Y)
        .apply(&Volume::load(&dwi).unwrap(), &field)
        .unwrap();
    assert_eq!(corrected.data(), original.data());

    let wrong = DisplacementField::from_volume(&Volume::from_array(
        Array3::<f64>::zeros((6, 6, 4)).into_dyn(),
        &Matrix4::identity(),
    ))
    .unwrap();
    let err = DisplacementResampler::new(Direction::Y)
        .apply(&original, &wrong)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
}

#[test]
fn missing_input_is_reported_by_path() {
    let dir = tempfile::tempdir().unwrap();
    let err = Volume::load(&dir.path().join("absent.nii")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InputNotFound);
    assert!(err.to_string().contains("absent.nii"));
}
