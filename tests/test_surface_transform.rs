use approx::assert_abs_diff_eq;
use nalgebra::Matrix4;
use ndarray::{ArrayD, IxDyn};
use tempfile::{tempdir, TempDir};

use std::path::PathBuf;

use surfwarp::gifti::GiftiData;
use surfwarp::{read_gifti, transform_mesh_between_spaces, write_itk_transform_txt, AffineTransform, MeshTransformJob, NiftiImage};

const SURF_FILE: &str = "resources/surf/tiny.surf.gii";
const AFFINE_TFM_FILE: &str = "resources/transforms/translate_1_2_3.tfm";
const AFFINE_MAT_FILE: &str = "resources/transforms/tfm_0GenericAffine.mat";
const ZERO_WARP_FILE: &str = "resources/transforms/zero_warp.nii.gz";

const TINY_POINTS: [[f32; 3]; 4] = [[0.0, 0.0, 0.0], [1.0, 2.0, 3.0], [-4.5, 0.25, 10.0], [12.0, -7.0, 3.5]];


fn assert_points_eq(expected: &[[f32; 3]], actual: &[[f32; 3]]) {
    assert_eq!(expected.len(), actual.len());
    for (e, a) in expected.iter().zip(actual.iter()) {
        for c in 0..3 {
            assert_abs_diff_eq!(e[c], a[c], epsilon = 1e-4);
        }
    }
}

/// A warp which shifts every point inside its grid by `shift`. The grid covers [-20, 20] mm along all axes.
fn write_uniform_warp(dir: &TempDir, shift: [f32; 3]) -> PathBuf {
    let data = ArrayD::from_shape_fn(IxDyn(&[11, 11, 11, 1, 3]), |idx| shift[idx[4]]);
    let mut ras = Matrix4::from_diagonal_element(4.0);
    ras[(3, 3)] = 1.0;
    ras[(0, 3)] = -20.0;
    ras[(1, 3)] = -20.0;
    ras[(2, 3)] = -20.0;
    let path = dir.path().join("uniform_1InverseWarp.nii.gz");
    NiftiImage::new(data, &ras).unwrap().to_file(&path).unwrap();
    path
}


#[test]
fn the_demo_mesh_is_moved_by_the_inverted_affine() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("moved.surf.gii");

    transform_mesh_between_spaces(SURF_FILE, &output, AFFINE_TFM_FILE, ZERO_WARP_FILE).unwrap();

    let moved = read_gifti(&output).unwrap();
    let expected: Vec<[f32; 3]> = TINY_POINTS.iter().map(|p| [p[0] - 1.0, p[1] - 2.0, p[2] - 3.0]).collect();
    assert_points_eq(&expected, &moved.data_arrays[0].points().unwrap());
}


#[test]
fn everything_but_the_coordinates_is_kept() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("moved.surf.gii");

    transform_mesh_between_spaces(SURF_FILE, &output, AFFINE_TFM_FILE, ZERO_WARP_FILE).unwrap();

    let original = read_gifti(SURF_FILE).unwrap();
    let moved = read_gifti(&output).unwrap();
    assert_eq!(original.data_arrays.len(), moved.data_arrays.len());
    assert_eq!(original.metadata, moved.metadata);
    assert_eq!(original.data_arrays[1], moved.data_arrays[1]);
    assert_eq!(GiftiData::Int32(vec![0, 1, 2, 0, 1, 3, 0, 2, 3, 1, 2, 3]), moved.data_arrays[1].data);

    let coords = &moved.data_arrays[0];
    assert_eq!(original.data_arrays[0].encoding, coords.encoding);
    assert_eq!(original.data_arrays[0].metadata, coords.metadata);
    assert_eq!(original.data_arrays[0].coord_systems, coords.coord_systems);
    assert_eq!(vec![4, 3], coords.dims);
}


#[test]
fn text_and_matlab_affines_give_the_same_mesh() {
    let dir = tempdir().unwrap();
    let from_tfm = dir.path().join("from_tfm.surf.gii");
    let from_mat = dir.path().join("from_mat.surf.gii");

    transform_mesh_between_spaces(SURF_FILE, &from_tfm, AFFINE_TFM_FILE, ZERO_WARP_FILE).unwrap();
    transform_mesh_between_spaces(SURF_FILE, &from_mat, AFFINE_MAT_FILE, ZERO_WARP_FILE).unwrap();

    assert_points_eq(&read_gifti(&from_tfm).unwrap().data_arrays[0].points().unwrap(), &read_gifti(&from_mat).unwrap().data_arrays[0].points().unwrap());
}


#[test]
fn the_warp_is_applied_before_the_inverted_affine() {
    let dir = tempdir().unwrap();
    let warp = write_uniform_warp(&dir, [0.5, -0.25, 2.0]);
    // Scaling by 2 and shifting by (1, 2, 3): a constant warp does not commute with it.
    let affine = dir.path().join("scale_2.tfm");
    let scale = AffineTransform::from_itk_parameters(&[2.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 2.0, 1.0, 2.0, 3.0], &[0.0, 0.0, 0.0]).unwrap();
    write_itk_transform_txt(&scale, &affine).unwrap();
    let output = dir.path().join("moved.surf.gii");

    let job = MeshTransformJob::new(PathBuf::from(SURF_FILE), output.clone(), affine, warp);
    job.run().unwrap();

    let expected: Vec<[f32; 3]> = TINY_POINTS.iter().map(|p| [(p[0] + 0.5 - 1.0) / 2.0, (p[1] - 0.25 - 2.0) / 2.0, (p[2] + 2.0 - 3.0) / 2.0]).collect();
    let moved = read_gifti(&output).unwrap().data_arrays[0].points().unwrap();
    assert_points_eq(&expected, &moved);

    let affine_first: Vec<[f32; 3]> = TINY_POINTS.iter().map(|p| [(p[0] - 1.0) / 2.0 + 0.5, (p[1] - 2.0) / 2.0 - 0.25, (p[2] - 3.0) / 2.0 + 2.0]).collect();
    assert!((affine_first[0][0] - moved[0][0]).abs() > 0.1);
}


#[test]
fn an_identity_registration_does_not_move_the_mesh() {
    let dir = tempdir().unwrap();
    let affine = dir.path().join("identity.tfm");
    write_itk_transform_txt(&AffineTransform::identity(), &affine).unwrap();
    let output = dir.path().join("same.surf.gii");

    transform_mesh_between_spaces(SURF_FILE, &output, &affine, ZERO_WARP_FILE).unwrap();

    assert_points_eq(&TINY_POINTS, &read_gifti(&output).unwrap().data_arrays[0].points().unwrap());
}


#[test]
fn a_malformed_affine_leaves_no_output() {
    let dir = tempdir().unwrap();
    let affine = dir.path().join("broken.tfm");
    std::fs::write(&affine, "#Insight Transform File V1.0\nTransform: AffineTransform_double_3_3\nParameters: 1 0 0\n").unwrap();
    let output = dir.path().join("never.surf.gii");

    assert!(transform_mesh_between_spaces(SURF_FILE, &output, &affine, ZERO_WARP_FILE).is_err());
    assert!(!output.exists());
}


#[test]
fn a_singular_affine_leaves_no_output() {
    let dir = tempdir().unwrap();
    let affine = dir.path().join("flat.tfm");
    std::fs::write(&affine, "#Insight Transform File V1.0\n#Transform 0\nTransform: AffineTransform_double_3_3\nParameters: 1 0 0 0 1 0 0 0 0 0 0 0\nFixedParameters: 0 0 0\n").unwrap();
    let output = dir.path().join("never.surf.gii");

    assert!(transform_mesh_between_spaces(SURF_FILE, &output, &affine, ZERO_WARP_FILE).is_err());
    assert!(!output.exists());
}


#[test]
fn missing_inputs_leave_no_output() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("never.surf.gii");

    assert!(transform_mesh_between_spaces("resources/surf/no_such.surf.gii", &output, AFFINE_TFM_FILE, ZERO_WARP_FILE).is_err());
    assert!(transform_mesh_between_spaces(SURF_FILE, &output, AFFINE_TFM_FILE, "resources/transforms/no_such_warp.nii.gz").is_err());
    assert!(!output.exists());
}


#[test]
fn a_warp_that_is_not_a_vector_image_is_rejected() {
    let dir = tempdir().unwrap();
    let scalar = dir.path().join("scalar.nii");
    NiftiImage::new(ArrayD::zeros(IxDyn(&[3, 3, 3])), &Matrix4::identity()).unwrap().to_file(&scalar).unwrap();
    let output = dir.path().join("never.surf.gii");

    assert!(transform_mesh_between_spaces(SURF_FILE, &output, AFFINE_TFM_FILE, &scalar).is_err());
    assert!(!output.exists());
}
