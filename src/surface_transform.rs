//! Carry the vertices of a brain surface mesh from one anatomical space into another, using the
//! transforms of an ANTs registration.
//!
//! The registration maps space 2 onto space 1. To move a surface defined in space 1, its vertices
//! are passed through the inverse path: the inverse warp (displacement field) first, then the
//! inverted affine. Which stage comes first and which one is inverted is a fixed convention here.
//! Note that the vertex coordinates are used as stored in the mesh file. Meshes in a different
//! anatomical convention than the transforms (e.g., RAS+ versus LPS+) have to be converted by the caller.

use log::{debug, info};

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::gifti::{read_gifti, GiftiImage};
use crate::itk_transform::read_affine_transform;
use crate::transform::{AffineTransform, CompositeTransform, DisplacementFieldTransform, Transform};


/// The input and output files of a single mesh transformation.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshTransformJob {
    /// The GIfTI mesh in space 1.
    pub input: PathBuf,
    /// Where to write the GIfTI mesh in space 2.
    pub output: PathBuf,
    /// The affine component of the registration, e.g. `tfm_0GenericAffine.mat`.
    pub affine_transform: PathBuf,
    /// The inverse non-linear component of the registration, e.g. `tfm_1InverseWarp.nii.gz`.
    pub inverse_warp_transform: PathBuf,
}

impl MeshTransformJob {

    pub fn new<P: Into<PathBuf>>(input: P, output: P, affine_transform: P, inverse_warp_transform: P) -> MeshTransformJob {
        MeshTransformJob {
            input: input.into(),
            output: output.into(),
            affine_transform: affine_transform.into(),
            inverse_warp_transform: inverse_warp_transform.into(),
        }
    }

    pub fn run(&self) -> Result<()> {
        transform_mesh_between_spaces(&self.input, &self.output, &self.affine_transform, &self.inverse_warp_transform)
    }
}


/// Chain the inverse warp and the inverted affine: the warp is applied first, then the inverse of the affine.
pub fn compose_inverse_transform_chain(affine: &AffineTransform, inverse_warp: DisplacementFieldTransform) -> Result<CompositeTransform> {
    let inverse_affine = affine.inverse()?;
    Ok(CompositeTransform::new().then(inverse_warp).then(inverse_affine))
}


/// Load the affine and the inverse warp of a registration and chain them, see [`compose_inverse_transform_chain`].
pub fn load_inverse_transform_chain<P, Q>(affine_transform: P, inverse_warp_transform: Q) -> Result<CompositeTransform>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    let affine = read_affine_transform(&affine_transform)?;
    debug!("Affine transform from '{}': {:?}", affine_transform.as_ref().display(), affine);

    let inverse_warp = DisplacementFieldTransform::from_file(&inverse_warp_transform)?;
    debug!("Inverse warp from '{}' has {:?} voxels.", inverse_warp_transform.as_ref().display(), inverse_warp.shape());
    compose_inverse_transform_chain(&affine, inverse_warp)
}


/// Pass every vertex of the first data array through the transform. The number and order of the
/// vertices do not change, and all other data arrays are left alone. Returns the number of vertices.
pub fn transform_vertices<T>(image: &mut GiftiImage, transform: &T) -> Result<usize>
where
    T: Transform + ?Sized,
{
    let coords = image.coordinate_array_mut()?;
    let transformed: Vec<[f32; 3]> = coords.points()?
        .iter()
        .map(|p| {
            let q = transform.transform_point([p[0] as f64, p[1] as f64, p[2] as f64]);
            [q[0] as f32, q[1] as f32, q[2] as f32]
        })
        .collect();
    coords.set_points(&transformed)?;
    Ok(transformed.len())
}


/// Transform the vertices of the GIfTI mesh `input` from space 1 into space 2 and write the result to `output`.
///
/// All inputs are loaded and the output is fully serialized before the output file is created,
/// so the output file is not touched if anything fails.
pub fn transform_mesh_between_spaces<P1, P2, P3, P4>(input: P1, output: P2, affine_transform: P3, inverse_warp_transform: P4) -> Result<()>
where
    P1: AsRef<Path>,
    P2: AsRef<Path>,
    P3: AsRef<Path>,
    P4: AsRef<Path>,
{
    let mut surf = read_gifti(&input)?;
    let transform = load_inverse_transform_chain(&affine_transform, &inverse_warp_transform)?;
    let num_vertices = transform_vertices(&mut surf, &transform)?;
    surf.to_file(&output)?;

    info!("Transformed {} vertices of '{}' into '{}'.", num_vertices, input.as_ref().display(), output.as_ref().display());
    Ok(())
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::gifti::GiftiDataArray;
    use nalgebra::{Matrix3, Matrix4, Vector3};
    use ndarray::{Array4, Axis};

    fn single_vertex_mesh(p: [f32; 3]) -> GiftiImage {
        let mut image = GiftiImage::default();
        image.data_arrays.push(GiftiDataArray::from_points(&[p]));
        image
    }

    #[test]
    fn the_translation_scenario_moves_the_origin() {
        let warp = DisplacementFieldTransform::zeros([4, 4, 4], &Matrix4::identity()).unwrap();
        let chain = compose_inverse_transform_chain(&AffineTransform::from_translation([1.0, 2.0, 3.0]), warp).unwrap();
        assert_eq!(2, chain.len());

        let mut image = single_vertex_mesh([0.0, 0.0, 0.0]);
        assert_eq!(1, transform_vertices(&mut image, &chain).unwrap());
        assert_eq!(vec![[-1.0, -2.0, -3.0]], image.data_arrays[0].points().unwrap());
    }

    #[test]
    fn vertices_are_transformed_independently_of_their_order() {
        let affine = AffineTransform::from_itk_parameters(&[0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 2.0, 5.0, 0.0, -1.0], &[1.0, 1.0, 1.0]).unwrap();
        let points = [[1.0, 2.0, 3.0], [-4.0, 0.5, 8.0], [10.0, -10.0, 0.0]];

        let mut forward = GiftiImage::default();
        forward.data_arrays.push(GiftiDataArray::from_points(&points));
        let mut reversed = GiftiImage::default();
        reversed.data_arrays.push(GiftiDataArray::from_points(&[points[2], points[1], points[0]]));

        transform_vertices(&mut forward, &affine).unwrap();
        transform_vertices(&mut reversed, &affine).unwrap();
        let mut back = reversed.data_arrays[0].points().unwrap();
        back.reverse();
        assert_eq!(forward.data_arrays[0].points().unwrap(), back);
    }

    #[test]
    fn swapping_the_stages_changes_the_result() {
        let mut shift = Array4::zeros((5, 5, 5, 3));
        shift.index_axis_mut(Axis(3), 0).fill(1.0);
        let warp = DisplacementFieldTransform::new(shift, &Matrix4::identity()).unwrap();
        let scale = AffineTransform::new(Matrix3::from_diagonal_element(2.0), Vector3::zeros(), Vector3::zeros());

        let chained = compose_inverse_transform_chain(&scale, warp.clone()).unwrap();
        let swapped = CompositeTransform::new().then(scale.inverse().unwrap()).then(warp);

        // warp first: (2 + 1) / 2, inverted affine first: 2 / 2 + 1
        assert_eq!([1.5, 1.0, 1.0], chained.transform_point([2.0, 2.0, 2.0]));
        assert_eq!([2.0, 1.0, 1.0], swapped.transform_point([2.0, 2.0, 2.0]));
    }

    #[test]
    fn a_singular_affine_cannot_be_chained() {
        let flat = AffineTransform::new(Matrix3::zeros(), Vector3::zeros(), Vector3::zeros());
        let warp = DisplacementFieldTransform::zeros([2, 2, 2], &Matrix4::identity()).unwrap();
        assert!(compose_inverse_transform_chain(&flat, warp).is_err());
    }

    #[test]
    fn a_mesh_without_coordinates_is_rejected() {
        let mut image = GiftiImage::default();
        image.data_arrays.push(GiftiDataArray::from_triangles(&[[0, 1, 2]]));
        assert!(transform_vertices(&mut image, &AffineTransform::identity()).is_err());
    }

    #[test]
    fn a_job_holds_its_paths() {
        let job = MeshTransformJob::new("in.surf.gii", "out.surf.gii", "tfm_0GenericAffine.mat", "tfm_1InverseWarp.nii.gz");
        assert_eq!(PathBuf::from("tfm_1InverseWarp.nii.gz"), job.inverse_warp_transform);
    }
}
