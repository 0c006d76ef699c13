//! Spatial transforms mapping physical points between anatomical spaces.
//!
//! Points are given in physical coordinates in the ITK convention (LPS+, millimeters), which is
//! the space ANTs registrations are computed in.

use approx::abs_diff_eq;
use log::debug;
use nalgebra::{Matrix3, Matrix4, Vector3};
use ndarray::{Array4, Axis, Ix4};

use std::fmt;
use std::path::Path;

use crate::error::{Result, SurfwarpError};
use crate::nifti::{read_nifti, NiftiImage};

/// Determinants with a magnitude below this value are treated as zero.
pub const SINGULAR_DETERMINANT_EPSILON: f64 = 1e-12;


/// A mapping of 3D points from one physical space into another.
pub trait Transform {
    fn transform_point(&self, point: [f64; 3]) -> [f64; 3];
}


/// Convert a voxel-to-world matrix from the NIfTI (RAS+) into the ITK (LPS+) convention.
pub fn ras_to_lps(voxel_to_world: &Matrix4<f64>) -> Matrix4<f64> {
    Matrix4::from_diagonal(&nalgebra::Vector4::new(-1.0, -1.0, 1.0, 1.0)) * voxel_to_world
}


/// Affine transform with a fixed center, as used by ITK:
/// T(x) = A(x - c) + t + c
#[derive(Debug, Clone, PartialEq)]
pub struct AffineTransform {
    matrix: Matrix3<f64>,
    translation: Vector3<f64>,
    center: Vector3<f64>,
}

impl AffineTransform {

    pub fn new(matrix: Matrix3<f64>, translation: Vector3<f64>, center: Vector3<f64>) -> AffineTransform {
        AffineTransform { matrix, translation, center }
    }

    pub fn identity() -> AffineTransform {
        AffineTransform::new(Matrix3::identity(), Vector3::zeros(), Vector3::zeros())
    }

    /// A pure translation by `t`.
    pub fn from_translation(t: [f64; 3]) -> AffineTransform {
        AffineTransform::new(Matrix3::identity(), Vector3::from(t), Vector3::zeros())
    }

    /// Build the transform from an ITK parameter vector (9 matrix values in row-major order,
    /// followed by 3 translation values) and the fixed parameters (the center, may be empty).
    pub fn from_itk_parameters(params: &[f64], fixed: &[f64]) -> Result<AffineTransform> {
        if params.len() != 12 {
            return Err(SurfwarpError::InvalidTransformFormat(format!("affine transform needs 12 parameters, got {}", params.len())));
        }
        let center = match fixed.len() {
            0 => Vector3::zeros(),
            3 => Vector3::new(fixed[0], fixed[1], fixed[2]),
            n => return Err(SurfwarpError::InvalidTransformFormat(format!("affine transform needs 3 fixed parameters, got {}", n))),
        };
        let matrix = Matrix3::from_row_slice(&params[0..9]);
        let translation = Vector3::new(params[9], params[10], params[11]);
        Ok(AffineTransform::new(matrix, translation, center))
    }

    /// The ITK parameter vector, see [`AffineTransform::from_itk_parameters`].
    pub fn itk_parameters(&self) -> Vec<f64> {
        let mut params = Vec::with_capacity(12);
        for row in 0..3 {
            for col in 0..3 {
                params.push(self.matrix[(row, col)]);
            }
        }
        params.extend(self.translation.iter());
        params
    }

    /// The ITK fixed parameters, i.e., the center.
    pub fn itk_fixed_parameters(&self) -> Vec<f64> {
        self.center.iter().copied().collect()
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    pub fn center(&self) -> &Vector3<f64> {
        &self.center
    }

    /// The offset o in T(x) = Ax + o.
    pub fn offset(&self) -> Vector3<f64> {
        self.translation + self.center - self.matrix * self.center
    }

    /// Compute the inverse transform, which keeps the center.
    pub fn inverse(&self) -> Result<AffineTransform> {
        let det = self.matrix.determinant();
        if abs_diff_eq!(det, 0.0, epsilon = SINGULAR_DETERMINANT_EPSILON) || !det.is_finite() {
            return Err(SurfwarpError::SingularAffine);
        }
        let inv = self.matrix.try_inverse().ok_or(SurfwarpError::SingularAffine)?;
        let inv_offset = -(inv * self.offset());
        let translation = inv_offset - self.center + inv * self.center;
        Ok(AffineTransform::new(inv, translation, self.center))
    }
}

impl Transform for AffineTransform {
    fn transform_point(&self, point: [f64; 3]) -> [f64; 3] {
        let p = self.matrix * Vector3::from(point) + self.offset();
        [p.x, p.y, p.z]
    }
}


/// A dense displacement field: T(x) = x + d(x), with d trilinearly interpolated between the voxel
/// centers. Points outside the field's buffer are not moved.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplacementFieldTransform {
    field: Array4<f64>,
    index_to_physical: Matrix3<f64>,
    physical_to_index: Matrix3<f64>,
    origin: Vector3<f64>,
}

impl DisplacementFieldTransform {

    /// Create a field transform from displacement vectors with shape `(nx, ny, nz, 3)` and the voxel-to-physical (LPS+) matrix.
    pub fn new(field: Array4<f64>, voxel_to_physical: &Matrix4<f64>) -> Result<DisplacementFieldTransform> {
        if field.shape()[3] != 3 {
            return Err(SurfwarpError::NotADisplacementField(format!("expected 3 components per voxel, got {}", field.shape()[3])));
        }
        if field.shape()[..3].iter().any(|&n| n == 0) {
            return Err(SurfwarpError::NotADisplacementField(String::from("the field has no voxels")));
        }
        let index_to_physical: Matrix3<f64> = voxel_to_physical.fixed_view::<3, 3>(0, 0).into_owned();
        let physical_to_index = index_to_physical.try_inverse()
            .ok_or_else(|| SurfwarpError::NotADisplacementField(String::from("the voxel-to-world matrix is singular")))?;
        let origin = Vector3::new(voxel_to_physical[(0, 3)], voxel_to_physical[(1, 3)], voxel_to_physical[(2, 3)]);
        Ok(DisplacementFieldTransform { field, index_to_physical, physical_to_index, origin })
    }

    /// Create a field transform from a NIfTI vector image, as written by ANTs.
    /// The voxel grid is converted to LPS+, the displacement vectors are used as stored.
    pub fn from_nifti(image: &NiftiImage) -> Result<DisplacementFieldTransform> {
        let shape = image.data.shape().to_vec();
        let data = image.data.mapv(|v| v as f64);
        let field = match shape.len() {
            5 if shape[3] == 1 && shape[4] == 3 => data.index_axis_move(Axis(3), 0),
            4 if shape[3] == 3 => data,
            _ => return Err(SurfwarpError::NotADisplacementField(format!("image shape {:?} does not hold a 3-vector per voxel", shape))),
        };
        let field = field.into_dimensionality::<Ix4>()?;
        debug!("Displacement field has {}x{}x{} voxels.", field.shape()[0], field.shape()[1], field.shape()[2]);
        DisplacementFieldTransform::new(field, &ras_to_lps(&image.voxel_to_world()))
    }

    /// Read a displacement field from a NIfTI file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<DisplacementFieldTransform> {
        DisplacementFieldTransform::from_nifti(&read_nifti(path)?)
    }

    /// A field which does not move any point.
    pub fn zeros(shape: [usize; 3], voxel_to_physical: &Matrix4<f64>) -> Result<DisplacementFieldTransform> {
        DisplacementFieldTransform::new(Array4::zeros((shape[0], shape[1], shape[2], 3)), voxel_to_physical)
    }

    /// Number of voxels along each axis.
    pub fn shape(&self) -> [usize; 3] {
        let s = self.field.shape();
        [s[0], s[1], s[2]]
    }

    pub fn field(&self) -> &Array4<f64> {
        &self.field
    }

    /// The voxel-to-physical (LPS+) matrix of the field's grid.
    pub fn voxel_to_physical(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.index_to_physical);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.origin);
        m
    }

    /// Map a physical point to a continuous voxel index.
    pub fn continuous_index(&self, point: [f64; 3]) -> [f64; 3] {
        let ci = self.physical_to_index * (Vector3::from(point) - self.origin);
        [ci.x, ci.y, ci.z]
    }

    /// The interpolated displacement at a physical point, or `None` if the point lies outside the buffer.
    pub fn displacement(&self, point: [f64; 3]) -> Option<[f64; 3]> {
        let ci = self.continuous_index(point);
        let shape = self.shape();

        let mut base = [0i64; 3];
        let mut frac = [0.0f64; 3];
        for axis in 0..3 {
            let upper = shape[axis] as f64 - 0.5;
            if !(ci[axis] >= -0.5 && ci[axis] <= upper) {
                return None;
            }
            let floor = ci[axis].floor();
            base[axis] = floor as i64;
            frac[axis] = ci[axis] - floor;
        }

        let mut result = [0.0; 3];
        for corner in 0..8usize {
            let mut weight = 1.0;
            let mut idx = [0usize; 3];
            for axis in 0..3 {
                let upper = (corner >> axis) & 1 == 1;
                weight *= if upper { frac[axis] } else { 1.0 - frac[axis] };
                let i = base[axis] + upper as i64;
                idx[axis] = i.max(0).min(shape[axis] as i64 - 1) as usize;
            }
            if weight == 0.0 {
                continue;
            }
            for (c, r) in result.iter_mut().enumerate() {
                *r += weight * self.field[[idx[0], idx[1], idx[2], c]];
            }
        }
        Some(result)
    }
}

impl Transform for DisplacementFieldTransform {
    fn transform_point(&self, point: [f64; 3]) -> [f64; 3] {
        match self.displacement(point) {
            Some(d) => [point[0] + d[0], point[1] + d[1], point[2] + d[2]],
            None => point,
        }
    }
}


/// An ordered chain of transforms. The stages are applied in the order they were added.
#[derive(Default)]
pub struct CompositeTransform {
    stages: Vec<Box<dyn Transform>>,
}

impl CompositeTransform {

    pub fn new() -> CompositeTransform {
        CompositeTransform { stages: Vec::new() }
    }

    /// Append a stage, which is applied after all previously added ones.
    pub fn push<T: Transform + 'static>(&mut self, stage: T) {
        self.stages.push(Box::new(stage));
    }

    /// Builder variant of [`CompositeTransform::push`].
    pub fn then<T: Transform + 'static>(mut self, stage: T) -> CompositeTransform {
        self.push(stage);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Transform for CompositeTransform {
    fn transform_point(&self, point: [f64; 3]) -> [f64; 3] {
        self.stages.iter().fold(point, |p, stage| stage.transform_point(p))
    }
}

impl fmt::Debug for CompositeTransform {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CompositeTransform with {} stages", self.stages.len())
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn assert_point_eq(expected: [f64; 3], actual: [f64; 3]) {
        for axis in 0..3 {
            assert_abs_diff_eq!(expected[axis], actual[axis], epsilon = 1e-9);
        }
    }

    fn grid(spacing: f64, origin: [f64; 3]) -> Matrix4<f64> {
        Matrix4::new(
            spacing, 0.0, 0.0, origin[0],
            0.0, spacing, 0.0, origin[1],
            0.0, 0.0, spacing, origin[2],
            0.0, 0.0, 0.0, 1.0,
        )
    }

    #[test]
    fn itk_parameters_use_the_center() {
        // 90 degree rotation around z, centered at (1, 0, 0), plus a translation along z.
        let params = [0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 5.0];
        let t = AffineTransform::from_itk_parameters(&params, &[1.0, 0.0, 0.0]).unwrap();
        assert_point_eq([1.0, 1.0, 5.0], t.transform_point([2.0, 0.0, 0.0]));
        assert_point_eq([1.0, 0.0, 5.0], t.transform_point([1.0, 0.0, 0.0]));
        assert_eq!(params.to_vec(), t.itk_parameters());
        assert_eq!(vec![1.0, 0.0, 0.0], t.itk_fixed_parameters());
    }

    #[test]
    fn the_inverse_undoes_the_transform() {
        let params = [1.1, 0.2, 0.0, -0.1, 0.9, 0.3, 0.05, 0.0, 1.2, 3.0, -2.0, 7.5];
        let t = AffineTransform::from_itk_parameters(&params, &[10.0, -4.0, 2.0]).unwrap();
        let inv = t.inverse().unwrap();
        assert_eq!(t.center(), inv.center());

        let p = [12.5, -33.0, 8.25];
        assert_point_eq(p, inv.transform_point(t.transform_point(p)));
        assert_point_eq(p, t.transform_point(inv.transform_point(p)));
    }

    #[test]
    fn the_inverse_translation_is_negated() {
        let inv = AffineTransform::from_translation([1.0, 2.0, 3.0]).inverse().unwrap();
        assert_point_eq([-1.0, -2.0, -3.0], inv.transform_point([0.0, 0.0, 0.0]));
    }

    #[test]
    fn singular_matrices_cannot_be_inverted() {
        let params = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let t = AffineTransform::from_itk_parameters(&params, &[]).unwrap();
        assert!(matches!(t.inverse(), Err(SurfwarpError::SingularAffine)));
    }

    #[test]
    fn wrong_parameter_counts_are_rejected() {
        assert!(AffineTransform::from_itk_parameters(&[1.0; 9], &[]).is_err());
        assert!(AffineTransform::from_itk_parameters(&[1.0; 12], &[0.0, 0.0]).is_err());
    }

    #[test]
    fn a_constant_field_shifts_points_inside_the_buffer() {
        let mut field = Array4::zeros((4, 4, 4, 3));
        for v in field.index_axis_mut(Axis(3), 1).iter_mut() {
            *v = 2.5;
        }
        let t = DisplacementFieldTransform::new(field, &grid(2.0, [-3.0, -3.0, -3.0])).unwrap();

        assert_point_eq([0.0, 2.5, 0.0], t.transform_point([0.0, 0.0, 0.0]));
        // The buffer ends half a voxel behind the last voxel center at 3.0.
        assert_point_eq([3.9, 2.5, 0.0], t.transform_point([3.9, 0.0, 0.0]));
        assert_point_eq([4.1, 0.0, 0.0], t.transform_point([4.1, 0.0, 0.0]));
        assert!(t.displacement([0.0, -4.5, 0.0]).is_none());
    }

    #[test]
    fn displacements_are_interpolated_trilinearly() {
        let mut field = Array4::zeros((2, 2, 2, 3));
        field[[1, 0, 0, 0]] = 1.0;
        field[[1, 1, 1, 2]] = 8.0;
        let t = DisplacementFieldTransform::new(field, &grid(1.0, [0.0, 0.0, 0.0])).unwrap();

        let d = t.displacement([0.5, 0.5, 0.5]).unwrap();
        assert_point_eq([0.5 * 0.25, 0.0, 8.0 / 8.0], d);
        let d = t.displacement([1.0, 0.0, 0.0]).unwrap();
        assert_point_eq([1.0, 0.0, 0.0], d);
        // Beyond the last voxel center, the edge value is used.
        let d = t.displacement([1.4, 0.0, 0.0]).unwrap();
        assert_point_eq([1.0, 0.0, 0.0], d);
    }

    #[test]
    fn nifti_grids_are_converted_to_lps() {
        let data = ndarray::ArrayD::zeros(ndarray::IxDyn(&[3, 3, 3, 1, 3]));
        let image = NiftiImage::new(data, &grid(1.0, [10.0, 20.0, 30.0])).unwrap();
        let t = DisplacementFieldTransform::from_nifti(&image).unwrap();
        assert_eq!([3, 3, 3], t.shape());

        // RAS (10, 20, 30) is LPS (-10, -20, 30), the center of voxel (0, 0, 0).
        assert_point_eq([0.0, 0.0, 0.0], t.continuous_index([-10.0, -20.0, 30.0]));
        assert_point_eq([1.0, 2.0, 0.0], t.continuous_index([-11.0, -22.0, 30.0]));
    }

    #[test]
    fn scalar_images_are_not_displacement_fields() {
        let data = ndarray::ArrayD::zeros(ndarray::IxDyn(&[3, 3, 3]));
        let image = NiftiImage::new(data, &grid(1.0, [0.0; 3])).unwrap();
        assert!(matches!(DisplacementFieldTransform::from_nifti(&image), Err(SurfwarpError::NotADisplacementField(_))));
    }

    #[test]
    fn composite_stages_run_in_insertion_order() {
        let scale = AffineTransform::new(Matrix3::identity() * 2.0, Vector3::zeros(), Vector3::zeros());
        let shift = AffineTransform::from_translation([1.0, 0.0, 0.0]);

        let scale_then_shift = CompositeTransform::new().then(scale.clone()).then(shift.clone());
        let shift_then_scale = CompositeTransform::new().then(shift).then(scale);

        assert_eq!(2, scale_then_shift.len());
        assert_point_eq([3.0, 0.0, 0.0], scale_then_shift.transform_point([1.0, 0.0, 0.0]));
        assert_point_eq([4.0, 0.0, 0.0], shift_then_scale.transform_point([1.0, 0.0, 0.0]));
    }

    #[test]
    fn an_empty_composite_is_the_identity() {
        let t = CompositeTransform::default();
        assert!(t.is_empty());
        assert_point_eq([1.0, 2.0, 3.0], t.transform_point([1.0, 2.0, 3.0]));
    }
}
