//! Move brain surface meshes between anatomical spaces using the transforms of an ANTs registration.
//!
//! The focus of this package is on GIfTI surface meshes, ITK/ANTs affine transforms (text `.tfm` and
//! MATLAB `.mat` files) and displacement field warps stored in NIfTI-1 files.

pub mod error;
pub mod gifti;
pub mod itk_transform;
pub mod nifti;
pub mod surface_transform;
pub mod transform;
pub mod util;

pub use error::{Result, SurfwarpError};
pub use gifti::{read_gifti, write_gifti, GiftiDataArray, GiftiImage};
pub use itk_transform::{read_affine_transform, read_itk_transforms, write_itk_transform_mat, write_itk_transform_txt, ItkTransformEntry};
pub use nifti::{read_nifti, NiftiHeader, NiftiImage};
pub use surface_transform::{load_inverse_transform_chain, transform_mesh_between_spaces, transform_vertices, MeshTransformJob};
pub use transform::{AffineTransform, CompositeTransform, DisplacementFieldTransform, Transform};
