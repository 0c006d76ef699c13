use quick_error::quick_error;
use std::io::Error as IOError;

quick_error! {
    /// Error type for all error variants originated by this crate.
    #[derive(Debug)]
    pub enum SurfwarpError {
        /// Invalid GIfTI file: broken XML structure or inconsistent data array.
        InvalidGiftiFormat(msg: String) {
            display("Invalid GIfTI file: {}", msg)
        }

        UnsupportedGiftiEncoding(name: String) {
            display("Unsupported GIfTI data array encoding '{}'", name)
        }

        UnsupportedGiftiDatatype(name: String) {
            display("Unsupported GIfTI data array datatype '{}'", name)
        }

        /// The first data array of a mesh does not hold 3-component float coordinates.
        NotACoordinateArray(msg: String) {
            display("First GIfTI data array is not a coordinate array: {}", msg)
        }

        InvalidNiftiFormat(msg: String) {
            display("Invalid NIfTI file: {}", msg)
        }

        UnsupportedNiftiDatatype(code: i16) {
            display("Unsupported NIfTI datatype code {}", code)
        }

        /// The volume does not store a 3-vector per voxel.
        NotADisplacementField(msg: String) {
            display("Image is not a 3D displacement field: {}", msg)
        }

        InvalidTransformFormat(msg: String) {
            display("Invalid ITK transform file: {}", msg)
        }

        UnsupportedTransformType(name: String) {
            display("Unsupported ITK transform type '{}'", name)
        }

        /// The affine matrix has no computable inverse.
        SingularAffine {
            display("Affine transform matrix is singular and cannot be inverted")
        }

        Xml(err: quick_xml::Error) {
            from()
            display("XML error: {}", err)
            source(err)
        }

        Base64(err: base64::DecodeError) {
            from()
            display("Base64 decoding error: {}", err)
            source(err)
        }

        Shape(err: ndarray::ShapeError) {
            from()
            display("Array shape error: {}", err)
            source(err)
        }

        /// I/O Error
        Io(err: IOError) {
            from()
            display("I/O error: {}", err)
            source(err)
        }
    }
}

/// Alias type for results originated from this crate.
pub type Result<T> = ::std::result::Result<T, SurfwarpError>;
