//! Functions for reading and writing volumes in single-file NIfTI-1 ('.nii' and '.nii.gz') files.
//!
//! ANTs stores the non-linear part of a registration as a NIfTI image with a 3-vector per voxel:
//! five dimensions `(nx, ny, nz, 1, 3)`, where the last one holds the displacement components.


use byteordered::{ByteOrdered, Endianness};
use log::debug;
use nalgebra::{Matrix4, Vector3};
use ndarray::{ArrayD, IxDyn, ShapeBuilder};

use std::io::{Read, Write};
use std::path::Path;

use crate::error::{Result, SurfwarpError};
use crate::util::{open_maybe_gz, read_fixed_length_string, write_maybe_gz};

pub const NIFTI1_HEADER_SIZE: i32 = 348;
pub const NIFTI1_SINGLE_FILE_MAGIC: &[u8; 4] = b"n+1\0";
pub const NIFTI1_PAIRED_FILE_MAGIC: &[u8; 4] = b"ni1\0";
pub const NIFTI1_DEFAULT_VOX_OFFSET: f32 = 352.0;

pub const NIFTI_TYPE_UINT8: i16 = 2;
pub const NIFTI_TYPE_INT16: i16 = 4;
pub const NIFTI_TYPE_INT32: i16 = 8;
pub const NIFTI_TYPE_FLOAT32: i16 = 16;
pub const NIFTI_TYPE_FLOAT64: i16 = 64;
pub const NIFTI_TYPE_INT8: i16 = 256;
pub const NIFTI_TYPE_UINT16: i16 = 512;

pub const NIFTI_INTENT_NONE: i16 = 0;
pub const NIFTI_INTENT_DISPVECT: i16 = 1006;
pub const NIFTI_INTENT_VECTOR: i16 = 1007;

pub const NIFTI_XFORM_UNKNOWN: i16 = 0;
pub const NIFTI_XFORM_ALIGNED_ANAT: i16 = 2;


/// Models the header of a NIfTI-1 file. Fields which are not used by this crate (the ANALYZE
/// leftovers and the calibration values) are skipped when reading and zeroed when writing.
#[derive(Debug, Clone, PartialEq)]
pub struct NiftiHeader {
    pub endianness: Endianness,
    pub dim_info: u8,
    pub dim: [i16; 8],
    pub intent_p1: f32,
    pub intent_p2: f32,
    pub intent_p3: f32,
    pub intent_code: i16,
    pub datatype: i16,
    pub bitpix: i16,
    pub pixdim: [f32; 8],
    pub vox_offset: f32,
    pub scl_slope: f32,
    pub scl_inter: f32,
    pub xyzt_units: u8,
    pub descrip: String,
    pub qform_code: i16,
    pub sform_code: i16,
    pub quatern_b: f32,
    pub quatern_c: f32,
    pub quatern_d: f32,
    pub qoffset_x: f32,
    pub qoffset_y: f32,
    pub qoffset_z: f32,
    pub srow_x: [f32; 4],
    pub srow_y: [f32; 4],
    pub srow_z: [f32; 4],
    pub intent_name: String,
    pub magic: [u8; 4],
}


impl Default for NiftiHeader {
    fn default() -> NiftiHeader {
        NiftiHeader {
            endianness: Endianness::Little,
            dim_info: 0,
            dim: [0; 8],
            intent_p1: 0.0,
            intent_p2: 0.0,
            intent_p3: 0.0,
            intent_code: NIFTI_INTENT_NONE,
            datatype: NIFTI_TYPE_FLOAT32,
            bitpix: 32,
            pixdim: [1.0; 8],
            vox_offset: NIFTI1_DEFAULT_VOX_OFFSET,
            scl_slope: 1.0,
            scl_inter: 0.0,
            xyzt_units: 2, // millimeters
            descrip: String::new(),
            qform_code: NIFTI_XFORM_UNKNOWN,
            sform_code: NIFTI_XFORM_UNKNOWN,
            quatern_b: 0.0,
            quatern_c: 0.0,
            quatern_d: 0.0,
            qoffset_x: 0.0,
            qoffset_y: 0.0,
            qoffset_z: 0.0,
            srow_x: [1.0, 0.0, 0.0, 0.0],
            srow_y: [0.0, 1.0, 0.0, 0.0],
            srow_z: [0.0, 0.0, 1.0, 0.0],
            intent_name: String::new(),
            magic: *NIFTI1_SINGLE_FILE_MAGIC,
        }
    }
}


/// Determine the byte order of a NIfTI-1 header from its first four bytes, which must encode the header size 348.
pub fn detect_endianness(sizeof_hdr: [u8; 4]) -> Option<Endianness> {
    if i32::from_le_bytes(sizeof_hdr) == NIFTI1_HEADER_SIZE {
        Some(Endianness::Little)
    } else if i32::from_be_bytes(sizeof_hdr) == NIFTI1_HEADER_SIZE {
        Some(Endianness::Big)
    } else {
        None
    }
}


/// Size in bytes of one value of the given NIfTI datatype, or `None` for unsupported types.
pub fn datatype_size(datatype: i16) -> Option<usize> {
    match datatype {
        NIFTI_TYPE_UINT8 | NIFTI_TYPE_INT8 => Some(1),
        NIFTI_TYPE_INT16 | NIFTI_TYPE_UINT16 => Some(2),
        NIFTI_TYPE_INT32 | NIFTI_TYPE_FLOAT32 => Some(4),
        NIFTI_TYPE_FLOAT64 => Some(8),
        _ => None,
    }
}


impl NiftiHeader {

    /// Read a NIfTI header from a file.
    /// If the file's name ends with ".gz", the file is assumed to need GZip decoding.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<NiftiHeader> {
        NiftiHeader::from_reader(&mut open_maybe_gz(path)?)
    }


    /// Read a NIfTI header from the given byte stream.
    /// It is assumed that the input is currently at the start of the header. Exactly 348 bytes are consumed.
    pub fn from_reader<S>(input: &mut S) -> Result<NiftiHeader>
    where
        S: Read,
    {
        let mut raw = [0u8; NIFTI1_HEADER_SIZE as usize];
        input.read_exact(&mut raw)?;

        let endianness = detect_endianness([raw[0], raw[1], raw[2], raw[3]])
            .ok_or_else(|| SurfwarpError::InvalidNiftiFormat(String::from("header size field is not 348")))?;

        let mut hdr = NiftiHeader { endianness, ..NiftiHeader::default() };
        let mut input = ByteOrdered::runtime(&raw[4..], endianness);

        // data_type, db_name, extents, session_error and regular are unused ANALYZE fields.
        read_fixed_length_string(&mut input, 10 + 18 + 4 + 2 + 1)?;
        hdr.dim_info = input.read_u8()?;
        for v in hdr.dim.iter_mut() { *v = input.read_i16()?; }
        hdr.intent_p1 = input.read_f32()?;
        hdr.intent_p2 = input.read_f32()?;
        hdr.intent_p3 = input.read_f32()?;
        hdr.intent_code = input.read_i16()?;
        hdr.datatype = input.read_i16()?;
        hdr.bitpix = input.read_i16()?;
        let _slice_start = input.read_i16()?;
        for v in hdr.pixdim.iter_mut() { *v = input.read_f32()?; }
        hdr.vox_offset = input.read_f32()?;
        hdr.scl_slope = input.read_f32()?;
        hdr.scl_inter = input.read_f32()?;
        let _slice_end = input.read_i16()?;
        let _slice_code = input.read_u8()?;
        hdr.xyzt_units = input.read_u8()?;
        // cal_max, cal_min, slice_duration, toffset, glmax, glmin
        read_fixed_length_string(&mut input, 6 * 4)?;
        hdr.descrip = read_fixed_length_string(&mut input, 80)?;
        let _aux_file = read_fixed_length_string(&mut input, 24)?;
        hdr.qform_code = input.read_i16()?;
        hdr.sform_code = input.read_i16()?;
        hdr.quatern_b = input.read_f32()?;
        hdr.quatern_c = input.read_f32()?;
        hdr.quatern_d = input.read_f32()?;
        hdr.qoffset_x = input.read_f32()?;
        hdr.qoffset_y = input.read_f32()?;
        hdr.qoffset_z = input.read_f32()?;
        for v in hdr.srow_x.iter_mut() { *v = input.read_f32()?; }
        for v in hdr.srow_y.iter_mut() { *v = input.read_f32()?; }
        for v in hdr.srow_z.iter_mut() { *v = input.read_f32()?; }
        hdr.intent_name = read_fixed_length_string(&mut input, 16)?;
        for v in hdr.magic.iter_mut() { *v = input.read_u8()?; }

        if &hdr.magic == NIFTI1_PAIRED_FILE_MAGIC {
            return Err(SurfwarpError::InvalidNiftiFormat(String::from("paired .hdr/.img NIfTI files are not supported")));
        }
        if &hdr.magic != NIFTI1_SINGLE_FILE_MAGIC {
            return Err(SurfwarpError::InvalidNiftiFormat(String::from("missing 'n+1' magic, not a NIfTI-1 file")));
        }
        if hdr.dim[0] < 1 || hdr.dim[0] > 7 {
            return Err(SurfwarpError::InvalidNiftiFormat(format!("invalid number of dimensions {}", hdr.dim[0])));
        }
        Ok(hdr)
    }


    /// Write this header, followed by an empty extension block, in its byte order.
    pub fn to_writer<W: Write>(&self, output: W) -> Result<()> {
        let mut output = ByteOrdered::runtime(output, self.endianness);

        output.write_i32(NIFTI1_HEADER_SIZE)?;
        for _ in 0..(10 + 18 + 4 + 2 + 1) { output.write_u8(0)?; }
        output.write_u8(self.dim_info)?;
        for v in self.dim.iter() { output.write_i16(*v)?; }
        output.write_f32(self.intent_p1)?;
        output.write_f32(self.intent_p2)?;
        output.write_f32(self.intent_p3)?;
        output.write_i16(self.intent_code)?;
        output.write_i16(self.datatype)?;
        output.write_i16(self.bitpix)?;
        output.write_i16(0)?; // slice_start
        for v in self.pixdim.iter() { output.write_f32(*v)?; }
        output.write_f32(self.vox_offset)?;
        output.write_f32(self.scl_slope)?;
        output.write_f32(self.scl_inter)?;
        output.write_i16(0)?; // slice_end
        output.write_u8(0)?; // slice_code
        output.write_u8(self.xyzt_units)?;
        for _ in 0..(6 * 4) { output.write_u8(0)?; }
        write_fixed_length_string(&mut output, &self.descrip, 80)?;
        write_fixed_length_string(&mut output, "", 24)?;
        output.write_i16(self.qform_code)?;
        output.write_i16(self.sform_code)?;
        output.write_f32(self.quatern_b)?;
        output.write_f32(self.quatern_c)?;
        output.write_f32(self.quatern_d)?;
        output.write_f32(self.qoffset_x)?;
        output.write_f32(self.qoffset_y)?;
        output.write_f32(self.qoffset_z)?;
        for v in self.srow_x.iter().chain(self.srow_y.iter()).chain(self.srow_z.iter()) { output.write_f32(*v)?; }
        write_fixed_length_string(&mut output, &self.intent_name, 16)?;
        for v in NIFTI1_SINGLE_FILE_MAGIC.iter() { output.write_u8(*v)?; }

        // No extensions.
        for _ in 0..4 { output.write_u8(0)?; }
        Ok(())
    }


    /// The lengths of the used dimensions.
    pub fn shape(&self) -> Vec<usize> {
        let ndim = self.dim[0].max(0) as usize;
        self.dim[1..=ndim].iter().map(|&d| d.max(1) as usize).collect()
    }


    /// Number of values stored in the file, `None` if the dimensions overflow.
    pub fn num_values(&self) -> Option<usize> {
        self.shape().iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }


    /// Compute the 4x4 voxel-to-world (RAS+) matrix. The sform is used if set, then the qform,
    /// and if neither is set the voxel sizes alone.
    pub fn voxel_to_world(&self) -> Matrix4<f64> {
        if self.sform_code > NIFTI_XFORM_UNKNOWN {
            let r = [self.srow_x, self.srow_y, self.srow_z];
            let mut m = Matrix4::identity();
            for (row, values) in r.iter().enumerate() {
                for col in 0..4 {
                    m[(row, col)] = values[col] as f64;
                }
            }
            m
        } else if self.qform_code > NIFTI_XFORM_UNKNOWN {
            let b = self.quatern_b as f64;
            let c = self.quatern_c as f64;
            let d = self.quatern_d as f64;
            let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
            let qfac = if self.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
            let dx = self.pixdim[1] as f64;
            let dy = self.pixdim[2] as f64;
            let dz = self.pixdim[3] as f64 * qfac;

            Matrix4::new(
                (a * a + b * b - c * c - d * d) * dx, (2.0 * b * c - 2.0 * a * d) * dy, (2.0 * b * d + 2.0 * a * c) * dz, self.qoffset_x as f64,
                (2.0 * b * c + 2.0 * a * d) * dx, (a * a + c * c - b * b - d * d) * dy, (2.0 * c * d - 2.0 * a * b) * dz, self.qoffset_y as f64,
                (2.0 * b * d - 2.0 * a * c) * dx, (2.0 * c * d + 2.0 * a * b) * dy, (a * a + d * d - c * c - b * b) * dz, self.qoffset_z as f64,
                0.0, 0.0, 0.0, 1.0,
            )
        } else {
            Matrix4::new(
                self.pixdim[1] as f64, 0.0, 0.0, 0.0,
                0.0, self.pixdim[2] as f64, 0.0, 0.0,
                0.0, 0.0, self.pixdim[3] as f64, 0.0,
                0.0, 0.0, 0.0, 1.0,
            )
        }
    }


    /// Store the given voxel-to-world matrix as sform, and set the voxel sizes to match.
    pub fn set_voxel_to_world(&mut self, affine: &Matrix4<f64>) {
        self.sform_code = NIFTI_XFORM_ALIGNED_ANAT;
        for col in 0..4 {
            self.srow_x[col] = affine[(0, col)] as f32;
            self.srow_y[col] = affine[(1, col)] as f32;
            self.srow_z[col] = affine[(2, col)] as f32;
        }
        for axis in 0..3 {
            let column = Vector3::new(affine[(0, axis)], affine[(1, axis)], affine[(2, axis)]);
            self.pixdim[axis + 1] = column.norm() as f32;
        }
    }
}


fn write_fixed_length_string<W: Write>(output: &mut ByteOrdered<W, Endianness>, value: &str, len: usize) -> Result<()> {
    let bytes = value.as_bytes();
    for idx in 0..len {
        output.write_u8(if idx < bytes.len() && idx < len - 1 { bytes[idx] } else { 0 })?;
    }
    Ok(())
}


/// Models a NIfTI-1 image. The data is stored in the file's order (first axis fastest), with scaling applied.
#[derive(Debug, Clone, PartialEq)]
pub struct NiftiImage {
    pub header: NiftiHeader,
    pub data: ArrayD<f32>,
}


/// Read a NIfTI-1 file.
pub fn read_nifti<P: AsRef<Path>>(path: P) -> Result<NiftiImage> {
    NiftiImage::from_file(path)
}


impl NiftiImage {

    /// Create a float32 image from data and a voxel-to-world (RAS+) matrix.
    pub fn new(data: ArrayD<f32>, voxel_to_world: &Matrix4<f64>) -> Result<NiftiImage> {
        if data.ndim() == 0 || data.ndim() > 7 {
            return Err(SurfwarpError::InvalidNiftiFormat(format!("cannot store {} dimensions", data.ndim())));
        }
        let mut header = NiftiHeader::default();
        header.dim[0] = data.ndim() as i16;
        for (idx, len) in data.shape().iter().enumerate() {
            if *len > i16::MAX as usize {
                return Err(SurfwarpError::InvalidNiftiFormat(format!("dimension {} is too large: {}", idx, len)));
            }
            header.dim[idx + 1] = *len as i16;
        }
        for unused in (data.ndim() + 1)..8 {
            header.dim[unused] = 1;
        }
        header.set_voxel_to_world(voxel_to_world);
        Ok(NiftiImage { header, data })
    }


    /// Read a NIfTI image from a file.
    /// If the file's name ends with ".gz", the file is assumed to need GZip decoding.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<NiftiImage> {
        debug!("Reading NIfTI file '{}'.", path.as_ref().display());
        NiftiImage::from_reader(open_maybe_gz(path)?)
    }


    /// Read a NIfTI image from the given byte stream, which must be at the start of the header.
    pub fn from_reader<S>(mut input: S) -> Result<NiftiImage>
    where
        S: Read,
    {
        let header = NiftiHeader::from_reader(&mut input)?;

        let value_size = datatype_size(header.datatype).ok_or(SurfwarpError::UnsupportedNiftiDatatype(header.datatype))?;
        if !header.vox_offset.is_finite() || header.vox_offset < NIFTI1_HEADER_SIZE as f32 {
            return Err(SurfwarpError::InvalidNiftiFormat(format!("vox_offset {} points into the header", header.vox_offset)));
        }

        // Extensions are skipped. We cannot seek in a GZ stream, so they are read.
        let skip = header.vox_offset as u64 - NIFTI1_HEADER_SIZE as u64;
        std::io::copy(&mut (&mut input).take(skip), &mut std::io::sink())?;

        let num_values = header.num_values()
            .ok_or_else(|| SurfwarpError::InvalidNiftiFormat(format!("dimensions {:?} are too large", header.shape())))?;
        let num_bytes = num_values.checked_mul(value_size)
            .ok_or_else(|| SurfwarpError::InvalidNiftiFormat(format!("dimensions {:?} are too large", header.shape())))?;

        // Grows with the data actually present in the stream.
        let mut raw = Vec::new();
        (&mut input).take(num_bytes as u64).read_to_end(&mut raw)?;
        if raw.len() != num_bytes {
            return Err(SurfwarpError::InvalidNiftiFormat(format!("expected {} bytes of voxel data, found {}", num_bytes, raw.len())));
        }

        let values = decode_values(&raw, num_values, &header)?;
        let data = ArrayD::from_shape_vec(IxDyn(&header.shape()).f(), values)?;
        debug!("NIfTI image has shape {:?}, datatype {} and intent {}.", data.shape(), header.datatype, header.intent_code);

        Ok(NiftiImage { header, data })
    }


    /// Write this image as little endian float32 to a file, gzip compressed if the name ends with ".gz".
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut buffer = Vec::with_capacity(NIFTI1_DEFAULT_VOX_OFFSET as usize + self.data.len() * 4);
        self.to_writer(&mut buffer)?;
        write_maybe_gz(path, &buffer)
    }


    /// Write this image as little endian float32 to the given stream.
    pub fn to_writer<W: Write>(&self, mut output: W) -> Result<()> {
        let mut header = self.header.clone();
        header.endianness = Endianness::Little;
        header.datatype = NIFTI_TYPE_FLOAT32;
        header.bitpix = 32;
        header.vox_offset = NIFTI1_DEFAULT_VOX_OFFSET;
        header.scl_slope = 1.0;
        header.scl_inter = 0.0;

        header.to_writer(&mut output)?;
        let mut output = ByteOrdered::le(output);
        // Reversing the axes and iterating in logical order visits the values first axis fastest.
        for v in self.data.t().iter() {
            output.write_f32(*v)?;
        }
        Ok(())
    }


    /// The voxel-to-world (RAS+) matrix of this image.
    pub fn voxel_to_world(&self) -> Matrix4<f64> {
        self.header.voxel_to_world()
    }
}


fn decode_values(raw: &[u8], num_values: usize, header: &NiftiHeader) -> Result<Vec<f32>> {
    let mut input = ByteOrdered::runtime(raw, header.endianness);
    let mut values: Vec<f32> = Vec::with_capacity(num_values);
    for _ in 0..num_values {
        let v = match header.datatype {
            NIFTI_TYPE_UINT8 => input.read_u8()? as f32,
            NIFTI_TYPE_INT8 => input.read_i8()? as f32,
            NIFTI_TYPE_INT16 => input.read_i16()? as f32,
            NIFTI_TYPE_UINT16 => input.read_u16()? as f32,
            NIFTI_TYPE_INT32 => input.read_i32()? as f32,
            NIFTI_TYPE_FLOAT32 => input.read_f32()?,
            NIFTI_TYPE_FLOAT64 => input.read_f64()? as f32,
            other => return Err(SurfwarpError::UnsupportedNiftiDatatype(other)),
        };
        values.push(v);
    }

    let slope = header.scl_slope;
    if slope != 0.0 && (slope != 1.0 || header.scl_inter != 0.0) {
        for v in values.iter_mut() {
            *v = *v * slope + header.scl_inter;
        }
    }
    Ok(values)
}


#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array;

    fn ramp_image() -> NiftiImage {
        let values: Vec<f32> = (0..24).map(|v| v as f32).collect();
        let data = Array::from_shape_vec(IxDyn(&[2, 3, 4]).f(), values).unwrap();
        let affine = Matrix4::new(
            2.0, 0.0, 0.0, -10.0,
            0.0, 2.0, 0.0, 20.0,
            0.0, 0.0, 3.0, 5.0,
            0.0, 0.0, 0.0, 1.0,
        );
        NiftiImage::new(data, &affine).unwrap()
    }

    #[test]
    fn an_image_can_be_written_and_read() {
        let image = ramp_image();
        let mut buffer = Vec::new();
        image.to_writer(&mut buffer).unwrap();
        assert_eq!(352 + 24 * 4, buffer.len());

        let restored = NiftiImage::from_reader(&buffer[..]).unwrap();
        assert_eq!(vec![2, 3, 4], restored.header.shape());
        assert_eq!(image.data, restored.data);
        assert_eq!(7.0, restored.data[[1, 0, 1]]);
        assert_eq!([2.0, 2.0, 3.0], [restored.header.pixdim[1], restored.header.pixdim[2], restored.header.pixdim[3]]);
        let (expected, actual) = (image.voxel_to_world(), restored.voxel_to_world());
        for (e, a) in expected.iter().zip(actual.iter()) {
            assert_abs_diff_eq!(*e, *a, epsilon = 1e-6);
        }
    }

    #[test]
    fn gz_compressed_images_are_supported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.nii.gz");
        ramp_image().to_file(&path).unwrap();
        let restored = read_nifti(&path).unwrap();
        assert_eq!(ramp_image().data, restored.data);
    }

    #[test]
    fn scaling_is_applied() {
        let mut buffer = Vec::new();
        ramp_image().to_writer(&mut buffer).unwrap();
        buffer[112..116].copy_from_slice(&2.0f32.to_le_bytes());
        buffer[116..120].copy_from_slice(&1.0f32.to_le_bytes());

        let restored = NiftiImage::from_reader(&buffer[..]).unwrap();
        assert_eq!(15.0, restored.data[[1, 0, 1]]);
    }

    #[test]
    fn the_qform_is_used_without_sform() {
        let mut hdr = NiftiHeader::default();
        hdr.qform_code = 1;
        // 180 degree rotation around z.
        hdr.quatern_d = 1.0;
        hdr.pixdim = [1.0, 1.0, 2.0, 3.0, 1.0, 1.0, 1.0, 1.0];
        hdr.qoffset_x = 4.0;

        let m = hdr.voxel_to_world();
        assert_abs_diff_eq!(-1.0, m[(0, 0)], epsilon = 1e-9);
        assert_abs_diff_eq!(-2.0, m[(1, 1)], epsilon = 1e-9);
        assert_abs_diff_eq!(3.0, m[(2, 2)], epsilon = 1e-9);
        assert_abs_diff_eq!(4.0, m[(0, 3)], epsilon = 1e-9);
    }

    #[test]
    fn byte_order_is_detected() {
        assert_eq!(Some(Endianness::Little), detect_endianness(348i32.to_le_bytes()));
        assert_eq!(Some(Endianness::Big), detect_endianness(348i32.to_be_bytes()));
        assert_eq!(None, detect_endianness(540i32.to_le_bytes()));
    }

    #[test]
    fn big_endian_headers_can_be_read() {
        let mut image = ramp_image();
        image.header.endianness = Endianness::Big;
        let mut buffer = Vec::new();
        image.header.to_writer(&mut buffer).unwrap();
        let hdr = NiftiHeader::from_reader(&mut &buffer[..]).unwrap();
        assert_eq!(Endianness::Big, hdr.endianness);
        assert_eq!(image.header.dim, hdr.dim);
        assert_eq!(image.header.srow_z, hdr.srow_z);
    }

    #[test]
    fn a_nan_vox_offset_is_rejected() {
        let mut buffer = Vec::new();
        ramp_image().to_writer(&mut buffer).unwrap();
        buffer[108..112].copy_from_slice(&f32::NAN.to_le_bytes());
        assert!(matches!(NiftiImage::from_reader(&buffer[..]), Err(SurfwarpError::InvalidNiftiFormat(_))));
    }

    #[test]
    fn huge_dimensions_are_rejected() {
        let mut buffer = Vec::new();
        ramp_image().to_writer(&mut buffer).unwrap();
        // 7 dimensions of 32767 voxels each overflow the element count.
        buffer[40..42].copy_from_slice(&7i16.to_le_bytes());
        for d in 1..8 {
            buffer[40 + 2 * d..42 + 2 * d].copy_from_slice(&i16::MAX.to_le_bytes());
        }
        assert!(matches!(NiftiImage::from_reader(&buffer[..]), Err(SurfwarpError::InvalidNiftiFormat(_))));

        // Three large dimensions fit, but the file holds far fewer values.
        buffer[40..42].copy_from_slice(&3i16.to_le_bytes());
        assert!(matches!(NiftiImage::from_reader(&buffer[..]), Err(SurfwarpError::InvalidNiftiFormat(_))));
    }

    #[test]
    fn non_nifti_data_is_rejected() {
        let garbage = vec![7u8; 400];
        assert!(matches!(NiftiImage::from_reader(&garbage[..]), Err(SurfwarpError::InvalidNiftiFormat(_))));
    }
}
