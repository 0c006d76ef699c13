//! Functions for reading and writing ITK transform files, as produced by ANTs.
//!
//! Two containers are supported: the MATLAB v4 binary format (`*GenericAffine.mat`), which stores
//! one variable named after the transform type plus one named `fixed`, and the ITK text format
//! (`.tfm` / `.txt`), which lists `Transform:`, `Parameters:` and `FixedParameters:` lines.


use byteordered::{ByteOrdered, Endianness};
use log::debug;

use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

use crate::error::{Result, SurfwarpError};
use crate::transform::AffineTransform;
use crate::util::read_fixed_length_string;

pub const ITK_TEXT_MAGIC: &str = "#Insight Transform File";
pub const ITK_AFFINE_TYPE: &str = "AffineTransform_double_3_3";
pub const MAT_FIXED_PARAMETERS_NAME: &str = "fixed";


/// One transform entry of an ITK transform file.
#[derive(Debug, Clone, PartialEq)]
pub struct ItkTransformEntry {
    pub transform_type: String,
    pub parameters: Vec<f64>,
    pub fixed_parameters: Vec<f64>,
}

impl ItkTransformEntry {

    pub fn new(transform_type: &str) -> ItkTransformEntry {
        ItkTransformEntry {
            transform_type: String::from(transform_type),
            parameters: Vec::new(),
            fixed_parameters: Vec::new(),
        }
    }

    /// The transform class name without the scalar type and dimension suffix, e.g. `AffineTransform`.
    pub fn class_name(&self) -> &str {
        self.transform_type.split('_').next().unwrap_or("")
    }

    /// Whether this entry is the header entry of a composite transform file.
    pub fn is_composite(&self) -> bool {
        self.class_name() == "CompositeTransform"
    }

    /// Convert this entry into an affine transform. Only 3D linear transform types are supported.
    pub fn to_affine(&self) -> Result<AffineTransform> {
        let unsupported = || SurfwarpError::UnsupportedTransformType(self.transform_type.clone());
        if !self.transform_type.ends_with("_3_3") {
            return Err(unsupported());
        }
        match self.class_name() {
            "AffineTransform" | "MatrixOffsetTransformBase" => AffineTransform::from_itk_parameters(&self.parameters, &self.fixed_parameters),
            "TranslationTransform" => {
                if self.parameters.len() != 3 {
                    return Err(SurfwarpError::InvalidTransformFormat(format!("translation transform needs 3 parameters, got {}", self.parameters.len())));
                }
                Ok(AffineTransform::from_translation([self.parameters[0], self.parameters[1], self.parameters[2]]))
            }
            _ => Err(unsupported()),
        }
    }
}


/// Read all transform entries from an ITK transform file. Files ending in ".mat" are read as MATLAB v4 files, all others as text.
pub fn read_itk_transforms<P: AsRef<Path>>(path: P) -> Result<Vec<ItkTransformEntry>> {
    let path = path.as_ref();
    let is_mat = path.extension().map(|e| e.eq_ignore_ascii_case("mat")).unwrap_or(false);
    let content = fs::read(path)?;
    debug!("Reading ITK transform file '{}' ({} format).", path.display(), if is_mat { "MATLAB" } else { "text" });
    if is_mat {
        Ok(vec![read_mat_transform(&content)?])
    } else {
        let text = String::from_utf8(content).map_err(|_| SurfwarpError::InvalidTransformFormat(String::from("text transform file is not valid UTF-8")))?;
        read_text_transforms(&text)
    }
}


/// Read the single linear transform stored in an ITK transform file.
pub fn read_affine_transform<P: AsRef<Path>>(path: P) -> Result<AffineTransform> {
    let entries: Vec<ItkTransformEntry> = read_itk_transforms(path)?.into_iter().filter(|e| !e.is_composite()).collect();
    match entries.len() {
        1 => entries[0].to_affine(),
        0 => Err(SurfwarpError::InvalidTransformFormat(String::from("the file contains no transform"))),
        n => Err(SurfwarpError::InvalidTransformFormat(format!("expected a single linear transform, found {}", n))),
    }
}


/// Parse the content of an ITK text transform file.
pub fn read_text_transforms(text: &str) -> Result<Vec<ItkTransformEntry>> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    match lines.next() {
        Some(first) if first.starts_with(ITK_TEXT_MAGIC) => {}
        _ => return Err(SurfwarpError::InvalidTransformFormat(String::from("missing '#Insight Transform File' header"))),
    }

    let mut entries: Vec<ItkTransformEntry> = Vec::new();
    for line in lines {
        if line.starts_with('#') {
            continue;
        }
        let (key, value) = match line.find(':') {
            Some(pos) => (line[..pos].trim(), line[pos + 1..].trim()),
            None => return Err(SurfwarpError::InvalidTransformFormat(format!("unexpected line '{}'", line))),
        };
        match key {
            "Transform" => entries.push(ItkTransformEntry::new(value)),
            "Parameters" | "FixedParameters" => {
                let entry = entries.last_mut().ok_or_else(|| SurfwarpError::InvalidTransformFormat(format!("{} before any Transform line", key)))?;
                let values = parse_values(value)?;
                if key == "Parameters" {
                    entry.parameters = values;
                } else {
                    entry.fixed_parameters = values;
                }
            }
            _ => return Err(SurfwarpError::InvalidTransformFormat(format!("unknown key '{}'", key))),
        }
    }
    Ok(entries)
}

fn parse_values(text: &str) -> Result<Vec<f64>> {
    text.split_whitespace()
        .map(|v| v.parse::<f64>().map_err(|_| SurfwarpError::InvalidTransformFormat(format!("invalid number '{}'", v))))
        .collect()
}


/// Serialize an affine transform into the ITK text format.
pub fn affine_to_text(affine: &AffineTransform) -> String {
    let join = |values: Vec<f64>| values.iter().map(|v| v.to_string()).collect::<Vec<String>>().join(" ");
    format!("{} V1.0\n#Transform 0\nTransform: {}\nParameters: {}\nFixedParameters: {}\n",
        ITK_TEXT_MAGIC, ITK_AFFINE_TYPE, join(affine.itk_parameters()), join(affine.itk_fixed_parameters()))
}


/// Write an affine transform to an ITK text transform file.
pub fn write_itk_transform_txt<P: AsRef<Path>>(affine: &AffineTransform, path: P) -> Result<()> {
    fs::write(path, affine_to_text(affine))?;
    Ok(())
}


/// A MATLAB v4 matrix variable. The values are stored in column-major order.
#[derive(Debug, Clone, PartialEq)]
struct MatVariable {
    name: String,
    rows: usize,
    cols: usize,
    values: Vec<f64>,
}


/// Parse a MATLAB v4 file holding an ITK transform.
pub fn read_mat_transform(content: &[u8]) -> Result<ItkTransformEntry> {
    let variables = read_mat_variables(content)?;

    let mut entry: Option<ItkTransformEntry> = None;
    let mut fixed: Vec<f64> = Vec::new();
    for var in variables {
        debug!("MATLAB variable '{}' with {}x{} values.", var.name, var.rows, var.cols);
        if var.name == MAT_FIXED_PARAMETERS_NAME {
            fixed = var.values;
        } else if entry.is_none() {
            let mut e = ItkTransformEntry::new(&var.name);
            e.parameters = var.values;
            entry = Some(e);
        }
    }

    let mut entry = entry.ok_or_else(|| SurfwarpError::InvalidTransformFormat(String::from("MATLAB file contains no transform parameters")))?;
    entry.fixed_parameters = fixed;
    Ok(entry)
}


fn read_mat_variables(content: &[u8]) -> Result<Vec<MatVariable>> {
    let mut input = Cursor::new(content);
    let mut variables = Vec::new();

    while (input.position() as usize) < content.len() {
        let mut mopt_bytes = [0u8; 4];
        input.read_exact(&mut mopt_bytes)?;
        let (mopt, endianness) = mat_type_and_endianness(mopt_bytes)?;

        let precision = (mopt / 10) % 10;
        let matrix_type = mopt % 10;
        if matrix_type != 0 {
            return Err(SurfwarpError::InvalidTransformFormat(format!("MATLAB matrix type {} is not a full numeric matrix", matrix_type)));
        }

        // rows, cols, imagf and namlen follow as four 32 bit integers.
        let remaining = content.len().saturating_sub(input.position() as usize + 16);
        let mut input_ordered = ByteOrdered::runtime(&mut input, endianness);
        let rows = input_ordered.read_i32()?;
        let cols = input_ordered.read_i32()?;
        let imagf = input_ordered.read_i32()?;
        let namlen = input_ordered.read_i32()?;
        if rows < 0 || cols < 0 || namlen < 1 {
            return Err(SurfwarpError::InvalidTransformFormat(String::from("invalid MATLAB variable header")));
        }
        let element_size = match precision {
            0 => 8,
            1 | 2 => 4,
            3 | 4 => 2,
            5 => 1,
            p => return Err(SurfwarpError::InvalidTransformFormat(format!("unknown MATLAB precision {}", p))),
        };
        if namlen as usize > remaining {
            return Err(SurfwarpError::InvalidTransformFormat(format!("MATLAB variable name of {} bytes exceeds the file", namlen)));
        }
        let name = read_fixed_length_string(&mut input_ordered, namlen as usize)?;

        let remaining = remaining - namlen as usize;
        let count = (rows as usize)
            .checked_mul(cols as usize)
            .and_then(|n| n.checked_mul(if imagf != 0 { 2 } else { 1 }))
            .filter(|n| n.checked_mul(element_size).map_or(false, |bytes| bytes <= remaining))
            .ok_or_else(|| SurfwarpError::InvalidTransformFormat(format!("MATLAB variable '{}' with {}x{} values exceeds the file", name, rows, cols)))?;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let v = match precision {
                0 => input_ordered.read_f64()?,
                1 => input_ordered.read_f32()? as f64,
                2 => input_ordered.read_i32()? as f64,
                3 => input_ordered.read_i16()? as f64,
                4 => input_ordered.read_u16()? as f64,
                _ => input_ordered.read_u8()? as f64,
            };
            values.push(v);
        }
        // Only the real part is kept.
        values.truncate(rows as usize * cols as usize);

        variables.push(MatVariable { name, rows: rows as usize, cols: cols as usize, values });
    }
    Ok(variables)
}


/// Decode the MOPT type field of a MATLAB v4 variable header. Its thousands digit encodes the byte order.
fn mat_type_and_endianness(bytes: [u8; 4]) -> Result<(i32, Endianness)> {
    let le = i32::from_le_bytes(bytes);
    if (0..1000).contains(&le) {
        return Ok((le, Endianness::Little));
    }
    let be = i32::from_be_bytes(bytes);
    if (1000..2000).contains(&be) {
        return Ok((be - 1000, Endianness::Big));
    }
    Err(SurfwarpError::InvalidTransformFormat(String::from("not a MATLAB v4 file")))
}


/// Serialize an affine transform into a little endian MATLAB v4 file, as ANTs does.
pub fn affine_to_mat(affine: &AffineTransform) -> Result<Vec<u8>> {
    let mut output = ByteOrdered::le(Vec::new());
    for (name, values) in [(ITK_AFFINE_TYPE, affine.itk_parameters()), (MAT_FIXED_PARAMETERS_NAME, affine.itk_fixed_parameters())].iter() {
        output.write_i32(0)?; // little endian, double precision, full matrix
        output.write_i32(values.len() as i32)?;
        output.write_i32(1)?;
        output.write_i32(0)?;
        output.write_i32(name.len() as i32 + 1)?;
        for b in name.as_bytes() {
            output.write_u8(*b)?;
        }
        output.write_u8(0)?;
        for v in values {
            output.write_f64(*v)?;
        }
    }
    Ok(output.into_inner())
}


/// Write an affine transform to a MATLAB v4 transform file.
pub fn write_itk_transform_mat<P: AsRef<Path>>(affine: &AffineTransform, path: P) -> Result<()> {
    fs::write(path, affine_to_mat(affine)?)?;
    Ok(())
}
