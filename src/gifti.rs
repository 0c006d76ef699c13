//! Functions for reading and writing brain surface meshes in GIfTI files.
//!
//! A GIfTI file is an XML container holding an ordered list of typed data arrays. For a surface
//! mesh, the first array usually stores the vertex coordinates (intent `NIFTI_INTENT_POINTSET`,
//! `N x 3` float32 values) and the second one the triangles (`NIFTI_INTENT_TRIANGLE`, `M x 3` int32
//! vertex indices). The array payloads may be stored as ASCII text, as base64 encoded binary data or
//! as zlib compressed base64 encoded binary data.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use byteordered::{ByteOrdered, Endianness};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::{debug, warn};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use std::fmt;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{Result, SurfwarpError};
use crate::util::{open_maybe_gz, write_maybe_gz};

pub const GIFTI_INTENT_POINTSET: &str = "NIFTI_INTENT_POINTSET";
pub const GIFTI_INTENT_TRIANGLE: &str = "NIFTI_INTENT_TRIANGLE";
pub const GIFTI_DEFAULT_VERSION: &str = "1.0";
pub const GIFTI_DOCTYPE: &str = r#"GIFTI SYSTEM "http://www.nitrc.org/frs/download.php/115/gifti.dtd""#;

const GIFTI_ROOT_ATTRIBUTES: &[&str] = &["Version", "NumberOfDataArrays"];
const GIFTI_DATA_ARRAY_ATTRIBUTES: &[&str] = &[
    "Intent", "DataType", "ArrayIndexingOrder", "Dimensionality", "Dim0", "Dim1", "Dim2", "Dim3", "Dim4", "Dim5",
    "Encoding", "Endian", "ExternalFileName", "ExternalFileOffset",
];

/// Ordered key/value metadata, as stored in `<MetaData>` elements.
pub type GiftiMetadata = Vec<(String, String)>;


/// The element type of a data array. GIfTI only allows these three NIfTI types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiftiDatatype {
    Uint8,
    Int32,
    Float32,
}

impl GiftiDatatype {
    pub fn from_name(name: &str) -> Result<GiftiDatatype> {
        match name {
            "NIFTI_TYPE_UINT8" => Ok(GiftiDatatype::Uint8),
            "NIFTI_TYPE_INT32" => Ok(GiftiDatatype::Int32),
            "NIFTI_TYPE_FLOAT32" => Ok(GiftiDatatype::Float32),
            other => Err(SurfwarpError::UnsupportedGiftiDatatype(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GiftiDatatype::Uint8 => "NIFTI_TYPE_UINT8",
            GiftiDatatype::Int32 => "NIFTI_TYPE_INT32",
            GiftiDatatype::Float32 => "NIFTI_TYPE_FLOAT32",
        }
    }

    /// Size of one element in bytes.
    pub fn byte_size(&self) -> usize {
        match self {
            GiftiDatatype::Uint8 => 1,
            GiftiDatatype::Int32 | GiftiDatatype::Float32 => 4,
        }
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiftiEncoding {
    Ascii,
    Base64Binary,
    GZipBase64Binary,
}

impl GiftiEncoding {
    /// Parse an `Encoding` attribute. External binary files are recognised, but not supported.
    pub fn from_name(name: &str) -> Result<GiftiEncoding> {
        match name {
            "ASCII" => Ok(GiftiEncoding::Ascii),
            "Base64Binary" => Ok(GiftiEncoding::Base64Binary),
            "GZipBase64Binary" => Ok(GiftiEncoding::GZipBase64Binary),
            other => Err(SurfwarpError::UnsupportedGiftiEncoding(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GiftiEncoding::Ascii => "ASCII",
            GiftiEncoding::Base64Binary => "Base64Binary",
            GiftiEncoding::GZipBase64Binary => "GZipBase64Binary",
        }
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiftiEndian {
    LittleEndian,
    BigEndian,
}

impl GiftiEndian {
    pub fn from_name(name: &str) -> Result<GiftiEndian> {
        match name {
            "LittleEndian" => Ok(GiftiEndian::LittleEndian),
            "BigEndian" => Ok(GiftiEndian::BigEndian),
            other => Err(SurfwarpError::InvalidGiftiFormat(format!("unknown Endian '{}'", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GiftiEndian::LittleEndian => "LittleEndian",
            GiftiEndian::BigEndian => "BigEndian",
        }
    }

    fn endianness(&self) -> Endianness {
        match self {
            GiftiEndian::LittleEndian => Endianness::Little,
            GiftiEndian::BigEndian => Endianness::Big,
        }
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiftiIndexingOrder {
    RowMajorOrder,
    ColumnMajorOrder,
}

impl GiftiIndexingOrder {
    pub fn from_name(name: &str) -> Result<GiftiIndexingOrder> {
        match name {
            "RowMajorOrder" => Ok(GiftiIndexingOrder::RowMajorOrder),
            "ColumnMajorOrder" => Ok(GiftiIndexingOrder::ColumnMajorOrder),
            other => Err(SurfwarpError::InvalidGiftiFormat(format!("unknown ArrayIndexingOrder '{}'", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GiftiIndexingOrder::RowMajorOrder => "RowMajorOrder",
            GiftiIndexingOrder::ColumnMajorOrder => "ColumnMajorOrder",
        }
    }
}


/// The decoded payload of a data array, flattened in the array's indexing order.
#[derive(Debug, Clone, PartialEq)]
pub enum GiftiData {
    Uint8(Vec<u8>),
    Int32(Vec<i32>),
    Float32(Vec<f32>),
}

impl GiftiData {
    pub fn empty(datatype: GiftiDatatype) -> GiftiData {
        match datatype {
            GiftiDatatype::Uint8 => GiftiData::Uint8(Vec::new()),
            GiftiDatatype::Int32 => GiftiData::Int32(Vec::new()),
            GiftiDatatype::Float32 => GiftiData::Float32(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            GiftiData::Uint8(v) => v.len(),
            GiftiData::Int32(v) => v.len(),
            GiftiData::Float32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn datatype(&self) -> GiftiDatatype {
        match self {
            GiftiData::Uint8(_) => GiftiDatatype::Uint8,
            GiftiData::Int32(_) => GiftiDatatype::Int32,
            GiftiData::Float32(_) => GiftiDatatype::Float32,
        }
    }
}


/// A `<CoordinateSystemTransformMatrix>`: maps the data space of an array into another space.
#[derive(Debug, Clone, PartialEq)]
pub struct GiftiCoordSystem {
    pub data_space: String,
    pub transformed_space: String,
    pub matrix: [[f64; 4]; 4],
}

impl Default for GiftiCoordSystem {
    fn default() -> GiftiCoordSystem {
        let mut matrix = [[0.0; 4]; 4];
        for (idx, row) in matrix.iter_mut().enumerate() {
            row[idx] = 1.0;
        }
        GiftiCoordSystem {
            data_space: String::from("NIFTI_XFORM_UNKNOWN"),
            transformed_space: String::from("NIFTI_XFORM_UNKNOWN"),
            matrix,
        }
    }
}


/// One entry of the `<LabelTable>`.
#[derive(Debug, Clone, PartialEq)]
pub struct GiftiLabel {
    pub key: i32,
    pub red: Option<f32>,
    pub green: Option<f32>,
    pub blue: Option<f32>,
    pub alpha: Option<f32>,
    pub label: String,
}


/// A single `<DataArray>` element with its decoded data.
#[derive(Debug, Clone, PartialEq)]
pub struct GiftiDataArray {
    pub intent: String,
    pub datatype: GiftiDatatype,
    pub dims: Vec<usize>,
    pub encoding: GiftiEncoding,
    pub endian: GiftiEndian,
    pub indexing_order: GiftiIndexingOrder,
    pub external_file_name: String,
    pub external_file_offset: String,
    pub metadata: GiftiMetadata,
    pub coord_systems: Vec<GiftiCoordSystem>,
    pub data: GiftiData,
    /// Attributes of the `<DataArray>` element not covered by the fields above, kept for writing.
    pub extra_attributes: Vec<(String, String)>,
}

impl GiftiDataArray {

    /// Create a row-major, base64 encoded array of vertex coordinates.
    pub fn from_points(points: &[[f32; 3]]) -> GiftiDataArray {
        let data: Vec<f32> = points.iter().flat_map(|p| p.iter().copied()).collect();
        GiftiDataArray {
            intent: String::from(GIFTI_INTENT_POINTSET),
            datatype: GiftiDatatype::Float32,
            dims: vec![points.len(), 3],
            encoding: GiftiEncoding::Base64Binary,
            endian: GiftiEndian::LittleEndian,
            indexing_order: GiftiIndexingOrder::RowMajorOrder,
            external_file_name: String::new(),
            external_file_offset: String::new(),
            metadata: Vec::new(),
            coord_systems: Vec::new(),
            data: GiftiData::Float32(data),
            extra_attributes: Vec::new(),
        }
    }

    /// Create a row-major, base64 encoded array of triangles (vertex index triples).
    pub fn from_triangles(faces: &[[i32; 3]]) -> GiftiDataArray {
        let data: Vec<i32> = faces.iter().flat_map(|f| f.iter().copied()).collect();
        GiftiDataArray {
            intent: String::from(GIFTI_INTENT_TRIANGLE),
            datatype: GiftiDatatype::Int32,
            dims: vec![faces.len(), 3],
            data: GiftiData::Int32(data),
            ..GiftiDataArray::from_points(&[])
        }
    }

    /// Whether the intent of this array marks it as a set of points.
    pub fn is_pointset(&self) -> bool {
        self.intent == GIFTI_INTENT_POINTSET
    }

    /// The number of elements the `Dim*` attributes promise, saturating at `usize::MAX`.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d)).unwrap_or(usize::MAX)
    }

    /// Check that this array holds 3-component float32 coordinates, i.e., has dims `[N, 3]`.
    pub fn check_coordinates(&self) -> Result<()> {
        if self.datatype != GiftiDatatype::Float32 {
            return Err(SurfwarpError::NotACoordinateArray(format!("datatype is {}, expected NIFTI_TYPE_FLOAT32", self.datatype.name())));
        }
        if self.dims.len() != 2 || self.dims[1] != 3 {
            return Err(SurfwarpError::NotACoordinateArray(format!("dimensions are {:?}, expected [N, 3]", self.dims)));
        }
        match &self.data {
            GiftiData::Float32(v) if v.len() == self.num_elements() => Ok(()),
            _ => Err(SurfwarpError::NotACoordinateArray(String::from("decoded data does not match the declared dimensions"))),
        }
    }

    /// The number of 3D points, only meaningful for coordinate arrays.
    pub fn num_points(&self) -> usize {
        self.dims.first().copied().unwrap_or(0)
    }

    /// Get the vertex coordinates as triples, regardless of the indexing order used in the file.
    pub fn points(&self) -> Result<Vec<[f32; 3]>> {
        self.check_coordinates()?;
        let n = self.num_points();
        let values = match &self.data {
            GiftiData::Float32(v) => v,
            _ => unreachable!("checked by check_coordinates"),
        };
        let points = (0..n)
            .map(|i| match self.indexing_order {
                GiftiIndexingOrder::RowMajorOrder => [values[3 * i], values[3 * i + 1], values[3 * i + 2]],
                GiftiIndexingOrder::ColumnMajorOrder => [values[i], values[n + i], values[2 * n + i]],
            })
            .collect();
        Ok(points)
    }

    /// Overwrite the vertex coordinates. The number of points must not change.
    pub fn set_points(&mut self, points: &[[f32; 3]]) -> Result<()> {
        self.check_coordinates()?;
        let n = self.num_points();
        if points.len() != n {
            return Err(SurfwarpError::NotACoordinateArray(format!("expected {} points, got {}", n, points.len())));
        }
        let order = self.indexing_order;
        if let GiftiData::Float32(values) = &mut self.data {
            for (i, p) in points.iter().enumerate() {
                for (c, v) in p.iter().enumerate() {
                    let idx = match order {
                        GiftiIndexingOrder::RowMajorOrder => 3 * i + c,
                        GiftiIndexingOrder::ColumnMajorOrder => c * n + i,
                    };
                    values[idx] = *v;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for GiftiDataArray {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "GIfTI data array with intent {}, datatype {} and dimensions {:?}.", self.intent, self.datatype.name(), self.dims)
    }
}


/// Models a GIfTI file: global metadata, an optional label table and an ordered list of data arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct GiftiImage {
    pub version: String,
    pub metadata: GiftiMetadata,
    pub label_table: Vec<GiftiLabel>,
    pub data_arrays: Vec<GiftiDataArray>,
    /// Attributes of the `<GIFTI>` root element other than `Version` and `NumberOfDataArrays`, e.g. `xmlns:xsi`.
    pub extra_attributes: Vec<(String, String)>,
}

impl Default for GiftiImage {
    fn default() -> GiftiImage {
        GiftiImage {
            version: String::from(GIFTI_DEFAULT_VERSION),
            metadata: Vec::new(),
            label_table: Vec::new(),
            data_arrays: Vec::new(),
            extra_attributes: Vec::new(),
        }
    }
}


/// Read a GIfTI file.
pub fn read_gifti<P: AsRef<Path>>(path: P) -> Result<GiftiImage> {
    GiftiImage::from_file(path)
}


/// Write a GIfTI file.
pub fn write_gifti<P: AsRef<Path>>(image: &GiftiImage, path: P) -> Result<()> {
    image.to_file(path)
}


impl GiftiImage {

    /// Read a GIfTI instance from a file.
    /// If the file's name ends with ".gz", the file is assumed to need GZip decoding.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<GiftiImage> {
        debug!("Reading GIfTI file '{}'.", path.as_ref().display());
        GiftiImage::from_reader(open_maybe_gz(path)?)
    }

    /// Read a GIfTI instance from the given byte stream, which must contain the complete XML document.
    pub fn from_reader<S>(mut input: S) -> Result<GiftiImage>
    where
        S: Read,
    {
        let mut content = String::new();
        input.read_to_string(&mut content)?;
        GiftiImage::from_xml_str(&content)
    }

    /// Parse a GIfTI XML document.
    pub fn from_xml_str(content: &str) -> Result<GiftiImage> {
        let mut reader = Reader::from_str(content);
        reader.trim_text(true);

        let mut parser = GiftiParser::default();
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(ref e) => parser.start(e)?,
                Event::Empty(ref e) => {
                    parser.start(e)?;
                    parser.end(e.name().as_ref())?;
                }
                Event::End(ref e) => parser.end(e.name().as_ref())?,
                Event::Text(e) => parser.text.push_str(&e.unescape()?),
                Event::CData(e) => parser.text.push_str(&String::from_utf8_lossy(&e.into_inner())),
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        parser.finish()
    }

    /// Write this GIfTI image to a file. The document is serialized completely before the file is created.
    /// If the file's name ends with ".gz", the output is GZip compressed.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let xml = self.to_xml()?;
        debug!("Writing GIfTI file '{}' with {} data arrays.", path.as_ref().display(), self.data_arrays.len());
        write_maybe_gz(path, &xml)
    }

    /// Serialize this GIfTI image to an XML document.
    pub fn to_xml(&self) -> Result<Vec<u8>> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        writer.write_event(Event::DocType(BytesText::from_escaped(GIFTI_DOCTYPE)))?;

        let num_arrays = self.data_arrays.len().to_string();
        let mut root = BytesStart::new("GIFTI");
        root.push_attribute(("Version", self.version.as_str()));
        root.push_attribute(("NumberOfDataArrays", num_arrays.as_str()));
        for (key, value) in &self.extra_attributes {
            root.push_attribute((key.as_str(), value.as_str()));
        }
        writer.write_event(Event::Start(root))?;

        write_metadata(&mut writer, &self.metadata)?;
        write_label_table(&mut writer, &self.label_table)?;
        for array in &self.data_arrays {
            write_data_array(&mut writer, array)?;
        }

        writer.write_event(Event::End(BytesEnd::new("GIFTI")))?;

        let mut xml = writer.into_inner();
        xml.push(b'\n');
        Ok(xml)
    }

    /// The first data array, which holds the vertex coordinates of a surface mesh.
    pub fn coordinate_array(&self) -> Result<&GiftiDataArray> {
        let array = self.data_arrays.first().ok_or_else(|| SurfwarpError::NotACoordinateArray(String::from("the file contains no data arrays")))?;
        array.check_coordinates()?;
        Ok(array)
    }

    /// Mutable access to the first data array, see [`GiftiImage::coordinate_array`].
    pub fn coordinate_array_mut(&mut self) -> Result<&mut GiftiDataArray> {
        let array = self.data_arrays.first_mut().ok_or_else(|| SurfwarpError::NotACoordinateArray(String::from("the file contains no data arrays")))?;
        array.check_coordinates()?;
        Ok(array)
    }
}

impl fmt::Display for GiftiImage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "GIfTI image version {} with {} data arrays.", self.version, self.data_arrays.len())
    }
}


/// Event driven state of the GIfTI XML reader.
#[derive(Default)]
struct GiftiParser {
    image: Option<GiftiImage>,
    declared_arrays: Option<usize>,
    array: Option<GiftiDataArray>,
    md_name: String,
    md_value: String,
    coord: Option<GiftiCoordSystem>,
    label: Option<GiftiLabel>,
    text: String,
}

impl GiftiParser {

    fn start(&mut self, e: &BytesStart) -> Result<()> {
        self.text.clear();
        match e.name().as_ref() {
            b"GIFTI" => {
                let mut image = GiftiImage::default();
                if let Some(version) = attribute(e, b"Version")? {
                    image.version = version;
                }
                if let Some(num) = attribute(e, b"NumberOfDataArrays")? {
                    self.declared_arrays = Some(parse_value::<usize>(&num, "NumberOfDataArrays")?);
                }
                image.extra_attributes = other_attributes(e, GIFTI_ROOT_ATTRIBUTES)?;
                self.image = Some(image);
            }
            b"DataArray" => {
                self.image()?;
                self.array = Some(data_array_from_attributes(e)?);
            }
            b"MD" => {
                self.md_name.clear();
                self.md_value.clear();
            }
            b"CoordinateSystemTransformMatrix" => self.coord = Some(GiftiCoordSystem::default()),
            b"Label" => self.label = Some(label_from_attributes(e)?),
            _ => {}
        }
        Ok(())
    }

    fn end(&mut self, name: &[u8]) -> Result<()> {
        let text = self.text.trim().to_string();
        self.text.clear();
        match name {
            b"Name" => self.md_name = text,
            b"Value" => self.md_value = text,
            b"MD" => {
                let entry = (self.md_name.clone(), self.md_value.clone());
                match self.array.as_mut() {
                    Some(array) => array.metadata.push(entry),
                    None => self.image()?.metadata.push(entry),
                }
            }
            b"DataSpace" => if let Some(coord) = self.coord.as_mut() { coord.data_space = text },
            b"TransformedSpace" => if let Some(coord) = self.coord.as_mut() { coord.transformed_space = text },
            b"MatrixData" => {
                if let Some(coord) = self.coord.as_mut() {
                    let values: Vec<f64> = text.split_whitespace().map(|v| parse_value::<f64>(v, "MatrixData")).collect::<Result<_>>()?;
                    if values.len() != 16 {
                        return Err(SurfwarpError::InvalidGiftiFormat(format!("MatrixData holds {} values, expected 16", values.len())));
                    }
                    for (idx, v) in values.iter().enumerate() {
                        coord.matrix[idx / 4][idx % 4] = *v;
                    }
                }
            }
            b"CoordinateSystemTransformMatrix" => {
                if let (Some(coord), Some(array)) = (self.coord.take(), self.array.as_mut()) {
                    array.coord_systems.push(coord);
                }
            }
            b"Label" => {
                if let Some(mut label) = self.label.take() {
                    label.label = text;
                    self.image()?.label_table.push(label);
                }
            }
            b"Data" => {
                let array = self.array.as_mut().ok_or_else(|| SurfwarpError::InvalidGiftiFormat(String::from("Data element outside of a DataArray")))?;
                array.data = decode_data(&text, array.datatype, array.encoding, array.endian)?;
            }
            b"DataArray" => {
                if let Some(array) = self.array.take() {
                    if array.data.len() != array.num_elements() {
                        return Err(SurfwarpError::InvalidGiftiFormat(format!("data array {} holds {} elements, but its dimensions {:?} require {}",
                            self.image()?.data_arrays.len(), array.data.len(), array.dims, array.num_elements())));
                    }
                    self.image()?.data_arrays.push(array);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn image(&mut self) -> Result<&mut GiftiImage> {
        self.image.as_mut().ok_or_else(|| SurfwarpError::InvalidGiftiFormat(String::from("missing GIFTI root element")))
    }

    fn finish(self) -> Result<GiftiImage> {
        let image = self.image.ok_or_else(|| SurfwarpError::InvalidGiftiFormat(String::from("missing GIFTI root element")))?;
        if let Some(declared) = self.declared_arrays {
            if declared != image.data_arrays.len() {
                warn!("GIfTI header declares {} data arrays, but {} were found.", declared, image.data_arrays.len());
            }
        }
        Ok(image)
    }
}


/// Get the unescaped value of an attribute, if present.
fn attribute(e: &BytesStart, key: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.as_ref() == key {
            return Ok(Some(attr.unescape_value()?.trim().to_string()));
        }
    }
    Ok(None)
}

/// All attributes whose names are not in `known`, in document order.
fn other_attributes(e: &BytesStart, known: &[&str]) -> Result<Vec<(String, String)>> {
    let mut other = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if !known.contains(&key.as_str()) {
            other.push((key, attr.unescape_value()?.into_owned()));
        }
    }
    Ok(other)
}

fn parse_value<T: std::str::FromStr>(value: &str, what: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| SurfwarpError::InvalidGiftiFormat(format!("invalid {} value '{}'", what, value)))
}

fn data_array_from_attributes(e: &BytesStart) -> Result<GiftiDataArray> {
    let required = |key: &[u8]| -> Result<String> {
        attribute(e, key)?.ok_or_else(|| SurfwarpError::InvalidGiftiFormat(format!("DataArray lacks the {} attribute", String::from_utf8_lossy(key))))
    };

    let datatype = GiftiDatatype::from_name(&required(b"DataType")?)?;
    let encoding = GiftiEncoding::from_name(&required(b"Encoding")?)?;
    let dimensionality: usize = parse_value(&required(b"Dimensionality")?, "Dimensionality")?;
    if dimensionality == 0 || dimensionality > 6 {
        return Err(SurfwarpError::InvalidGiftiFormat(format!("invalid Dimensionality {}", dimensionality)));
    }
    let mut dims = Vec::with_capacity(dimensionality);
    for idx in 0..dimensionality {
        let key = format!("Dim{}", idx);
        dims.push(parse_value(&required(key.as_bytes())?, &key)?);
    }
    if dims.iter().try_fold(1usize, |acc: usize, &d: &usize| acc.checked_mul(d)).is_none() {
        return Err(SurfwarpError::InvalidGiftiFormat(format!("dimensions {:?} are too large", dims)));
    }

    let endian = match attribute(e, b"Endian")? {
        Some(name) => GiftiEndian::from_name(&name)?,
        None => GiftiEndian::LittleEndian,
    };
    let indexing_order = match attribute(e, b"ArrayIndexingOrder")? {
        Some(name) => GiftiIndexingOrder::from_name(&name)?,
        None => GiftiIndexingOrder::RowMajorOrder,
    };

    Ok(GiftiDataArray {
        intent: attribute(e, b"Intent")?.unwrap_or_else(|| String::from("NIFTI_INTENT_NONE")),
        datatype,
        dims,
        encoding,
        endian,
        indexing_order,
        external_file_name: attribute(e, b"ExternalFileName")?.unwrap_or_default(),
        external_file_offset: attribute(e, b"ExternalFileOffset")?.unwrap_or_default(),
        metadata: Vec::new(),
        coord_systems: Vec::new(),
        data: GiftiData::empty(datatype),
        extra_attributes: other_attributes(e, GIFTI_DATA_ARRAY_ATTRIBUTES)?,
    })
}

fn label_from_attributes(e: &BytesStart) -> Result<GiftiLabel> {
    let key = match attribute(e, b"Key")?.or(attribute(e, b"Index")?) {
        Some(k) => parse_value(&k, "Label Key")?,
        None => return Err(SurfwarpError::InvalidGiftiFormat(String::from("Label lacks the Key attribute"))),
    };
    let color = |name: &[u8]| -> Result<Option<f32>> {
        attribute(e, name)?.map(|v| parse_value::<f32>(&v, "Label color")).transpose()
    };
    Ok(GiftiLabel {
        key,
        red: color(b"Red")?,
        green: color(b"Green")?,
        blue: color(b"Blue")?,
        alpha: color(b"Alpha")?,
        label: String::new(),
    })
}


/// Decode the text content of a `<Data>` element.
fn decode_data(text: &str, datatype: GiftiDatatype, encoding: GiftiEncoding, endian: GiftiEndian) -> Result<GiftiData> {
    match encoding {
        GiftiEncoding::Ascii => decode_ascii(text, datatype),
        GiftiEncoding::Base64Binary => {
            let bytes = decode_base64(text)?;
            decode_binary(&bytes, datatype, endian)
        }
        GiftiEncoding::GZipBase64Binary => {
            let compressed = decode_base64(text)?;
            let mut bytes = Vec::new();
            ZlibDecoder::new(&compressed[..]).read_to_end(&mut bytes)?;
            decode_binary(&bytes, datatype, endian)
        }
    }
}

fn decode_base64(text: &str) -> Result<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    Ok(BASE64.decode(compact)?)
}

fn decode_ascii(text: &str, datatype: GiftiDatatype) -> Result<GiftiData> {
    let tokens = text.split_whitespace();
    let data = match datatype {
        GiftiDatatype::Uint8 => GiftiData::Uint8(tokens.map(|t| parse_value(t, "ASCII data")).collect::<Result<_>>()?),
        GiftiDatatype::Int32 => GiftiData::Int32(tokens.map(|t| parse_value(t, "ASCII data")).collect::<Result<_>>()?),
        GiftiDatatype::Float32 => GiftiData::Float32(tokens.map(|t| parse_value(t, "ASCII data")).collect::<Result<_>>()?),
    };
    Ok(data)
}

fn decode_binary(bytes: &[u8], datatype: GiftiDatatype, endian: GiftiEndian) -> Result<GiftiData> {
    if bytes.len() % datatype.byte_size() != 0 {
        return Err(SurfwarpError::InvalidGiftiFormat(format!("{} bytes of binary data cannot hold {} values", bytes.len(), datatype.name())));
    }
    let count = bytes.len() / datatype.byte_size();
    let mut input = ByteOrdered::runtime(bytes, endian.endianness());

    let data = match datatype {
        GiftiDatatype::Uint8 => GiftiData::Uint8(bytes.to_vec()),
        GiftiDatatype::Int32 => {
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(input.read_i32()?);
            }
            GiftiData::Int32(values)
        }
        GiftiDatatype::Float32 => {
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(input.read_f32()?);
            }
            GiftiData::Float32(values)
        }
    };
    Ok(data)
}


/// Encode array data for a `<Data>` element, using the array's encoding and byte order.
fn encode_data(array: &GiftiDataArray) -> Result<String> {
    if array.encoding == GiftiEncoding::Ascii {
        let tokens: Vec<String> = match &array.data {
            GiftiData::Uint8(v) => v.iter().map(|x| x.to_string()).collect(),
            GiftiData::Int32(v) => v.iter().map(|x| x.to_string()).collect(),
            GiftiData::Float32(v) => v.iter().map(|x| x.to_string()).collect(),
        };
        return Ok(tokens.join(" "));
    }

    let mut output = ByteOrdered::runtime(Vec::with_capacity(array.data.len() * 4), array.endian.endianness());
    match &array.data {
        GiftiData::Uint8(v) => for x in v { output.write_u8(*x)?; },
        GiftiData::Int32(v) => for x in v { output.write_i32(*x)?; },
        GiftiData::Float32(v) => for x in v { output.write_f32(*x)?; },
    }
    let bytes = output.into_inner();

    let payload = if array.encoding == GiftiEncoding::GZipBase64Binary {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&bytes)?;
        enc.finish()?
    } else {
        bytes
    };
    Ok(BASE64.encode(payload))
}


fn write_text_element<W: Write>(writer: &mut Writer<W>, name: &str, text: &str) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn write_metadata<W: Write>(writer: &mut Writer<W>, metadata: &GiftiMetadata) -> Result<()> {
    if metadata.is_empty() {
        writer.write_event(Event::Empty(BytesStart::new("MetaData")))?;
        return Ok(());
    }
    writer.write_event(Event::Start(BytesStart::new("MetaData")))?;
    for (name, value) in metadata {
        writer.write_event(Event::Start(BytesStart::new("MD")))?;
        write_text_element(writer, "Name", name)?;
        write_text_element(writer, "Value", value)?;
        writer.write_event(Event::End(BytesEnd::new("MD")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("MetaData")))?;
    Ok(())
}

fn write_label_table<W: Write>(writer: &mut Writer<W>, labels: &[GiftiLabel]) -> Result<()> {
    if labels.is_empty() {
        writer.write_event(Event::Empty(BytesStart::new("LabelTable")))?;
        return Ok(());
    }
    writer.write_event(Event::Start(BytesStart::new("LabelTable")))?;
    for label in labels {
        let mut elem = BytesStart::new("Label");
        elem.push_attribute(("Key", label.key.to_string().as_str()));
        let colors = [("Red", label.red), ("Green", label.green), ("Blue", label.blue), ("Alpha", label.alpha)];
        for (name, value) in colors.iter() {
            if let Some(v) = value {
                elem.push_attribute((*name, v.to_string().as_str()));
            }
        }
        writer.write_event(Event::Start(elem))?;
        writer.write_event(Event::Text(BytesText::new(&label.label)))?;
        writer.write_event(Event::End(BytesEnd::new("Label")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("LabelTable")))?;
    Ok(())
}

fn write_data_array<W: Write>(writer: &mut Writer<W>, array: &GiftiDataArray) -> Result<()> {
    if array.data.datatype() != array.datatype || array.data.len() != array.num_elements() {
        return Err(SurfwarpError::InvalidGiftiFormat(format!("data of {} does not match its declared type and dimensions", array)));
    }

    let mut elem = BytesStart::new("DataArray");
    elem.push_attribute(("Intent", array.intent.as_str()));
    elem.push_attribute(("DataType", array.datatype.name()));
    elem.push_attribute(("ArrayIndexingOrder", array.indexing_order.name()));
    elem.push_attribute(("Dimensionality", array.dims.len().to_string().as_str()));
    for (idx, dim) in array.dims.iter().enumerate() {
        elem.push_attribute((format!("Dim{}", idx).as_str(), dim.to_string().as_str()));
    }
    elem.push_attribute(("Encoding", array.encoding.name()));
    elem.push_attribute(("Endian", array.endian.name()));
    elem.push_attribute(("ExternalFileName", array.external_file_name.as_str()));
    elem.push_attribute(("ExternalFileOffset", array.external_file_offset.as_str()));
    for (key, value) in &array.extra_attributes {
        elem.push_attribute((key.as_str(), value.as_str()));
    }
    writer.write_event(Event::Start(elem))?;

    write_metadata(writer, &array.metadata)?;
    for coord in &array.coord_systems {
        writer.write_event(Event::Start(BytesStart::new("CoordinateSystemTransformMatrix")))?;
        write_text_element(writer, "DataSpace", &coord.data_space)?;
        write_text_element(writer, "TransformedSpace", &coord.transformed_space)?;
        let matrix: Vec<String> = coord.matrix.iter().flat_map(|row| row.iter().map(|v| v.to_string())).collect();
        write_text_element(writer, "MatrixData", &matrix.join(" "))?;
        writer.write_event(Event::End(BytesEnd::new("CoordinateSystemTransformMatrix")))?;
    }
    write_text_element(writer, "Data", &encode_data(array)?)?;

    writer.write_event(Event::End(BytesEnd::new("DataArray")))?;
    Ok(())
}
