//! Minimal reader/writer for NumPy `.npy` arrays.
//!
//! Reads flat integer arrays (1-D or a single row/column) and writes
//! little-endian `f64` arrays. Header layout follows the NPY format:
//! magic, version, header length, then a Python dict literal padded with
//! spaces to a 64-byte boundary and terminated by `\n`.

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

const MAGIC: &[u8; 6] = b"\x93NUMPY";
const HEADER_ALIGN: usize = 64;
/// Larger headers are treated as corrupt
const MAX_HEADER_LEN: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum NpyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Not an NPY file")]
    BadMagic,
    #[error("Unsupported NPY version {0}.{1}")]
    UnsupportedVersion(u8, u8),
    #[error("Malformed NPY header: {0}")]
    Header(String),
    #[error("Unsupported dtype '{0}', expected an integer type")]
    UnsupportedDtype(String),
    #[error("Expected a flat array, found shape {0:?}")]
    NotFlat(Vec<usize>),
    #[error("Negative sample index {value} at position {index}")]
    NegativeSample { index: usize, value: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntKind {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
}

impl IntKind {
    fn size(&self) -> usize {
        match self {
            IntKind::U8 | IntKind::I8 => 1,
            IntKind::U16 | IntKind::I16 => 2,
            IntKind::U32 | IntKind::I32 => 4,
            IntKind::U64 | IntKind::I64 => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    endian: Endian,
    kind: IntKind,
    shape: Vec<usize>,
}

/// A flat array of sample indices plus the shape it was stored with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleIndices {
    pub shape: Vec<usize>,
    pub values: Vec<u64>,
}

fn parse_dtype(descr: &str) -> Result<(Endian, IntKind), NpyError> {
    let unsupported = || NpyError::UnsupportedDtype(descr.to_string());

    let mut chars = descr.chars();
    let endian = match chars.next() {
        Some('<') | Some('|') | Some('=') => Endian::Little,
        Some('>') => Endian::Big,
        _ => return Err(unsupported()),
    };
    let kind = match chars.as_str() {
        "u1" => IntKind::U8,
        "u2" => IntKind::U16,
        "u4" => IntKind::U32,
        "u8" => IntKind::U64,
        "i1" => IntKind::I8,
        "i2" => IntKind::I16,
        "i4" => IntKind::I32,
        "i8" => IntKind::I64,
        _ => return Err(unsupported()),
    };
    Ok((endian, kind))
}

/// Value following `'key':` in the header dict, up to the next top-level comma or brace
fn dict_value<'a>(header: &'a str, key: &str) -> Result<&'a str, NpyError> {
    let needle = format!("'{}':", key);
    let start = header
        .find(&needle)
        .map(|i| i + needle.len())
        .ok_or_else(|| NpyError::Header(format!("missing '{}'", key)))?;
    let rest = header[start..].trim_start();

    let end = if rest.starts_with('(') {
        rest.find(')').map(|i| i + 1)
    } else {
        rest.find([',', '}'])
    }
    .ok_or_else(|| NpyError::Header(format!("unterminated '{}'", key)))?;

    Ok(rest[..end].trim())
}

fn parse_header(text: &str) -> Result<Header, NpyError> {
    let descr = dict_value(text, "descr")?.trim_matches(['\'', '"']);
    let (endian, kind) = parse_dtype(descr)?;

    // Fortran order makes no difference for a flat array
    match dict_value(text, "fortran_order")? {
        "True" | "False" => {}
        other => return Err(NpyError::Header(format!("bad fortran_order '{}'", other))),
    }

    let shape_text = dict_value(text, "shape")?;
    let shape = shape_text
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| NpyError::Header(format!("bad shape {}", shape_text)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if shape.iter().filter(|&&d| d != 1).count() > 1 || shape.is_empty() {
        return Err(NpyError::NotFlat(shape));
    }

    Ok(Header { endian, kind, shape })
}

/// Parse the header block; also returns the offset of the first data byte
fn read_header<R: Read>(reader: &mut R) -> Result<(Header, u64), NpyError> {
    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(NpyError::BadMagic);
    }

    let major = reader.read_u8()?;
    let minor = reader.read_u8()?;
    let (header_len, len_field) = match major {
        1 => (reader.read_u16::<LittleEndian>()? as usize, 2),
        2 | 3 => (reader.read_u32::<LittleEndian>()? as usize, 4),
        _ => return Err(NpyError::UnsupportedVersion(major, minor)),
    };
    if header_len > MAX_HEADER_LEN {
        return Err(NpyError::Header(format!(
            "header length {} exceeds {} bytes",
            header_len, MAX_HEADER_LEN
        )));
    }

    let mut raw = vec![0u8; header_len];
    reader.read_exact(&mut raw)?;
    let text = String::from_utf8_lossy(&raw);
    let offset = (MAGIC.len() + 2 + len_field + header_len) as u64;
    Ok((parse_header(&text)?, offset))
}

/// Number of elements `shape` declares, checked against the bytes actually present
fn element_count(shape: &[usize], item_size: usize, available: u64) -> Result<usize, NpyError> {
    let count = shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d));
    let needed = count.and_then(|c| c.checked_mul(item_size));

    match (count, needed) {
        (Some(count), Some(needed)) if needed as u64 <= available => Ok(count),
        _ => Err(NpyError::Header(format!(
            "shape {:?} needs more than the {} data bytes present",
            shape, available
        ))),
    }
}

fn read_values<R: Read, B: ByteOrder>(
    reader: &mut R,
    kind: IntKind,
    count: usize,
) -> Result<Vec<u64>, NpyError> {
    let signed = |values: Vec<i64>| -> Result<Vec<u64>, NpyError> {
        values
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                u64::try_from(value).map_err(|_| NpyError::NegativeSample { index, value })
            })
            .collect()
    };

    match kind {
        IntKind::U8 => {
            let mut buf = vec![0u8; count];
            reader.read_exact(&mut buf)?;
            Ok(buf.into_iter().map(u64::from).collect())
        }
        IntKind::U16 => {
            let mut buf = vec![0u16; count];
            reader.read_u16_into::<B>(&mut buf)?;
            Ok(buf.into_iter().map(u64::from).collect())
        }
        IntKind::U32 => {
            let mut buf = vec![0u32; count];
            reader.read_u32_into::<B>(&mut buf)?;
            Ok(buf.into_iter().map(u64::from).collect())
        }
        IntKind::U64 => {
            let mut buf = vec![0u64; count];
            reader.read_u64_into::<B>(&mut buf)?;
            Ok(buf)
        }
        IntKind::I8 => {
            let mut buf = vec![0i8; count];
            reader.read_i8_into(&mut buf)?;
            signed(buf.into_iter().map(i64::from).collect())
        }
        IntKind::I16 => {
            let mut buf = vec![0i16; count];
            reader.read_i16_into::<B>(&mut buf)?;
            signed(buf.into_iter().map(i64::from).collect())
        }
        IntKind::I32 => {
            let mut buf = vec![0i32; count];
            reader.read_i32_into::<B>(&mut buf)?;
            signed(buf.into_iter().map(i64::from).collect())
        }
        IntKind::I64 => {
            let mut buf = vec![0i64; count];
            reader.read_i64_into::<B>(&mut buf)?;
            signed(buf)
        }
    }
}

/// Read a flat integer `.npy` array as non-negative sample indices
pub fn read_sample_indices(path: &Path) -> Result<SampleIndices, NpyError> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let (header, offset) = read_header(&mut reader)?;
    let count = element_count(&header.shape, header.kind.size(), file_len.saturating_sub(offset))?;

    let values = match header.endian {
        Endian::Little => read_values::<_, LittleEndian>(&mut reader, header.kind, count)?,
        Endian::Big => read_values::<_, BigEndian>(&mut reader, header.kind, count)?,
    };

    Ok(SampleIndices {
        shape: header.shape,
        values,
    })
}

fn shape_literal(shape: &[usize]) -> String {
    match shape {
        [single] => format!("({},)", single),
        dims => format!(
            "({})",
            dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
        ),
    }
}

/// Encode the header block (magic through padded dict) for an `<f8` array
fn f64_header(shape: &[usize]) -> Vec<u8> {
    let dict = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': {}, }}",
        shape_literal(shape)
    );

    // magic + version + u16 length + dict + trailing newline
    let unpadded = MAGIC.len() + 2 + 2 + dict.len() + 1;
    let padding = (HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN;
    let header_len = dict.len() + padding + 1;

    let mut out = Vec::with_capacity(unpadded + padding);
    out.extend_from_slice(MAGIC);
    out.push(1);
    out.push(0);
    out.extend_from_slice(&(header_len as u16).to_le_bytes());
    out.extend_from_slice(dict.as_bytes());
    out.extend(std::iter::repeat(b' ').take(padding));
    out.push(b'\n');
    out
}

/// Write `values` as a little-endian `f64` array with the given shape
pub fn write_f64(path: &Path, shape: &[usize], values: &[f64]) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&f64_header(shape))?;
    for &v in values {
        writer.write_f64::<LittleEndian>(v)?;
    }
    writer.flush()
}
