//! Binary codec shared by the `.khs` (state) and `.khd` (data) file formats.
//!
//! Little-endian throughout, built on `byteorder`'s [`ReadBytesExt`]/[`WriteBytesExt`],
//! mirroring the length-prefixed, explicitly-typed binary records this corpus already
//! uses for its own on-disk formats. Every higher-level object (a `Vec<f64>`, an order
//! table) is prefixed with a fixed-width size field so the reader can allocate before
//! reading the body.

use std::io::{Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use crate::error::{Error, Result};

/// 8-byte magic prefixing every `.khs`/`.khd` file.
pub const MAGIC: &[u8; 8] = b"KAKUHEN\0";

/// Type-or-size tag for an `f64` value stream.
pub const TOS_F64: i16 = 1;
/// Type-or-size tag for a `usize` (stored as `u64`) size stream.
pub const TOS_SIZE: i16 = 2;
/// Type-or-size tag for a `u64` count stream.
pub const TOS_COUNT: i16 = 3;

/// Algorithm discriminant written into a file's header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AlgId {
    /// VEGAS sampler.
    Vegas = 0,
    /// BASIN sampler.
    Basin = 1,
}

impl AlgId {
    fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Vegas),
            1 => Ok(Self::Basin),
            other => Err(Error::HeaderMismatch {
                detail: format!("unrecognized algorithm id {other}"),
            }),
        }
    }
}

/// File-kind discriminant written into a file's header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FileKind {
    /// Sampler state: grid (and order, for BASIN).
    State = 0,
    /// Accumulated per-cell data and the result combiner.
    Data = 1,
}

impl FileKind {
    fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::State),
            1 => Ok(Self::Data),
            other => Err(Error::HeaderMismatch {
                detail: format!("unrecognized file kind {other}"),
            }),
        }
    }
}

/// Writes the common `.khs`/`.khd` header: magic, algorithm tag, file-kind tag, and the
/// three type-or-size tags.
///
/// # Errors
///
/// Propagates any I/O failure from `w`.
pub fn write_header<W: Write>(mut w: W, alg_id: AlgId, kind: FileKind) -> Result<()> {
    w.write_all(MAGIC)?;
    w.write_u8(alg_id as u8)?;
    w.write_u8(kind as u8)?;
    w.write_i16::<LE>(TOS_F64)?;
    w.write_i16::<LE>(TOS_SIZE)?;
    w.write_i16::<LE>(TOS_COUNT)?;
    Ok(())
}

/// Reads and validates the common header, returning the algorithm and file-kind tags
/// found in it.
///
/// # Errors
///
/// Returns [`Error::HeaderMismatch`] if the magic bytes or any type-or-size tag don't
/// match what this codec writes, or propagates an I/O failure.
pub fn read_header<R: Read>(mut r: R) -> Result<(AlgId, FileKind)> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::HeaderMismatch {
            detail: "magic bytes do not match 'KAKUHEN\\0'".to_string(),
        });
    }

    let alg_id = AlgId::from_u8(r.read_u8()?)?;
    let kind = FileKind::from_u8(r.read_u8()?)?;

    let val_tos = r.read_i16::<LE>()?;
    let size_tos = r.read_i16::<LE>()?;
    let count_tos = r.read_i16::<LE>()?;
    if (val_tos, size_tos, count_tos) != (TOS_F64, TOS_SIZE, TOS_COUNT) {
        return Err(Error::HeaderMismatch {
            detail: format!(
                "type tags ({val_tos}, {size_tos}, {count_tos}) do not match this build's \
                 ({TOS_F64}, {TOS_SIZE}, {TOS_COUNT})"
            ),
        });
    }

    Ok((alg_id, kind))
}

/// Writes one `usize`, widened to a little-endian `u64`.
///
/// # Errors
///
/// Propagates any I/O failure from `w`.
pub fn write_size<W: Write>(mut w: W, v: usize) -> Result<()> {
    w.write_u64::<LE>(v as u64)?;
    Ok(())
}

/// Reads one `usize`, narrowed down from a little-endian `u64`.
///
/// # Errors
///
/// Propagates any I/O failure from `r`.
pub fn read_size<R: Read>(mut r: R) -> Result<usize> {
    Ok(r.read_u64::<LE>()? as usize)
}

/// Writes one little-endian `u64` count.
///
/// # Errors
///
/// Propagates any I/O failure from `w`.
pub fn write_count<W: Write>(mut w: W, v: u64) -> Result<()> {
    w.write_u64::<LE>(v)?;
    Ok(())
}

/// Reads one little-endian `u64` count.
///
/// # Errors
///
/// Propagates any I/O failure from `r`.
pub fn read_count<R: Read>(mut r: R) -> Result<u64> {
    Ok(r.read_u64::<LE>()?)
}

/// Writes one little-endian `f64`.
///
/// # Errors
///
/// Propagates any I/O failure from `w`.
pub fn write_f64<W: Write>(mut w: W, v: f64) -> Result<()> {
    w.write_f64::<LE>(v)?;
    Ok(())
}

/// Reads one little-endian `f64`.
///
/// # Errors
///
/// Propagates any I/O failure from `r`.
pub fn read_f64<R: Read>(mut r: R) -> Result<f64> {
    Ok(r.read_f64::<LE>()?)
}

/// Writes a flat `f64` array with no length prefix (the caller already knows the shape
/// from the header's size fields).
///
/// # Errors
///
/// Propagates any I/O failure from `w`.
pub fn write_f64_array<W: Write>(mut w: W, values: &[f64]) -> Result<()> {
    for &v in values {
        w.write_f64::<LE>(v)?;
    }
    Ok(())
}

/// Reads exactly `len` `f64` values into a freshly allocated vector.
///
/// # Errors
///
/// Propagates any I/O failure from `r`.
pub fn read_f64_array<R: Read>(mut r: R, len: usize) -> Result<Vec<f64>> {
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(r.read_f64::<LE>()?);
    }
    Ok(out)
}

/// Writes a length-prefixed array of `usize` (each widened to `u64`), used for BASIN's
/// order table.
///
/// # Errors
///
/// Propagates any I/O failure from `w`.
pub fn write_size_array<W: Write>(mut w: W, values: &[usize]) -> Result<()> {
    write_size(&mut w, values.len())?;
    for &v in values {
        write_size(&mut w, v)?;
    }
    Ok(())
}

/// Reads a length-prefixed array of `usize`.
///
/// # Errors
///
/// Propagates any I/O failure from `r`.
pub fn read_size_array<R: Read>(mut r: R) -> Result<Vec<usize>> {
    let len = read_size(&mut r)?;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(read_size(&mut r)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let mut buf = Vec::new();
        write_header(&mut buf, AlgId::Basin, FileKind::Data).unwrap();
        let (alg, kind) = read_header(&buf[..]).unwrap();
        assert_eq!(alg, AlgId::Basin);
        assert_eq!(kind, FileKind::Data);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = Vec::new();
        write_header(&mut buf, AlgId::Vegas, FileKind::State).unwrap();
        buf[0] = b'X';
        assert!(matches!(read_header(&buf[..]), Err(Error::HeaderMismatch { .. })));
    }

    #[test]
    fn rejects_mismatched_type_tags() {
        let mut buf = Vec::new();
        write_header(&mut buf, AlgId::Vegas, FileKind::State).unwrap();
        // flip the val_tos byte right after the 10-byte magic+alg+kind prefix
        buf[10] = buf[10].wrapping_add(1);
        assert!(matches!(read_header(&buf[..]), Err(Error::HeaderMismatch { .. })));
    }

    #[test]
    fn f64_array_round_trips() {
        let values = vec![1.0, -2.5, 0.0, std::f64::consts::PI];
        let mut buf = Vec::new();
        write_f64_array(&mut buf, &values).unwrap();
        let back = read_f64_array(&buf[..], values.len()).unwrap();
        assert_eq!(values, back);
    }

    #[test]
    fn size_array_round_trips() {
        let values = vec![0usize, 1, 41, 1_000_000];
        let mut buf = Vec::new();
        write_size_array(&mut buf, &values).unwrap();
        let back = read_size_array(&buf[..]).unwrap();
        assert_eq!(values, back);
    }
}
