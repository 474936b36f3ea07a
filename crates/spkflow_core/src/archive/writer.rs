//! Streaming archive encoder.

use std::io::Write;

use super::error::{FormatError, FormatResult};
use super::types::{Matrix, Payload, Record, Vector};
use super::wav;

/// Marker byte preceding every dimension field.
pub(crate) const SIZE_MARKER: u8 = 0x04;

/// Binary mode header written after the key.
pub(crate) const BINARY_HEADER: &[u8; 2] = b"\0B";

/// Writes records one at a time to any byte sink.
///
/// Nothing about the stream length needs to be known up front; each record
/// is self-delimiting.
pub struct ArchiveWriter<W: Write> {
    inner: W,
    records_written: usize,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            records_written: 0,
        }
    }

    /// Append one record.
    pub fn write_record(&mut self, record: &Record) -> FormatResult<()> {
        encode(&mut self.inner, record)?;
        self.records_written += 1;
        Ok(())
    }

    /// Number of records written so far.
    pub fn records_written(&self) -> usize {
        self.records_written
    }

    pub fn flush(&mut self) -> FormatResult<()> {
        self.inner
            .flush()
            .map_err(|e| FormatError::io("flushing archive", e))
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Check that a key can be written: non-empty and free of whitespace.
pub fn validate_key(key: &str) -> FormatResult<()> {
    if key.is_empty() {
        return Err(FormatError::InvalidKey {
            key: key.to_string(),
            reason: "key is empty",
        });
    }
    if key.bytes().any(|b| b.is_ascii_whitespace()) {
        return Err(FormatError::InvalidKey {
            key: key.to_string(),
            reason: "key contains whitespace",
        });
    }
    Ok(())
}

/// Encode a single record onto `out`.
///
/// The record is rendered into memory first and written with one call, so
/// a failed write never leaves half a header in a pipe that is still alive.
pub fn encode<W: Write>(out: &mut W, record: &Record) -> FormatResult<()> {
    let bytes = encode_to_vec(record)?;
    out.write_all(&bytes)
        .map_err(|e| FormatError::io("writing record", e))
}

/// Encode every record of an iterator, returning how many were written.
pub fn encode_all<'a, W, I>(out: &mut W, records: I) -> FormatResult<usize>
where
    W: Write,
    I: IntoIterator<Item = &'a Record>,
{
    let mut count = 0;
    for record in records {
        encode(out, record)?;
        count += 1;
    }
    Ok(count)
}

fn encode_to_vec(record: &Record) -> FormatResult<Vec<u8>> {
    validate_key(&record.key)?;

    let mut buf = Vec::with_capacity(record.key.len() + 16);
    buf.extend_from_slice(record.key.as_bytes());
    buf.push(b' ');

    match &record.payload {
        Payload::Matrix(m) => encode_matrix(&mut buf, &record.key, m)?,
        Payload::Vector(v) => encode_vector(&mut buf, &record.key, v)?,
        Payload::Audio(blob) => buf.extend_from_slice(&wav::encode(&record.key, blob)?),
    }
    Ok(buf)
}

fn encode_matrix(buf: &mut Vec<u8>, key: &str, m: &Matrix) -> FormatResult<()> {
    let (rows, cols) = m.shape();
    buf.extend_from_slice(BINARY_HEADER);
    match m {
        Matrix::F32(_) => buf.extend_from_slice(b"FM "),
        Matrix::F64(_) => buf.extend_from_slice(b"DM "),
    }
    push_dim(buf, key, rows)?;
    push_dim(buf, key, cols)?;

    // `iter` walks in logical row-major order whatever the memory layout.
    match m {
        Matrix::F32(a) => a.iter().for_each(|x| buf.extend_from_slice(&x.to_le_bytes())),
        Matrix::F64(a) => a.iter().for_each(|x| buf.extend_from_slice(&x.to_le_bytes())),
    }
    Ok(())
}

fn encode_vector(buf: &mut Vec<u8>, key: &str, v: &Vector) -> FormatResult<()> {
    buf.extend_from_slice(BINARY_HEADER);
    match v {
        Vector::F32(_) => buf.extend_from_slice(b"FV "),
        Vector::F64(_) => buf.extend_from_slice(b"DV "),
    }
    push_dim(buf, key, v.len())?;

    match v {
        Vector::F32(a) => a.iter().for_each(|x| buf.extend_from_slice(&x.to_le_bytes())),
        Vector::F64(a) => a.iter().for_each(|x| buf.extend_from_slice(&x.to_le_bytes())),
    }
    Ok(())
}

fn push_dim(buf: &mut Vec<u8>, key: &str, dim: usize) -> FormatResult<()> {
    let dim = i32::try_from(dim)
        .map_err(|_| FormatError::bad_shape(key, format!("dimension {} exceeds i32", dim)))?;
    buf.push(SIZE_MARKER);
    buf.extend_from_slice(&dim.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn matrix_bytes_match_toolkit_layout() {
        let rec = Record::matrix("abc", array![[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]]);
        let mut out = Vec::new();
        encode(&mut out, &rec).unwrap();

        assert_eq!(&out[..4], b"abc ");
        assert_eq!(&out[4..9], b"\0BFM ");
        assert_eq!(out[9], SIZE_MARKER);
        assert_eq!(i32::from_le_bytes([out[10], out[11], out[12], out[13]]), 3);
        assert_eq!(out[14], SIZE_MARKER);
        assert_eq!(i32::from_le_bytes([out[15], out[16], out[17], out[18]]), 2);
        assert_eq!(out.len(), 19 + 6 * 4);
        assert_eq!(&out[19..23], &1.0f32.to_le_bytes());
        assert_eq!(&out[out.len() - 4..], &6.0f32.to_le_bytes());
    }

    #[test]
    fn transposed_view_is_written_in_logical_order() {
        let m = array![[1.0f64, 2.0], [3.0, 4.0]].reversed_axes();
        let rec = Record::matrix("t", m.to_owned());
        let mut out = Vec::new();
        encode(&mut out, &rec).unwrap();

        // Logical rows of the transpose are [1, 3] and [2, 4].
        let data = &out[2 + 5 + 10..];
        assert_eq!(&data[8..16], &3.0f64.to_le_bytes());
    }

    #[test]
    fn vector_header() {
        let rec = Record::vector("spk1", array![0.5f64, -0.5]);
        let mut out = Vec::new();
        encode(&mut out, &rec).unwrap();

        assert_eq!(&out[..5], b"spk1 ");
        assert_eq!(&out[5..10], b"\0BDV ");
        assert_eq!(out.len(), 10 + 5 + 16);
    }

    #[test]
    fn rejects_bad_keys() {
        let mut out = Vec::new();
        let empty = Record::vector("", array![1.0f32]);
        assert!(matches!(
            encode(&mut out, &empty),
            Err(FormatError::InvalidKey { .. })
        ));

        let spaced = Record::vector("a b", array![1.0f32]);
        assert!(matches!(
            encode(&mut out, &spaced),
            Err(FormatError::InvalidKey { .. })
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn writer_counts_records() {
        let mut writer = ArchiveWriter::new(Vec::new());
        writer.write_record(&Record::vector("a", array![1.0f32])).unwrap();
        writer.write_record(&Record::vector("b", array![2.0f32])).unwrap();
        assert_eq!(writer.records_written(), 2);
        assert!(!writer.into_inner().is_empty());
    }
}
