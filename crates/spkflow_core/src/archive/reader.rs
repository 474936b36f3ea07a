//! Lazy archive decoder.
//!
//! Records are produced one at a time as bytes arrive, so a consumer can
//! act on record `k` before record `k + 1` has been written by the producer.

use std::io::{self, BufReader, Read};

use ndarray::{Array1, Array2};

use super::error::{FormatError, FormatResult};
use super::types::{Matrix, Payload, Record, Vector};
use super::wav;
use super::writer::{BINARY_HEADER, SIZE_MARKER};

/// Decodes records from a byte stream.
///
/// Iteration ends when the stream closes at a record boundary. After an
/// error the reader yields nothing further; it is not restartable.
pub struct ArchiveReader<R: Read> {
    inner: R,
    finished: bool,
    records_read: usize,
}

impl<R: Read> ArchiveReader<R> {
    /// Wrap a reader. Callers reading from pipes or files should pass a
    /// buffered reader; [`decode_stream`] does that for them.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            finished: false,
            records_read: 0,
        }
    }

    pub fn records_read(&self) -> usize {
        self.records_read
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read the next record, `Ok(None)` on a clean end of stream.
    pub fn read_record(&mut self) -> FormatResult<Option<Record>> {
        let Some(key) = self.read_key()? else {
            return Ok(None);
        };

        let mut lead = [0u8; 2];
        self.fill(&mut lead, &key, "payload header")?;

        let payload = if &lead == BINARY_HEADER {
            let mut token = [0u8; 3];
            self.fill(&mut token, &key, "type token")?;
            match &token {
                b"FM " => Payload::Matrix(self.read_matrix(&key, 4)?),
                b"DM " => Payload::Matrix(self.read_matrix(&key, 8)?),
                b"FV " => Payload::Vector(self.read_vector(&key, 4)?),
                b"DV " => Payload::Vector(self.read_vector(&key, 8)?),
                _ => {
                    return Err(FormatError::UnsupportedType {
                        key,
                        token: String::from_utf8_lossy(&token).into_owned(),
                    })
                }
            }
        } else if &lead == b"RI" {
            let mut rest = [0u8; 2];
            self.fill(&mut rest, &key, "RIFF tag")?;
            if &rest != b"FF" {
                return Err(FormatError::bad_audio(&key, "missing RIFF tag"));
            }
            let mut size = [0u8; 4];
            self.fill(&mut size, &key, "RIFF size")?;
            let body = self.take_exact(u32::from_le_bytes(size) as usize, &key, "audio data")?;
            let mut riff = Vec::with_capacity(8 + body.len());
            riff.extend_from_slice(b"RIFF");
            riff.extend_from_slice(&size);
            riff.extend_from_slice(&body);
            Payload::Audio(wav::decode(&key, &riff)?)
        } else {
            return Err(FormatError::UnsupportedType {
                key,
                token: String::from_utf8_lossy(&lead).into_owned(),
            });
        };

        self.records_read += 1;
        Ok(Some(Record { key, payload }))
    }

    /// Read a key terminated by a single space. Leading whitespace (such as
    /// the newline that ends a text-mode record) is skipped.
    fn read_key(&mut self) -> FormatResult<Option<String>> {
        let mut key = Vec::new();
        loop {
            let Some(byte) = self.next_byte()? else {
                if key.is_empty() {
                    return Ok(None);
                }
                return Err(FormatError::Truncated {
                    key: String::from_utf8_lossy(&key).into_owned(),
                    what: "key",
                    expected: key.len() + 1,
                    got: key.len(),
                });
            };

            match byte {
                b' ' if !key.is_empty() => break,
                b if b.is_ascii_whitespace() && key.is_empty() => continue,
                b if b.is_ascii_whitespace() => {
                    return Err(FormatError::InvalidKey {
                        key: String::from_utf8_lossy(&key).into_owned(),
                        reason: "key not terminated by a space",
                    })
                }
                b => key.push(b),
            }
        }

        String::from_utf8(key).map(Some).map_err(|e| FormatError::InvalidKey {
            key: String::from_utf8_lossy(e.as_bytes()).into_owned(),
            reason: "key is not UTF-8",
        })
    }

    fn read_matrix(&mut self, key: &str, width: usize) -> FormatResult<Matrix> {
        let rows = self.read_dim(key)?;
        let cols = self.read_dim(key)?;
        let len = rows
            .checked_mul(cols)
            .ok_or_else(|| FormatError::bad_shape(key, format!("{} x {} overflows", rows, cols)))?;
        let bytes = self.take_exact(byte_len(key, len, width)?, key, "matrix data")?;

        let shape_err =
            |e: ndarray::ShapeError| FormatError::bad_shape(key, format!("{} x {}: {}", rows, cols, e));
        if width == 4 {
            Array2::from_shape_vec((rows, cols), floats_f32(&bytes))
                .map(Matrix::F32)
                .map_err(shape_err)
        } else {
            Array2::from_shape_vec((rows, cols), floats_f64(&bytes))
                .map(Matrix::F64)
                .map_err(shape_err)
        }
    }

    fn read_vector(&mut self, key: &str, width: usize) -> FormatResult<Vector> {
        let dim = self.read_dim(key)?;
        let bytes = self.take_exact(byte_len(key, dim, width)?, key, "vector data")?;
        if width == 4 {
            Ok(Vector::F32(Array1::from(floats_f32(&bytes))))
        } else {
            Ok(Vector::F64(Array1::from(floats_f64(&bytes))))
        }
    }

    fn read_dim(&mut self, key: &str) -> FormatResult<usize> {
        let mut field = [0u8; 5];
        self.fill(&mut field, key, "dimension")?;
        if field[0] != SIZE_MARKER {
            return Err(FormatError::BadSizeMarker {
                key: key.to_string(),
                found: field[0],
            });
        }
        let dim = i32::from_le_bytes([field[1], field[2], field[3], field[4]]);
        usize::try_from(dim).map_err(|_| FormatError::bad_shape(key, format!("negative dimension {}", dim)))
    }

    /// Read exactly `len` bytes. The buffer grows with the data actually
    /// received, so a corrupt header cannot force a huge allocation.
    fn take_exact(&mut self, len: usize, key: &str, what: &'static str) -> FormatResult<Vec<u8>> {
        let mut buf = Vec::new();
        (&mut self.inner)
            .take(len as u64)
            .read_to_end(&mut buf)
            .map_err(|e| FormatError::io("reading record", e))?;
        if buf.len() < len {
            return Err(FormatError::Truncated {
                key: key.to_string(),
                what,
                expected: len,
                got: buf.len(),
            });
        }
        Ok(buf)
    }

    fn fill(&mut self, buf: &mut [u8], key: &str, what: &'static str) -> FormatResult<()> {
        let mut got = 0;
        while got < buf.len() {
            match self.inner.read(&mut buf[got..]) {
                Ok(0) => {
                    return Err(FormatError::Truncated {
                        key: key.to_string(),
                        what,
                        expected: buf.len(),
                        got,
                    })
                }
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(FormatError::io("reading record", e)),
            }
        }
        Ok(())
    }

    fn next_byte(&mut self) -> FormatResult<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(FormatError::io("reading key", e)),
            }
        }
    }
}

impl<R: Read> Iterator for ArchiveReader<R> {
    type Item = FormatResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Decode a stream lazily through a buffered reader.
pub fn decode_stream<R: Read>(reader: R) -> ArchiveReader<BufReader<R>> {
    ArchiveReader::new(BufReader::new(reader))
}

/// Decode every record of an in-memory archive.
pub fn decode_all(bytes: &[u8]) -> FormatResult<Vec<Record>> {
    ArchiveReader::new(bytes).collect()
}

fn byte_len(key: &str, count: usize, width: usize) -> FormatResult<usize> {
    count
        .checked_mul(width)
        .ok_or_else(|| FormatError::bad_shape(key, format!("{} elements overflow", count)))
}

fn floats_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn floats_f64(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::types::AudioBlob;
    use crate::archive::writer::encode_all;
    use ndarray::array;

    fn encoded(records: &[Record]) -> Vec<u8> {
        let mut out = Vec::new();
        encode_all(&mut out, records).unwrap();
        out
    }

    #[test]
    fn mixed_stream_round_trips_in_order() {
        let records = vec![
            Record::matrix("utt0", array![[0.1f32, f32::MIN_POSITIVE], [1e30, -0.0]]),
            Record::vector("spk0", array![1.0f64 / 3.0, -2.5]),
            Record::matrix("utt1", Array2::<f64>::zeros((0, 13))),
            Record::audio("abc", AudioBlob::new(vec![1.0, -2.0, 3.0], 8000)),
            Record::vector("empty", Array1::<f32>::zeros(0)),
        ];

        let decoded = decode_all(&encoded(&records)).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn float_bits_are_preserved() {
        let values = [f32::EPSILON, 1.0 + f32::EPSILON, -123.456, f32::MAX];
        let rec = Record::vector("v", Array1::from(values.to_vec()));
        let decoded = decode_all(&encoded(&[rec])).unwrap();

        let Payload::Vector(Vector::F32(v)) = &decoded[0].payload else {
            panic!("expected f32 vector");
        };
        for (a, b) in v.iter().zip(values.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn is_lazy() {
        let bytes = encoded(&[
            Record::vector("a", array![1.0f32]),
            Record::vector("b", array![2.0f32]),
        ]);
        // Second record cut short: the first must still come out intact.
        let cut = &bytes[..bytes.len() - 2];
        let mut reader = ArchiveReader::new(cut);

        assert_eq!(reader.next().unwrap().unwrap().key, "a");
        assert!(matches!(
            reader.next(),
            Some(Err(FormatError::Truncated { .. }))
        ));
        assert!(reader.next().is_none());
        assert_eq!(reader.records_read(), 1);
    }

    #[test]
    fn truncated_payload_is_a_format_error() {
        let bytes = encoded(&[Record::matrix("m", array![[1.0f32, 2.0], [3.0, 4.0]])]);
        let err = decode_all(&bytes[..bytes.len() - 1]).unwrap_err();
        match err {
            FormatError::Truncated { key, expected, got, .. } => {
                assert_eq!(key, "m");
                assert_eq!(expected, 16);
                assert_eq!(got, 15);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn negative_dimension_is_rejected() {
        let mut bytes = b"m \0BFM ".to_vec();
        bytes.push(SIZE_MARKER);
        bytes.extend_from_slice(&(-3i32).to_le_bytes());
        bytes.push(SIZE_MARKER);
        bytes.extend_from_slice(&2i32.to_le_bytes());

        assert!(matches!(
            decode_all(&bytes),
            Err(FormatError::BadShape { .. })
        ));
    }

    #[test]
    fn bad_size_marker_is_rejected() {
        let mut bytes = b"v \0BFV ".to_vec();
        bytes.push(0x08);
        bytes.extend_from_slice(&1i32.to_le_bytes());

        assert!(matches!(
            decode_all(&bytes),
            Err(FormatError::BadSizeMarker { found: 0x08, .. })
        ));
    }

    #[test]
    fn compressed_matrices_are_unsupported() {
        let bytes = b"m \0BCM \x04\x00\x00\x00\x00".to_vec();
        match decode_all(&bytes) {
            Err(FormatError::UnsupportedType { token, .. }) => assert_eq!(token, "CM "),
            other => panic!("unexpected result: {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn empty_and_whitespace_streams_have_no_records() {
        assert!(decode_all(b"").unwrap().is_empty());
        assert!(decode_all(b"\n  \n").unwrap().is_empty());
    }

    #[test]
    fn eof_inside_key_is_truncation() {
        assert!(matches!(
            decode_all(b"dangling"),
            Err(FormatError::Truncated { what: "key", .. })
        ));
    }

    #[test]
    fn decode_stream_buffers_any_reader() {
        let bytes = encoded(&[Record::vector("a", array![1.0f32, 2.0])]);
        let records: Vec<_> = decode_stream(std::io::Cursor::new(bytes))
            .collect::<FormatResult<_>>()
            .unwrap();
        assert_eq!(records.len(), 1);
    }
}
