//! Record and payload types carried by archive streams.

use ndarray::{Array1, Array2, Axis};

use super::error::{FormatError, FormatResult};

/// Floating point width of a numeric payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// 32-bit IEEE-754.
    Single,
    /// 64-bit IEEE-754.
    Double,
}

/// A row-major `(frames, dim)` matrix in single or double precision.
#[derive(Debug, Clone, PartialEq)]
pub enum Matrix {
    F32(Array2<f32>),
    F64(Array2<f64>),
}

impl Matrix {
    /// `(rows, cols)` of the matrix.
    pub fn shape(&self) -> (usize, usize) {
        match self {
            Matrix::F32(m) => m.dim(),
            Matrix::F64(m) => m.dim(),
        }
    }

    /// Number of rows (frames).
    pub fn rows(&self) -> usize {
        self.shape().0
    }

    /// Number of columns (feature dimension).
    pub fn cols(&self) -> usize {
        self.shape().1
    }

    pub fn precision(&self) -> Precision {
        match self {
            Matrix::F32(_) => Precision::Single,
            Matrix::F64(_) => Precision::Double,
        }
    }

    /// Widen to double precision.
    pub fn to_f64(&self) -> Array2<f64> {
        match self {
            Matrix::F32(m) => m.mapv(f64::from),
            Matrix::F64(m) => m.clone(),
        }
    }
}

impl From<Array2<f32>> for Matrix {
    fn from(m: Array2<f32>) -> Self {
        Matrix::F32(m)
    }
}

impl From<Array2<f64>> for Matrix {
    fn from(m: Array2<f64>) -> Self {
        Matrix::F64(m)
    }
}

/// A 1-D vector in single or double precision.
#[derive(Debug, Clone, PartialEq)]
pub enum Vector {
    F32(Array1<f32>),
    F64(Array1<f64>),
}

impl Vector {
    pub fn len(&self) -> usize {
        match self {
            Vector::F32(v) => v.len(),
            Vector::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn precision(&self) -> Precision {
        match self {
            Vector::F32(_) => Precision::Single,
            Vector::F64(_) => Precision::Double,
        }
    }

    /// Widen to double precision.
    pub fn to_f64(&self) -> Array1<f64> {
        match self {
            Vector::F32(v) => v.mapv(f64::from),
            Vector::F64(v) => v.clone(),
        }
    }
}

impl From<Array1<f32>> for Vector {
    fn from(v: Array1<f32>) -> Self {
        Vector::F32(v)
    }
}

impl From<Array1<f64>> for Vector {
    fn from(v: Array1<f64>) -> Self {
        Vector::F64(v)
    }
}

/// How audio samples map onto the integer depth of the encoded blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleScaling {
    /// Samples are already in integer units; they are rounded and clamped.
    #[default]
    Verbatim,
    /// Samples are in `[-1, 1]` and get multiplied by the depth's full scale.
    FullScale,
}

/// Mono PCM audio travelling as a RIFF/WAVE record.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlob {
    pub samples: Vec<f64>,
    pub sample_rate: u32,
    /// 16 or 32.
    pub bits_per_sample: u16,
    pub scaling: SampleScaling,
}

impl AudioBlob {
    /// 16-bit audio whose samples are already in integer units.
    pub fn new(samples: Vec<f64>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            bits_per_sample: 16,
            scaling: SampleScaling::Verbatim,
        }
    }

    /// 16-bit audio from samples in `[-1, 1]`.
    pub fn full_scale(samples: Vec<f64>, sample_rate: u32) -> Self {
        Self {
            scaling: SampleScaling::FullScale,
            ..Self::new(samples, sample_rate)
        }
    }

    /// Set the encoded bit depth.
    pub fn with_bits(mut self, bits_per_sample: u16) -> Self {
        self.bits_per_sample = bits_per_sample;
        self
    }

    /// Duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// The value half of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Matrix(Matrix),
    Vector(Vector),
    Audio(AudioBlob),
}

impl Payload {
    /// Short name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Matrix(_) => "matrix",
            Payload::Vector(_) => "vector",
            Payload::Audio(_) => "audio",
        }
    }
}

/// A keyed payload; the unit of an archive stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: String,
    pub payload: Payload,
}

impl Record {
    pub fn new(key: impl Into<String>, payload: Payload) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }

    /// Create a matrix record.
    pub fn matrix(key: impl Into<String>, matrix: impl Into<Matrix>) -> Self {
        Self::new(key, Payload::Matrix(matrix.into()))
    }

    /// Create a vector record.
    pub fn vector(key: impl Into<String>, vector: impl Into<Vector>) -> Self {
        Self::new(key, Payload::Vector(vector.into()))
    }

    /// Create an audio record.
    pub fn audio(key: impl Into<String>, audio: AudioBlob) -> Self {
        Self::new(key, Payload::Audio(audio))
    }

    /// Take the payload as a matrix. Vectors become a single row.
    pub fn into_matrix(self) -> FormatResult<Matrix> {
        match self.payload {
            Payload::Matrix(m) => Ok(m),
            Payload::Vector(Vector::F32(v)) => Ok(Matrix::F32(v.insert_axis(Axis(0)))),
            Payload::Vector(Vector::F64(v)) => Ok(Matrix::F64(v.insert_axis(Axis(0)))),
            other => Err(FormatError::UnexpectedPayload {
                key: self.key,
                expected: "matrix",
                found: other.kind(),
            }),
        }
    }

    /// Take the payload as a vector.
    pub fn into_vector(self) -> FormatResult<Vector> {
        match self.payload {
            Payload::Vector(v) => Ok(v),
            other => Err(FormatError::UnexpectedPayload {
                key: self.key,
                expected: "vector",
                found: other.kind(),
            }),
        }
    }
}
