//! Keyed archive codec shared with the external toolkit.
//!
//! The wire format is the toolkit's binary archive:
//!
//! ```text
//! <key> ' ' '\0' 'B' <token> 0x04 <i32 rows> [0x04 <i32 cols>] <little-endian data>
//! ```
//!
//! with `FM `/`DM ` for f32/f64 matrices and `FV `/`DV ` for vectors. Audio
//! records carry a RIFF/WAVE image directly after the key. Text outputs
//! (`ark,t`) are read with the parsers in [`text`].

mod error;
mod reader;
pub mod text;
mod types;
mod wav;
mod writer;

pub use error::{FormatError, FormatResult};
pub use reader::{decode_all, decode_stream, ArchiveReader};
pub use text::{parse_scalar_lines, parse_text_vectors, parse_trial_scores, TrialScore};
pub use types::{AudioBlob, Matrix, Payload, Precision, Record, SampleScaling, Vector};
pub use writer::{encode, encode_all, validate_key, ArchiveWriter};
