//! Errors raised while encoding or decoding archive records.

use std::io;

use thiserror::Error;

/// A malformed or unreadable archive record.
#[derive(Error, Debug)]
pub enum FormatError {
    /// Key is empty or contains whitespace.
    #[error("Invalid record key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    /// Payload type token is not one this codec understands.
    #[error("Record '{key}' has unsupported payload type {token:?}")]
    UnsupportedType { key: String, token: String },

    /// The size marker preceding a dimension was not `0x04`.
    #[error("Record '{key}': expected size marker 0x04, found 0x{found:02x}")]
    BadSizeMarker { key: String, found: u8 },

    /// Shape metadata is negative, overflows, or disagrees with the payload.
    #[error("Record '{key}' has invalid shape: {detail}")]
    BadShape { key: String, detail: String },

    /// The stream ended inside a record.
    #[error("Record '{key}' truncated in {what}: expected {expected} bytes, got {got}")]
    Truncated {
        key: String,
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// The embedded RIFF/WAVE blob could not be parsed or produced.
    #[error("Record '{key}' has malformed audio: {detail}")]
    BadAudio { key: String, detail: String },

    /// A line of a text archive could not be parsed.
    #[error("Text archive line {line}: {detail}")]
    BadTextLine { line: usize, detail: String },

    /// Payload kind differs from what the caller asked for.
    #[error("Record '{key}': expected {expected}, found {found}")]
    UnexpectedPayload {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    /// The underlying stream failed.
    #[error("I/O error while {operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: io::Error,
    },
}

impl FormatError {
    /// Create a bad shape error.
    pub fn bad_shape(key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::BadShape {
            key: key.into(),
            detail: detail.into(),
        }
    }

    /// Create a malformed audio error.
    pub fn bad_audio(key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::BadAudio {
            key: key.into(),
            detail: detail.into(),
        }
    }

    /// Create a text archive parse error.
    pub fn bad_text_line(line: usize, detail: impl Into<String>) -> Self {
        Self::BadTextLine {
            line,
            detail: detail.into(),
        }
    }

    /// Create an I/O error with context.
    pub fn io(operation: &'static str, source: io::Error) -> Self {
        Self::Io { operation, source }
    }

    /// True when the error is a write into a pipe whose reader has gone away.
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::BrokenPipe)
    }
}

/// Result type for codec operations.
pub type FormatResult<T> = Result<T, FormatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_displays_context() {
        let err = FormatError::Truncated {
            key: "utt1".to_string(),
            what: "matrix data",
            expected: 40,
            got: 12,
        };
        let msg = err.to_string();
        assert!(msg.contains("utt1"));
        assert!(msg.contains("matrix data"));
        assert!(msg.contains("40"));
    }

    #[test]
    fn detects_broken_pipe() {
        let err = FormatError::io("writing record", io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(err.is_broken_pipe());

        let other = FormatError::io("writing record", io::Error::from(io::ErrorKind::Other));
        assert!(!other.is_broken_pipe());
    }
}
