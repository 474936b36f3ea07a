//! Error types for pipelines, refinement loops, and procedures.
//!
//! Errors carry context that chains through layers:
//! Procedure → Pass → Pipeline → Stage → Detail

use std::io;

use thiserror::Error;

use super::cancel::CancelReason;
use crate::archive::FormatError;
use crate::process::StageFailure;
use crate::temp::ResourceError;

/// Top-level error returned by every orchestrated operation.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Archive data crossing a process boundary was malformed.
    #[error("Malformed archive data: {0}")]
    Format(#[from] FormatError),

    /// An external stage exited unsuccessfully.
    #[error(transparent)]
    StageFailed(#[from] StageFailure),

    /// A temporary file or directory could not be created or removed.
    #[error("Temporary resource error: {0}")]
    Resource(#[from] ResourceError),

    /// A stage program could not be started at all.
    #[error("Failed to start '{program}' in pipeline '{pipeline}': {source}")]
    Spawn {
        pipeline: String,
        program: String,
        #[source]
        source: io::Error,
    },

    /// The caller cancelled the run or its deadline passed.
    #[error("Procedure '{procedure}' was cancelled: {reason}")]
    Cancelled {
        procedure: String,
        reason: CancelReason,
    },

    /// A refinement pass failed; `pass` is 1-based.
    #[error("Procedure '{procedure}' failed in pass {pass}/{total}: {source}")]
    PassFailed {
        procedure: String,
        pass: usize,
        total: usize,
        #[source]
        source: Box<PipelineError>,
    },

    /// The stage list cannot be wired together.
    #[error("Pipeline '{pipeline}' is invalid: {message}")]
    InvalidPipeline { pipeline: String, message: String },

    /// Caller-supplied input was rejected before anything ran.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A stage succeeded but did not produce what the procedure reads back.
    #[error("Expected output missing: {0}")]
    MissingOutput(String),

    /// Orchestrator-side I/O failed.
    #[error("I/O error in {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: io::Error,
    },
}

impl PipelineError {
    /// Create an invalid pipeline error.
    pub fn invalid_pipeline(pipeline: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPipeline {
            pipeline: pipeline.into(),
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a missing output error.
    pub fn missing_output(message: impl Into<String>) -> Self {
        Self::MissingOutput(message.into())
    }

    /// Create an I/O error with context.
    pub fn io_error(operation: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a cancelled error.
    pub fn cancelled(procedure: impl Into<String>, reason: CancelReason) -> Self {
        Self::Cancelled {
            procedure: procedure.into(),
            reason,
        }
    }

    /// Wrap an error raised inside refinement pass `pass` (1-based).
    ///
    /// Cancellation passes through unwrapped so callers can match on it
    /// directly.
    pub fn in_pass(self, procedure: impl Into<String>, pass: usize, total: usize) -> Self {
        match self {
            cancelled @ Self::Cancelled { .. } => cancelled,
            other => Self::PassFailed {
                procedure: procedure.into(),
                pass,
                total,
                source: Box::new(other),
            },
        }
    }

    /// The failing stage, looking through pass context.
    pub fn stage_failure(&self) -> Option<&StageFailure> {
        match self {
            Self::StageFailed(f) => Some(f),
            Self::PassFailed { source, .. } => source.stage_failure(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ExitOutcome;

    fn failure() -> StageFailure {
        StageFailure {
            pipeline: "diag-ubm-acc".to_string(),
            index: 0,
            program: "gmm-global-acc-stats".to_string(),
            args: vec![],
            outcome: ExitOutcome::Code(1),
            diagnostics: vec!["ERROR: no frames".to_string()],
        }
    }

    #[test]
    fn pass_context_chains() {
        let err = PipelineError::from(failure()).in_pass("train_diag_ubm", 3, 4);
        let msg = err.to_string();
        assert!(msg.contains("train_diag_ubm"));
        assert!(msg.contains("pass 3/4"));
        assert!(msg.contains("gmm-global-acc-stats"));
        assert_eq!(err.stage_failure().map(|f| f.index), Some(0));
    }

    #[test]
    fn cancellation_is_not_wrapped() {
        let err = PipelineError::cancelled("train_mono", CancelReason::Requested)
            .in_pass("train_mono", 1, 40);
        assert!(err.is_cancelled());
        assert!(err.stage_failure().is_none());
    }
}
