//! Procedure library.
//!
//! Every procedure is a fixed stage graph run under one [`RunContext`]:
//! - [`gmm`]: diagonal and full-covariance UBM training, MAP adaptation,
//!   log-likelihood-ratio scoring
//! - [`ivector`]: i-vector extractor training and extraction
//! - [`plda`]: PLDA training, enrollment, scoring, and text model parsing
//! - [`hmm`]: monophone HMM training
//! - [`features`]: cepstral features and energy VAD
//! - [`dnn`]: neural network forward pass and DNN-based VAD
//!
//! Each call owns a single [`TempScope`]; every intermediate file lives in
//! it and is gone when the call returns, whether it succeeded or not. The
//! only file that outlives a call is a model explicitly saved to a caller
//! path.

pub mod dnn;
pub mod features;
pub mod gmm;
pub mod hmm;
pub mod ivector;
pub mod plda;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::archive::{encode_all, Matrix, Record, Vector};
use crate::orchestrator::{
    Model, Pipeline, PipelineError, PipelineInput, PipelineResult, RunContext,
};
use crate::process::{StageInput, StageOutput, StageSpec};
use crate::temp::{TempArtifact, TempScope};

/// Key of the single record written for one-utterance inputs.
pub(crate) const UTTERANCE_KEY: &str = "abc";

/// A trained model handed back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainedModel {
    /// Text form of the model.
    pub text: String,
    /// Where the model file was saved, if the caller asked for it.
    pub saved_to: Option<PathBuf>,
}

/// Run `body` inside a fresh scope and remove the scope afterwards.
///
/// A cleanup failure is reported only when `body` succeeded; otherwise the
/// original error wins and the cleanup problem is logged.
pub(crate) fn within_scope<T>(
    ctx: &RunContext,
    label: &str,
    body: impl FnOnce(&TempScope) -> PipelineResult<T>,
) -> PipelineResult<T> {
    let scope = ctx.temp_scope(label)?;
    let result = body(&scope);
    let closed = scope.close();

    match (result, closed) {
        (Ok(value), Ok(())) => {
            ctx.log.success(&format!("{} finished", label));
            Ok(value)
        }
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(err), closed) => {
            if let Err(e) = closed {
                ctx.log.warn(&format!("Cleanup after failure: {}", e));
            }
            ctx.log.error(&err.to_string());
            Err(err)
        }
    }
}

/// Run one program that only touches files.
pub(crate) fn run_tool(ctx: &RunContext, spec: StageSpec) -> PipelineResult<()> {
    let name = spec.program().to_string();
    let spec = spec.stdin(StageInput::Null).stdout(StageOutput::Null);
    Pipeline::single(name, spec).execute(ctx, PipelineInput::None)
}

/// Run one program that reads `input` on stdin and only writes files.
pub(crate) fn run_fed(
    ctx: &RunContext,
    spec: StageSpec,
    input: PipelineInput,
) -> PipelineResult<()> {
    let name = spec.program().to_string();
    Pipeline::single(name, spec.stdout(StageOutput::Null)).execute(ctx, input)
}

/// Write `records` as an archive file in `scope`.
pub(crate) fn write_archive(
    scope: &TempScope,
    suffix: &str,
    records: &[Record],
) -> PipelineResult<TempArtifact> {
    let artifact = scope.acquire(suffix)?;
    let file = File::create(artifact.path())
        .map_err(|e| PipelineError::io_error("creating archive", e))?;
    let mut writer = BufWriter::new(file);
    encode_all(&mut writer, records)?;
    writer
        .flush()
        .map_err(|e| PipelineError::io_error("writing archive", e))?;
    Ok(artifact)
}

/// Write a text payload (model, topology, table) to `scope`.
pub(crate) fn write_text(
    scope: &TempScope,
    suffix: &str,
    text: &str,
) -> PipelineResult<TempArtifact> {
    let artifact = scope.acquire(suffix)?;
    artifact.write_text(text)?;
    Ok(artifact)
}

/// The single-utterance feature record.
pub(crate) fn utterance(feats: &Matrix) -> Record {
    Record::matrix(UTTERANCE_KEY, feats.clone())
}

/// The matrix of the first output record.
pub(crate) fn first_matrix(records: Vec<Record>, what: &str) -> PipelineResult<Matrix> {
    match records.into_iter().next() {
        Some(record) => Ok(record.into_matrix()?),
        None => Err(PipelineError::missing_output(format!("{} produced no records", what))),
    }
}

/// The vector of the first output record.
pub(crate) fn first_vector(records: Vec<Record>, what: &str) -> PipelineResult<Vector> {
    match records.into_iter().next() {
        Some(record) => Ok(record.into_vector()?),
        None => Err(PipelineError::missing_output(format!("{} produced no records", what))),
    }
}

/// Read a text model and hand it to the caller, saving the model file to
/// `save_to` when given. Otherwise the file is released with the scope.
pub(crate) fn hand_over(
    text: String,
    model: Model,
    save_to: Option<&Path>,
) -> PipelineResult<TrainedModel> {
    let saved_to = match save_to {
        Some(dest) => Some(model.persist_to(dest)?),
        None => {
            model.release()?;
            None
        }
    };
    Ok(TrainedModel { text, saved_to })
}

/// Render a path as the toolkit's `ark:` read or write specifier.
pub(crate) fn ark(path: &Path) -> String {
    format!("ark:{}", path.display())
}
