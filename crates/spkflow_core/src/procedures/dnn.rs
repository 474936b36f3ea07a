//! Neural network forward pass and DNN-based voice activity detection.

use serde::{Deserialize, Serialize};

use super::features::{cepstral, CepstralKind, CepstralOptions};
use super::{first_matrix, utterance, within_scope, write_text};
use crate::archive::Matrix;
use crate::orchestrator::{Pipeline, PipelineError, PipelineResult, RunContext};
use crate::process::StageSpec;

/// `[nnet]` options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NnetOptions {
    /// Take the log of the network outputs.
    pub apply_log: bool,
    /// Drop the final softmax.
    pub no_softmax: bool,
    pub prior_floor: f64,
    pub prior_scale: f64,
    pub use_gpu: bool,
    /// Posterior above which a frame counts as non-speech.
    pub silence_threshold: f64,
    /// Output column compared against the threshold.
    pub posterior: usize,
}

impl Default for NnetOptions {
    fn default() -> Self {
        Self {
            apply_log: false,
            no_softmax: false,
            prior_floor: 1e-10,
            prior_scale: 1.0,
            use_gpu: false,
            silence_threshold: 0.9,
            posterior: 0,
        }
    }
}

/// Forward `feats` through `nnet` (text form), optionally preceded by a
/// feature transform network. Returns one posterior row per frame.
pub fn nnet_forward(
    ctx: &RunContext,
    feats: &Matrix,
    nnet: &str,
    feature_transform: Option<&str>,
    opts: &NnetOptions,
) -> PipelineResult<Matrix> {
    within_scope(ctx, "nnet_forward", |scope| {
        let network = write_text(scope, ".nnet", nnet)?;
        let transform = feature_transform
            .map(|text| write_text(scope, ".nnet", text))
            .transpose()?;

        let records = Pipeline::single(
            "nnet-forward",
            StageSpec::new("nnet-forward")
                .opt("apply-log", opts.apply_log)
                .opt("no-softmax", opts.no_softmax)
                .opt("prior-floor", opts.prior_floor)
                .opt("prior-scale", opts.prior_scale)
                .opt("use-gpu", opts.use_gpu)
                .opt_if(
                    "feature-transform",
                    transform.as_ref().map(|t| t.path().display().to_string()),
                )
                .path(network.path())
                .args(["ark:-", "ark:-"]),
        )
        .collect(ctx, utterance(feats).into())?;

        first_matrix(records, "nnet-forward")
    })
}

/// Frame decisions from a posterior matrix: 0.0 where column `posterior`
/// exceeds `threshold`, 1.0 elsewhere.
pub fn threshold_posteriors(
    posteriors: &Matrix,
    posterior: usize,
    threshold: f64,
) -> PipelineResult<Vec<f64>> {
    let values = posteriors.to_f64();
    if posterior >= values.ncols() {
        return Err(PipelineError::invalid_input(format!(
            "posterior index {} out of range for {} outputs",
            posterior,
            values.ncols()
        )));
    }
    Ok(values
        .rows()
        .into_iter()
        .map(|row| if row[posterior] > threshold { 0.0 } else { 1.0 })
        .collect())
}

/// Voice activity from a DNN: unnormalised MFCCs are forwarded through
/// `nnet` with `feature_transform`, then thresholded on the posterior
/// column `opts.posterior`.
pub fn compute_dnn_vad(
    ctx: &RunContext,
    samples: &[f64],
    rate: u32,
    nnet: &str,
    feature_transform: &str,
    features: &CepstralOptions,
    opts: &NnetOptions,
) -> PipelineResult<Vec<f64>> {
    ctx.log.phase("DNN voice activity detection");
    let features = CepstralOptions {
        normalization: false,
        ..features.clone()
    };
    let feats = cepstral(ctx, samples, rate, CepstralKind::Mfcc, &features)?;
    let posteriors = nnet_forward(ctx, &feats, nnet, Some(feature_transform), opts)?;
    let vad = threshold_posteriors(&posteriors, opts.posterior, opts.silence_threshold)?;

    let speech = vad.iter().filter(|v| **v > 0.5).count();
    ctx.log.info(&format!("{} of {} frames are speech", speech, vad.len()));
    Ok(vad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn thresholding_marks_silence() {
        let post = Matrix::from(array![[0.95f32, 0.05], [0.2, 0.8], [0.9, 0.1]]);
        assert_eq!(threshold_posteriors(&post, 0, 0.9).unwrap(), vec![0.0, 1.0, 1.0]);
        assert_eq!(threshold_posteriors(&post, 1, 0.5).unwrap(), vec![1.0, 0.0, 1.0]);
    }

    #[test]
    fn posterior_index_is_checked() {
        let post = Matrix::from(array![[0.5f64, 0.5]]);
        assert!(matches!(
            threshold_posteriors(&post, 2, 0.9),
            Err(PipelineError::InvalidInput(_))
        ));
    }

    #[test]
    fn defaults() {
        let opts = NnetOptions::default();
        assert_eq!(opts.silence_threshold, 0.9);
        assert_eq!(opts.prior_floor, 1e-10);
        assert!(!opts.use_gpu);
    }
}
