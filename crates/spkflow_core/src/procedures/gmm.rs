//! Universal background models.
//!
//! - [`train_diag_ubm`]: diagonal-covariance UBM from a feature matrix
//! - [`train_full_ubm`]: full-covariance UBM seeded from a diagonal one
//! - [`map_adapt`]: mean-only MAP adaptation of a UBM to one speaker
//! - [`gmm_score`]: average log-likelihood ratio of speaker vs. UBM

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{
    ark, hand_over, run_fed, run_tool, utterance, within_scope, write_text, TrainedModel,
};
use crate::archive::{parse_scalar_lines, Matrix};
use crate::orchestrator::{
    IterativeRefiner, Model, PassInfo, Pipeline, PipelineError, PipelineResult, RefinementPass,
    RunContext,
};
use crate::process::{StageOutput, StageSpec};
use crate::temp::{TempArtifact, TempScope};

/// `[diag_ubm]` options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagUbmOptions {
    /// Threads used while initialising from features.
    pub num_threads: u32,
    /// Frames sampled for initialisation.
    pub num_frames: u64,
    pub min_gaussian_weight: f64,
    /// Target number of Gaussians.
    pub num_gauss: u32,
    /// Initial Gaussian count; 0 lets the toolkit pick.
    pub num_gauss_init: u32,
    /// Gaussians kept per frame by the selection step.
    pub num_gselect: u32,
    /// Iterations run inside initialisation.
    pub num_iters_init: u32,
    /// Accumulate/estimate passes after initialisation.
    pub num_iters: usize,
    /// Prune low-count Gaussians on the final pass.
    pub remove_low_count_gaussians: bool,
    /// Keep every n-th frame for training.
    pub subsample: u32,
}

impl Default for DiagUbmOptions {
    fn default() -> Self {
        Self {
            num_threads: 4,
            num_frames: 500_000,
            min_gaussian_weight: 0.0001,
            num_gauss: 2048,
            num_gauss_init: 0,
            num_gselect: 30,
            num_iters_init: 20,
            num_iters: 4,
            remove_low_count_gaussians: true,
            subsample: 5,
        }
    }
}

/// `[full_ubm]` options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FullUbmOptions {
    pub num_gselect: u32,
    pub num_iters: usize,
    pub min_gaussian_weight: f64,
    pub subsample: u32,
}

impl Default for FullUbmOptions {
    fn default() -> Self {
        Self {
            num_gselect: 20,
            num_iters: 4,
            min_gaussian_weight: 1.0e-4,
            subsample: 5,
        }
    }
}

/// Accumulate/estimate pass for diagonal UBMs.
struct DiagUbmPass<'a> {
    feats: &'a Path,
    gselect: &'a Path,
    opts: &'a DiagUbmOptions,
}

impl RefinementPass for DiagUbmPass<'_> {
    fn accumulate(
        &self,
        ctx: &RunContext,
        model: &Path,
        stats: &Path,
        _pass: PassInfo,
    ) -> PipelineResult<()> {
        run_tool(
            ctx,
            StageSpec::new("gmm-global-acc-stats")
                .arg(format!("--gselect=ark,s,cs:{}", self.gselect.display()))
                .path(model)
                .arg(ark(self.feats))
                .path(stats),
        )
    }

    fn estimate(
        &self,
        ctx: &RunContext,
        model: &Path,
        stats: &Path,
        next: &Path,
        pass: PassInfo,
    ) -> PipelineResult<()> {
        let prune = pass.is_final() && self.opts.remove_low_count_gaussians;
        run_tool(
            ctx,
            StageSpec::new("gmm-global-est")
                .opt("remove-low-count-gaussians", prune)
                .opt("min-gaussian-weight", self.opts.min_gaussian_weight)
                .path(model)
                .path(stats)
                .path(next),
        )
    }
}

/// Accumulate/estimate pass for full-covariance UBMs. The selection
/// indices come from the diagonal model and are reused by every pass.
struct FullUbmPass<'a> {
    feats: &'a Path,
    gselect: &'a Path,
    opts: &'a FullUbmOptions,
}

impl RefinementPass for FullUbmPass<'_> {
    fn accumulate(
        &self,
        ctx: &RunContext,
        model: &Path,
        stats: &Path,
        _pass: PassInfo,
    ) -> PipelineResult<()> {
        run_tool(
            ctx,
            StageSpec::new("fgmm-global-acc-stats")
                .arg(format!("--gselect=ark,s,cs:{}", self.gselect.display()))
                .path(model)
                .arg(ark(self.feats))
                .path(stats),
        )
    }

    fn estimate(
        &self,
        ctx: &RunContext,
        model: &Path,
        stats: &Path,
        next: &Path,
        pass: PassInfo,
    ) -> PipelineResult<()> {
        run_tool(
            ctx,
            StageSpec::new("fgmm-global-est")
                .opt("remove-low-count-gaussians", pass.is_final())
                .opt("binary", false)
                .opt("min-gaussian-weight", self.opts.min_gaussian_weight)
                .path(model)
                .path(stats)
                .path(next),
        )
    }
}

/// Keep every `n`-th frame of `feats` in a temp archive.
fn subsample_features(
    ctx: &RunContext,
    scope: &TempScope,
    feats: &Matrix,
    n: u32,
) -> PipelineResult<TempArtifact> {
    let out = scope.acquire(".ark")?;
    run_fed(
        ctx,
        StageSpec::new("subsample-feats")
            .opt("n", n)
            .arg("ark:-")
            .arg(ark(out.path())),
        utterance(feats).into(),
    )?;
    Ok(out)
}

/// Train a diagonal-covariance UBM.
///
/// Returns the text form of the final model. With `save_to` the binary
/// model file is also moved there.
pub fn train_diag_ubm(
    ctx: &RunContext,
    feats: &Matrix,
    opts: &DiagUbmOptions,
    save_to: Option<&Path>,
) -> PipelineResult<TrainedModel> {
    ctx.log.phase("Diagonal UBM training");
    ctx.log.info(&format!(
        "{} frames, {} Gaussians, {} passes",
        feats.rows(),
        opts.num_gauss,
        opts.num_iters
    ));

    within_scope(ctx, "train_diag_ubm", |scope| {
        let init = scope.acquire(".dubm")?;
        run_fed(
            ctx,
            StageSpec::new("gmm-global-init-from-feats")
                .opt("num-threads", opts.num_threads)
                .opt("num-frames", opts.num_frames)
                .opt("min-gaussian-weight", opts.min_gaussian_weight)
                .opt("num-gauss", opts.num_gauss)
                .opt("num-gauss-init", opts.num_gauss_init)
                .opt("num-iters", opts.num_iters_init)
                .arg("ark:-")
                .path(init.path()),
            utterance(feats).into(),
        )?;

        let sampled = subsample_features(ctx, scope, feats, opts.subsample)?;
        let gselect = scope.acquire(".gsel")?;
        run_tool(
            ctx,
            StageSpec::new("gmm-gselect")
                .opt("n", opts.num_gselect)
                .path(init.path())
                .arg(ark(sampled.path()))
                .arg(ark(gselect.path())),
        )?;

        let pass = DiagUbmPass {
            feats: sampled.path(),
            gselect: gselect.path(),
            opts,
        };
        let model = IterativeRefiner::new("train_diag_ubm", opts.num_iters)
            .with_model_suffix(".dubm")
            .run(ctx, scope, Model::new(init), &pass)?;

        let text = export_diag_text(ctx, scope, model.path())?;
        hand_over(text, model, save_to)
    })
}

/// Convert a diagonal model file to its text form.
fn export_diag_text(
    ctx: &RunContext,
    scope: &TempScope,
    model: &Path,
) -> PipelineResult<String> {
    let txt = scope.acquire(".txt")?;
    run_tool(
        ctx,
        StageSpec::new("gmm-global-copy")
            .opt("binary", false)
            .path(model)
            .path(txt.path()),
    )?;
    let text = txt.read_text()?;
    if text.trim().is_empty() {
        return Err(PipelineError::missing_output("gmm-global-copy wrote an empty model"));
    }
    Ok(text)
}

/// Train a full-covariance UBM starting from the diagonal model `dubm`
/// (text form).
pub fn train_full_ubm(
    ctx: &RunContext,
    feats: &Matrix,
    dubm: &str,
    opts: &FullUbmOptions,
    save_to: Option<&Path>,
) -> PipelineResult<TrainedModel> {
    ctx.log.phase("Full-covariance UBM training");

    within_scope(ctx, "train_full_ubm", |scope| {
        let diag = write_text(scope, ".dubm", dubm)?;

        // Without passes the converted model is returned as is, so it
        // has to be written as text already.
        let init = scope.acquire(".ubm")?;
        run_tool(
            ctx,
            StageSpec::new("gmm-global-to-fgmm")
                .opt_if("binary", (opts.num_iters == 0).then_some(false))
                .path(diag.path())
                .path(init.path()),
        )?;

        let sampled = subsample_features(ctx, scope, feats, opts.subsample)?;
        let gselect = scope.acquire(".gsel")?;
        run_tool(
            ctx,
            StageSpec::new("gmm-gselect")
                .opt("n", opts.num_gselect)
                .path(diag.path())
                .arg(ark(sampled.path()))
                .arg(ark(gselect.path())),
        )?;

        let pass = FullUbmPass {
            feats: sampled.path(),
            gselect: gselect.path(),
            opts,
        };
        let model = IterativeRefiner::new("train_full_ubm", opts.num_iters)
            .with_model_suffix(".ubm")
            .run(ctx, scope, Model::new(init), &pass)?;

        let text = model.read_text()?;
        hand_over(text, model, save_to)
    })
}

/// Mean-only MAP adaptation of `ubm` (diagonal, text form) to `feats`.
///
/// Statistics are piped straight into the update stage; the adapted model
/// is returned as text.
pub fn map_adapt(ctx: &RunContext, feats: &Matrix, ubm: &str) -> PipelineResult<String> {
    ctx.log.phase("MAP adaptation");

    within_scope(ctx, "map_adapt", |scope| {
        let base = write_text(scope, ".dubm", ubm)?;
        let adapted = scope.acquire(".dubm")?;

        Pipeline::new("map-adapt")
            .with_stage(
                StageSpec::new("gmm-global-acc-stats")
                    .path(base.path())
                    .args(["ark:-", "-"]),
            )
            .with_stage(
                StageSpec::new("global-gmm-adapt-map")
                    .opt("update-flags", "m")
                    .path(base.path())
                    .arg("-")
                    .path(adapted.path())
                    .stdout(StageOutput::Null),
            )
            .execute(ctx, utterance(feats).into())?;

        export_diag_text(ctx, scope, adapted.path())
    })
}

/// Average per-frame log-likelihood ratio of `feats` under the speaker
/// model `spk` and the background model `ubm` (both diagonal, text form).
pub fn gmm_score(ctx: &RunContext, feats: &Matrix, spk: &str, ubm: &str) -> PipelineResult<f64> {
    ctx.log.phase("GMM scoring");

    within_scope(ctx, "gmm_score", |scope| {
        let mut likes = [0.0f64; 2];
        for (slot, model) in likes.iter_mut().zip([spk, ubm]) {
            let file = write_text(scope, ".dubm", model)?;
            let text = Pipeline::single(
                "frame-likes",
                StageSpec::new("gmm-global-get-frame-likes")
                    .opt("average", true)
                    .path(file.path())
                    .args(["ark:-", "ark,t:-"]),
            )
            .read_text(ctx, utterance(feats).into())?;

            *slot = parse_scalar_lines(&text)?
                .first()
                .map(|(_, value)| *value)
                .ok_or_else(|| {
                    PipelineError::missing_output("gmm-global-get-frame-likes printed no score")
                })?;
        }

        let score = likes[0] - likes[1];
        ctx.log.info(&format!("Score: {:.5}", score));
        Ok(score)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_toolkit_recipes() {
        let diag = DiagUbmOptions::default();
        assert_eq!(diag.num_gauss, 2048);
        assert_eq!(diag.num_gselect, 30);
        assert!(diag.remove_low_count_gaussians);

        let full = FullUbmOptions::default();
        assert_eq!(full.num_gselect, 20);
        assert_eq!(full.num_iters, 4);
    }

    #[test]
    fn partial_section_keeps_defaults() {
        let opts: DiagUbmOptions = toml::from_str("num_gauss = 64\nnum_iters = 2\n").unwrap();
        assert_eq!(opts.num_gauss, 64);
        assert_eq!(opts.num_iters, 2);
        assert_eq!(opts.subsample, 5);
    }
}
