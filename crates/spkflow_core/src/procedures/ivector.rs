//! I-vector extractor training and extraction.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{
    ark, first_vector, hand_over, run_fed, run_tool, utterance, within_scope, write_archive,
    write_text, TrainedModel,
};
use crate::archive::{Matrix, Record, Vector};
use crate::orchestrator::{
    IterativeRefiner, Model, PassInfo, Pipeline, PipelineError, PipelineInput, PipelineResult,
    RefinementPass, RunContext,
};
use crate::process::{StageOutput, StageSpec};
use crate::temp::{TempArtifact, TempScope};

/// `[ivector]` options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IvectorOptions {
    /// Gaussians kept per frame.
    pub num_gselect: u32,
    pub ivector_dim: u32,
    /// Regress the log-weights on the i-vector.
    pub use_weights: bool,
    pub num_iters: usize,
    /// Posteriors below this are pruned and the rest renormalised.
    pub min_post: f64,
    /// Samples drawn from the i-vector distribution for the weight update.
    pub num_samples_for_weights: u32,
    /// Global scale applied to every posterior.
    pub posterior_scale: f64,
    /// Concurrency hint passed to the accumulate and estimate stages.
    pub num_threads: u32,
}

impl Default for IvectorOptions {
    fn default() -> Self {
        Self {
            num_gselect: 20,
            ivector_dim: 600,
            use_weights: false,
            num_iters: 5,
            min_post: 0.025,
            num_samples_for_weights: 3,
            posterior_scale: 1.0,
            num_threads: 4,
        }
    }
}

struct ExtractorPass<'a> {
    feats: &'a Path,
    posteriors: &'a Path,
    opts: &'a IvectorOptions,
}

impl RefinementPass for ExtractorPass<'_> {
    fn accumulate(
        &self,
        ctx: &RunContext,
        model: &Path,
        stats: &Path,
        _pass: PassInfo,
    ) -> PipelineResult<()> {
        run_tool(
            ctx,
            StageSpec::new("ivector-extractor-acc-stats")
                .opt("num-threads", self.opts.num_threads)
                .opt("num-samples-for-weights", self.opts.num_samples_for_weights)
                .path(model)
                .arg(ark(self.feats))
                .arg(ark(self.posteriors))
                .path(stats),
        )
    }

    fn estimate(
        &self,
        ctx: &RunContext,
        model: &Path,
        stats: &Path,
        next: &Path,
        _pass: PassInfo,
    ) -> PipelineResult<()> {
        run_tool(
            ctx,
            StageSpec::new("ivector-extractor-est")
                .opt("num-threads", self.opts.num_threads)
                .opt("binary", false)
                .path(model)
                .path(stats)
                .path(next),
        )
    }
}

/// Write the full UBM and derive its diagonal form.
fn prepare_ubms(
    ctx: &RunContext,
    scope: &TempScope,
    fubm: &str,
) -> PipelineResult<(TempArtifact, TempArtifact)> {
    let full = write_text(scope, ".ubm", fubm)?;
    let diag = scope.acquire(".dubm")?;
    run_tool(
        ctx,
        StageSpec::new("fgmm-global-to-gmm")
            .path(full.path())
            .path(diag.path()),
    )?;
    Ok((full, diag))
}

/// Gaussian posteriors pruned below `min_post` and scaled, written to a
/// temp archive.
///
/// `feats` is the features specifier the posterior stage reads; with
/// `ark:-` the features come from `input`.
fn compute_posteriors(
    ctx: &RunContext,
    scope: &TempScope,
    fubm: &Path,
    feats: &str,
    gselect: &str,
    input: PipelineInput,
    opts: &IvectorOptions,
) -> PipelineResult<TempArtifact> {
    let post = scope.acquire(".post")?;
    Pipeline::new("posteriors")
        .with_stage(
            StageSpec::new("fgmm-global-gselect-to-post")
                .opt("min-post", opts.min_post)
                .path(fubm)
                .arg(feats)
                .arg(gselect)
                .arg("ark:-"),
        )
        .with_stage(
            StageSpec::new("scale-post")
                .arg("ark:-")
                .arg(opts.posterior_scale.to_string())
                .arg(ark(post.path()))
                .stdout(StageOutput::Null),
        )
        .execute(ctx, input)?;
    Ok(post)
}

/// Train an i-vector extractor from one or more utterances and a full
/// UBM (text form). Utterances are keyed `utt0`, `utt1`, and so on.
pub fn train_extractor(
    ctx: &RunContext,
    utterances: &[Matrix],
    fubm: &str,
    opts: &IvectorOptions,
    save_to: Option<&Path>,
) -> PipelineResult<TrainedModel> {
    if utterances.is_empty() {
        return Err(PipelineError::invalid_input(
            "extractor training needs at least one utterance",
        ));
    }
    ctx.log.phase("I-vector extractor training");
    ctx.log.info(&format!(
        "{} utterances, dimension {}, {} passes",
        utterances.len(),
        opts.ivector_dim,
        opts.num_iters
    ));

    within_scope(ctx, "train_extractor", |scope| {
        let records: Vec<Record> = utterances
            .iter()
            .enumerate()
            .map(|(i, m)| Record::matrix(format!("utt{}", i), m.clone()))
            .collect();
        let feats = write_archive(scope, ".ark", &records)?;
        let (full, diag) = prepare_ubms(ctx, scope, fubm)?;

        let init = scope.acquire(".ie")?;
        run_tool(
            ctx,
            StageSpec::new("ivector-extractor-init")
                .opt("ivector-dim", opts.ivector_dim)
                .opt("use-weights", opts.use_weights)
                .opt_if("binary", (opts.num_iters == 0).then_some(false))
                .path(full.path())
                .path(init.path()),
        )?;

        let gselect = scope.acquire(".gsel")?;
        run_tool(
            ctx,
            StageSpec::new("gmm-gselect")
                .opt("n", opts.num_gselect)
                .path(diag.path())
                .arg(ark(feats.path()))
                .arg(ark(gselect.path())),
        )?;

        let posteriors = compute_posteriors(
            ctx,
            scope,
            full.path(),
            &ark(feats.path()),
            &ark(gselect.path()),
            PipelineInput::None,
            opts,
        )?;

        let pass = ExtractorPass {
            feats: feats.path(),
            posteriors: posteriors.path(),
            opts,
        };
        let model = IterativeRefiner::new("train_extractor", opts.num_iters)
            .with_model_suffix(".ie")
            .run(ctx, scope, Model::new(init), &pass)?;

        let text = model.read_text()?;
        hand_over(text, model, save_to)
    })
}

/// Extract the i-vector of one utterance.
///
/// Gaussian selection, posterior computation and extraction each read the
/// features again from their own input.
pub fn extract(
    ctx: &RunContext,
    feats: &Matrix,
    fubm: &str,
    extractor: &str,
    opts: &IvectorOptions,
) -> PipelineResult<Vector> {
    ctx.log.phase("I-vector extraction");

    within_scope(ctx, "extract_ivector", |scope| {
        let (full, diag) = prepare_ubms(ctx, scope, fubm)?;
        let ie = write_text(scope, ".ie", extractor)?;

        let gselect = scope.acquire(".gsel")?;
        run_fed(
            ctx,
            StageSpec::new("gmm-gselect")
                .opt("n", opts.num_gselect)
                .path(diag.path())
                .arg("ark:-")
                .arg(ark(gselect.path())),
            utterance(feats).into(),
        )?;

        let posteriors = compute_posteriors(
            ctx,
            scope,
            full.path(),
            "ark:-",
            &format!("ark,s,cs:{}", gselect.path().display()),
            utterance(feats).into(),
            opts,
        )?;

        let records = Pipeline::single(
            "ivector-extract",
            StageSpec::new("ivector-extract")
                .path(ie.path())
                .arg("ark:-")
                .arg(format!("ark,s,cs:{}", posteriors.path().display()))
                .arg("ark:-"),
        )
        .collect(ctx, utterance(feats).into())?;

        let ivector = first_vector(records, "ivector-extract")?;
        ctx.log.info(&format!("I-vector of dimension {}", ivector.len()));
        Ok(ivector)
    })
}
