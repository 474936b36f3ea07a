//! Monophone HMM training.
//!
//! Equal alignment bootstraps the first model; every pass then re-aligns,
//! accumulates and re-estimates, mixing up Gaussians as it goes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{ark, hand_over, run_tool, within_scope, write_archive, write_text, TrainedModel};
use crate::archive::{Matrix, Record};
use crate::orchestrator::{
    IterativeRefiner, Model, PassInfo, PipelineError, PipelineResult, RefinementPass, RunContext,
};
use crate::process::StageSpec;
use crate::temp::TempArtifact;

/// `[mono]` options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonoOptions {
    /// Total Gaussians once mixing up is complete.
    pub num_gauss: u32,
    /// Gaussians of the bootstrap model. Unset keeps `num_gauss` for
    /// every pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_gauss_init: Option<u32>,
    /// Exponent allocating Gaussians to states by occupancy.
    pub power: f64,
    pub num_iters: usize,
    /// Alignment beam; the retry beam is four times this.
    pub beam: f64,
    /// Passes over which the Gaussian count grows.
    pub max_iter_inc: usize,
    pub min_gaussian_occupancy: u32,
}

impl Default for MonoOptions {
    fn default() -> Self {
        Self {
            num_gauss: 1000,
            num_gauss_init: None,
            power: 0.25,
            num_iters: 40,
            beam: 6.0,
            max_iter_inc: 30,
            min_gaussian_occupancy: 3,
        }
    }
}

impl MonoOptions {
    /// Gaussian target for the bootstrap estimate.
    pub fn initial_gauss(&self) -> u32 {
        self.num_gauss_init.unwrap_or(self.num_gauss)
    }

    /// Gaussian target after pass `index` (0-based).
    ///
    /// Grows linearly from `num_gauss_init` to `num_gauss` over the first
    /// `max_iter_inc` passes and stays at `num_gauss` afterwards.
    pub fn gauss_at(&self, index: usize) -> u32 {
        let Some(init) = self.num_gauss_init else {
            return self.num_gauss;
        };
        if index >= self.max_iter_inc || self.max_iter_inc == 0 || init >= self.num_gauss {
            return self.num_gauss;
        }
        let span = u64::from(self.num_gauss - init);
        let step = span * (index as u64 + 1) / self.max_iter_inc as u64;
        init + step as u32
    }
}

/// Inputs that stay fixed over a whole training run.
#[derive(Debug, Clone, Copy)]
pub struct MonoInputs<'a> {
    /// Utterance id and features, in training order.
    pub feats: &'a [(String, Matrix)],
    /// Word-level transcript, one `utt w1 w2 …` line per utterance.
    pub transcript: &'a str,
    /// Lexicon compiled as an FST.
    pub lexicon_fst: &'a Path,
    /// HMM topology, text form.
    pub topology: &'a str,
    /// Phone sets whose pdfs are shared.
    pub shared_phones: Option<&'a Path>,
}

struct MonoPass<'a> {
    feats: &'a Path,
    graphs: &'a Path,
    alignment: &'a TempArtifact,
    opts: &'a MonoOptions,
}

impl RefinementPass for MonoPass<'_> {
    fn accumulate(
        &self,
        ctx: &RunContext,
        model: &Path,
        stats: &Path,
        _pass: PassInfo,
    ) -> PipelineResult<()> {
        run_tool(
            ctx,
            StageSpec::new("gmm-align-compiled")
                .opt("transition-scale", "1.0")
                .opt("acoustic-scale", 0.1)
                .opt("self-loop-scale", 0.1)
                .opt("beam", self.opts.beam)
                .opt("retry-beam", self.opts.beam * 4.0)
                .opt("careful", false)
                .path(model)
                .archive("ark,t", self.graphs)
                .arg(ark(self.feats))
                .arg(ark(self.alignment.path())),
        )?;
        run_tool(
            ctx,
            StageSpec::new("gmm-acc-stats-ali")
                .path(model)
                .arg(ark(self.feats))
                .arg(ark(self.alignment.path()))
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
            StageSpec::new("gmm-est")
                .opt("binary", false)
                .opt("mix-up", self.opts.gauss_at(pass.index))
                .opt("power", self.opts.power)
                .path(model)
                .path(stats)
                .path(next),
        )
    }
}

/// Train a monophone model. Returns the text form of the final model.
pub fn train_mono(
    ctx: &RunContext,
    inputs: &MonoInputs<'_>,
    opts: &MonoOptions,
    save_to: Option<&Path>,
) -> PipelineResult<TrainedModel> {
    let Some((_, first)) = inputs.feats.first() else {
        return Err(PipelineError::invalid_input("monophone training needs features"));
    };
    let feat_dim = first.cols();
    ctx.log.phase("Monophone training");
    ctx.log.info(&format!(
        "{} utterances, dimension {}, {} passes",
        inputs.feats.len(),
        feat_dim,
        opts.num_iters
    ));

    within_scope(ctx, "train_mono", |scope| {
        let records: Vec<Record> = inputs
            .feats
            .iter()
            .map(|(utt, m)| Record::matrix(utt.as_str(), m.clone()))
            .collect();
        let feats = write_archive(scope, ".ark", &records)?;
        let topology = write_text(scope, ".top", inputs.topology)?;
        let transcript = write_text(scope, ".tra", inputs.transcript)?;

        let init = scope.acquire(".mdl")?;
        let tree = scope.acquire(".tree")?;
        let mut init_spec = StageSpec::new("gmm-init-mono");
        if let Some(shared) = inputs.shared_phones {
            init_spec = init_spec.arg(format!("--shared-phones={}", shared.display()));
        }
        run_tool(
            ctx,
            init_spec
                .arg(format!("--train-feats={}", ark(feats.path())))
                .path(topology.path())
                .arg(feat_dim.to_string())
                .path(init.path())
                .path(tree.path()),
        )?;

        let graphs = scope.acquire(".fst")?;
        run_tool(
            ctx,
            StageSpec::new("compile-train-graphs")
                .path(tree.path())
                .path(init.path())
                .path(inputs.lexicon_fst)
                .archive("ark,t", transcript.path())
                .archive("ark,t", graphs.path()),
        )?;

        let alignment = scope.acquire(".ali")?;
        run_tool(
            ctx,
            StageSpec::new("align-equal-compiled")
                .archive("ark,t", graphs.path())
                .arg(ark(feats.path()))
                .archive("ark,t", alignment.path()),
        )?;

        let stats = scope.acquire(".acc")?;
        run_tool(
            ctx,
            StageSpec::new("gmm-acc-stats-ali")
                .path(init.path())
                .arg(ark(feats.path()))
                .archive("ark,t", alignment.path())
                .path(stats.path()),
        )?;

        let bootstrap = scope.acquire(".mdl")?;
        run_tool(
            ctx,
            StageSpec::new("gmm-est")
                .opt("min-gaussian-occupancy", opts.min_gaussian_occupancy)
                .opt("mix-up", opts.initial_gauss())
                .opt("power", opts.power)
                .opt("binary", false)
                .path(init.path())
                .path(stats.path())
                .path(bootstrap.path()),
        )?;
        stats.release()?;
        if bootstrap.is_empty()? {
            return Err(PipelineError::missing_output("gmm-est wrote an empty bootstrap model"));
        }

        let pass = MonoPass {
            feats: feats.path(),
            graphs: graphs.path(),
            alignment: &alignment,
            opts,
        };
        let model = IterativeRefiner::new("train_mono", opts.num_iters)
            .run(ctx, scope, Model::new(bootstrap), &pass)?;

        let text = model.read_text()?;
        hand_over(text, model, save_to)
    })
}
