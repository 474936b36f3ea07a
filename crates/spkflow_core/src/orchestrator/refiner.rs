//! Accumulate/estimate refinement loop.
//!
//! ```text
//! Init(model_0) -> [ accumulate(model_i) -> estimate(acc_i) -> model_i+1 ]*K -> Done(model_K)
//!                          \______________ any error ______________/
//!                                          -> Failed
//! ```
//!
//! The refiner owns the current [`Model`]. Each successful transition
//! replaces it and deletes the superseded file at once, so at most one
//! current and one next model exist at any time. Only the model returned
//! from [`IterativeRefiner::run`] survives; on failure every live model is
//! released before the error is returned.

use std::path::{Path, PathBuf};

use super::errors::{PipelineError, PipelineResult};
use super::types::RunContext;
use crate::temp::{TempArtifact, TempScope};

/// Position of one transition within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassInfo {
    /// 0-based pass index.
    pub index: usize,
    /// Total number of passes.
    pub total: usize,
}

impl PassInfo {
    /// True only for the transition that produces the returned model.
    /// Finalize-only policy (e.g. pruning low-count components) keys off
    /// this.
    pub fn is_final(&self) -> bool {
        self.index + 1 == self.total
    }

    /// 1-based pass number, for logs and errors.
    pub fn number(&self) -> usize {
        self.index + 1
    }
}

/// The two stages of one refinement pass.
///
/// Implementations build and run their pipelines; the refiner supplies
/// fresh artifact paths and owns every file it hands out.
pub trait RefinementPass {
    /// Gather statistics for `model` into `stats`.
    fn accumulate(
        &self,
        ctx: &RunContext,
        model: &Path,
        stats: &Path,
        pass: PassInfo,
    ) -> PipelineResult<()>;

    /// Re-estimate `model` from `stats`, writing the result to `next`.
    fn estimate(
        &self,
        ctx: &RunContext,
        model: &Path,
        stats: &Path,
        next: &Path,
        pass: PassInfo,
    ) -> PipelineResult<()>;
}

/// Refiner state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefinerState {
    Init,
    /// Running pass `i` (0-based).
    Iterating(usize),
    Done,
    Failed,
}

/// An owned model file.
#[derive(Debug)]
pub struct Model {
    artifact: TempArtifact,
    generation: usize,
}

impl Model {
    /// Take ownership of an existing artifact as generation 0.
    pub fn new(artifact: TempArtifact) -> Self {
        Self {
            artifact,
            generation: 0,
        }
    }

    /// Write `text` to a fresh artifact in `scope`.
    pub fn from_text(scope: &TempScope, suffix: &str, text: &str) -> PipelineResult<Self> {
        let artifact = scope.acquire(suffix)?;
        artifact.write_text(text)?;
        Ok(Self::new(artifact))
    }

    pub fn path(&self) -> &Path {
        self.artifact.path()
    }

    /// How many estimate stages produced this model.
    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn read_text(&self) -> PipelineResult<String> {
        Ok(self.artifact.read_text()?)
    }

    pub fn into_artifact(self) -> TempArtifact {
        self.artifact
    }

    /// Move the model file to `dest`; it is no longer managed afterwards.
    pub fn persist_to(self, dest: &Path) -> PipelineResult<PathBuf> {
        self.artifact.persist_to(dest)?;
        Ok(dest.to_path_buf())
    }

    /// Delete the model file now.
    pub fn release(self) -> PipelineResult<()> {
        Ok(self.artifact.release()?)
    }
}

/// Drives a fixed number of accumulate/estimate passes.
#[derive(Debug)]
pub struct IterativeRefiner {
    procedure: String,
    passes: usize,
    model_suffix: String,
    state: RefinerState,
}

impl IterativeRefiner {
    pub fn new(procedure: impl Into<String>, passes: usize) -> Self {
        Self {
            procedure: procedure.into(),
            passes,
            model_suffix: ".mdl".to_string(),
            state: RefinerState::Init,
        }
    }

    /// File suffix for estimated models.
    pub fn with_model_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.model_suffix = suffix.into();
        self
    }

    pub fn state(&self) -> RefinerState {
        self.state
    }

    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Run every pass starting from `initial`.
    ///
    /// With zero passes `initial` is returned unchanged. Otherwise `initial`
    /// is consumed: it is deleted once the first estimate exists, like
    /// every later superseded model.
    pub fn run<P: RefinementPass + ?Sized>(
        &mut self,
        ctx: &RunContext,
        scope: &TempScope,
        initial: Model,
        pass: &P,
    ) -> PipelineResult<Model> {
        self.state = RefinerState::Init;
        if self.passes == 0 {
            ctx.log.debug("No refinement passes requested");
            self.state = RefinerState::Done;
            return Ok(initial);
        }

        let mut current = initial;
        for index in 0..self.passes {
            let info = PassInfo {
                index,
                total: self.passes,
            };
            self.state = RefinerState::Iterating(index);

            let next = match self.transition(ctx, scope, &current, pass, info) {
                Ok(next) => next,
                Err(err) => {
                    self.state = RefinerState::Failed;
                    drop(current);
                    ctx.log.show_tail("Stage diagnostics");
                    return Err(err.in_pass(&self.procedure, info.number(), self.passes));
                }
            };

            let superseded = std::mem::replace(&mut current, next);
            if let Err(e) = superseded.release() {
                ctx.log.warn(&format!("Failed to remove superseded model: {}", e));
            }
        }

        self.state = RefinerState::Done;
        ctx.report_progress(100, "refinement complete");
        Ok(current)
    }

    fn transition<P: RefinementPass + ?Sized>(
        &self,
        ctx: &RunContext,
        scope: &TempScope,
        current: &Model,
        pass: &P,
        info: PassInfo,
    ) -> PipelineResult<Model> {
        ctx.check_cancelled()?;
        ctx.log.pass(info.index, info.total);
        ctx.report_progress(
            (info.index * 100 / info.total) as u32,
            &format!("pass {}/{}", info.number(), info.total),
        );

        let stats = scope.acquire(".acc")?;
        pass.accumulate(ctx, current.path(), stats.path(), info)?;

        let next = scope.acquire(&self.model_suffix)?;
        pass.estimate(ctx, current.path(), stats.path(), next.path(), info)?;

        if next.is_empty()? {
            return Err(PipelineError::missing_output(format!(
                "pass {} of '{}' produced an empty model",
                info.number(),
                self.procedure
            )));
        }

        Ok(Model {
            artifact: next,
            generation: current.generation + 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::CancelHandle;
    use crate::process::{ExitOutcome, StageFailure};
    use std::cell::RefCell;
    use std::fs;
    use tempfile::tempdir;

    /// Writes `generation` into each model and remembers every call.
    #[derive(Default)]
    struct CountingPass {
        calls: RefCell<Vec<(&'static str, usize, bool)>>,
        fail_at: Option<usize>,
    }

    impl RefinementPass for CountingPass {
        fn accumulate(
            &self,
            _ctx: &RunContext,
            model: &Path,
            stats: &Path,
            pass: PassInfo,
        ) -> PipelineResult<()> {
            self.calls
                .borrow_mut()
                .push(("acc", pass.index, pass.is_final()));
            if self.fail_at == Some(pass.index) {
                return Err(StageFailure {
                    pipeline: "acc".to_string(),
                    index: 0,
                    program: "gmm-global-acc-stats".to_string(),
                    args: vec![],
                    outcome: ExitOutcome::Code(1),
                    diagnostics: vec![],
                }
                .into());
            }
            fs::copy(model, stats).unwrap();
            Ok(())
        }

        fn estimate(
            &self,
            _ctx: &RunContext,
            _model: &Path,
            stats: &Path,
            next: &Path,
            pass: PassInfo,
        ) -> PipelineResult<()> {
            self.calls
                .borrow_mut()
                .push(("est", pass.index, pass.is_final()));
            let generation: usize = fs::read_to_string(stats).unwrap().trim().parse().unwrap();
            fs::write(next, format!("{}", generation + 1)).unwrap();
            Ok(())
        }
    }

    fn scope_files(scope: &TempScope) -> usize {
        fs::read_dir(scope.path()).unwrap().count()
    }

    #[test]
    fn zero_passes_returns_initial_model() {
        let root = tempdir().unwrap();
        let scope = TempScope::new_in(root.path(), "refine").unwrap();
        let ctx = RunContext::with_defaults("refine");
        let initial = Model::from_text(&scope, ".mdl", "0").unwrap();
        let initial_path = initial.path().to_path_buf();

        let pass = CountingPass::default();
        let mut refiner = IterativeRefiner::new("refine", 0);
        let model = refiner.run(&ctx, &scope, initial, &pass).unwrap();

        assert_eq!(model.path(), initial_path);
        assert_eq!(model.generation(), 0);
        assert_eq!(model.read_text().unwrap(), "0");
        assert!(pass.calls.borrow().is_empty());
        assert_eq!(refiner.state(), RefinerState::Done);
    }

    #[test]
    fn runs_exactly_k_transitions_with_final_flag_last() {
        let root = tempdir().unwrap();
        let scope = TempScope::new_in(root.path(), "refine").unwrap();
        let ctx = RunContext::with_defaults("refine");
        let initial = Model::from_text(&scope, ".mdl", "0").unwrap();
        let initial_path = initial.path().to_path_buf();

        let pass = CountingPass::default();
        let mut refiner = IterativeRefiner::new("refine", 4);
        let model = refiner.run(&ctx, &scope, initial, &pass).unwrap();

        assert_eq!(model.generation(), 4);
        assert_eq!(model.read_text().unwrap(), "4");
        assert_eq!(refiner.state(), RefinerState::Done);

        let calls = pass.calls.borrow();
        assert_eq!(calls.len(), 8);
        let finals: Vec<_> = calls.iter().filter(|c| c.2).collect();
        assert_eq!(finals, vec![&("acc", 3, true), &("est", 3, true)]);

        // Only the returned model is left; model_0 was superseded too.
        assert!(!initial_path.exists());
        assert_eq!(scope_files(&scope), 1);
    }

    #[test]
    fn failure_releases_every_model() {
        let root = tempdir().unwrap();
        let scope = TempScope::new_in(root.path(), "refine").unwrap();
        let ctx = RunContext::with_defaults("train_full_ubm");
        let initial = Model::from_text(&scope, ".mdl", "0").unwrap();

        let pass = CountingPass {
            fail_at: Some(2),
            ..Default::default()
        };
        let mut refiner = IterativeRefiner::new("train_full_ubm", 4);
        let err = refiner.run(&ctx, &scope, initial, &pass).unwrap_err();

        assert_eq!(refiner.state(), RefinerState::Failed);
        assert!(matches!(
            err,
            PipelineError::PassFailed { pass: 3, total: 4, .. }
        ));
        assert!(err.stage_failure().is_some());
        assert_eq!(scope_files(&scope), 0);
    }

    #[test]
    fn cancellation_stops_before_next_pass() {
        let root = tempdir().unwrap();
        let scope = TempScope::new_in(root.path(), "refine").unwrap();
        let handle = CancelHandle::new();
        handle.cancel();
        let ctx = RunContext::with_defaults("train_mono").with_cancel_handle(handle);
        let initial = Model::from_text(&scope, ".mdl", "0").unwrap();

        let pass = CountingPass::default();
        let mut refiner = IterativeRefiner::new("train_mono", 3);
        let err = refiner.run(&ctx, &scope, initial, &pass).unwrap_err();

        assert!(err.is_cancelled());
        assert!(pass.calls.borrow().is_empty());
        assert_eq!(scope_files(&scope), 0);
    }

    #[test]
    fn pass_info_flags() {
        let last = PassInfo { index: 2, total: 3 };
        assert!(last.is_final());
        assert_eq!(last.number(), 3);
        assert!(!PassInfo { index: 0, total: 3 }.is_final());
    }
}
