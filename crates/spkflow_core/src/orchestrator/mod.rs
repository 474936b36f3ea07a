//! Pipeline orchestration and iterative refinement.
//!
//! This module turns external programs into procedures. Pipelines chain
//! stages through OS pipes; the refiner threads an owned model through a
//! fixed number of accumulate/estimate passes.
//!
//! # Architecture
//!
//! ```text
//! Procedure (RunContext, TempScope)
//!     ├── Pipeline: init       stage ─▶ stage ─▶ …
//!     ├── IterativeRefiner     pass 1 … K
//!     │       ├── accumulate   Pipeline
//!     │       └── estimate     Pipeline
//!     └── Pipeline: export
//! ```
//!
//! # Example
//!
//! ```no_run
//! use spkflow_core::orchestrator::{Pipeline, PipelineInput, RunContext};
//! use spkflow_core::process::StageSpec;
//!
//! let ctx = RunContext::with_defaults("deltas");
//! let pipeline = Pipeline::new("deltas")
//!     .with_stage(StageSpec::new("add-deltas").args(["ark:-", "ark:-"]))
//!     .with_stage(StageSpec::new("copy-feats").args(["ark:-", "ark:-"]));
//!
//! for record in pipeline.run(&ctx, PipelineInput::None).unwrap() {
//!     let record = record.unwrap();
//!     println!("{}", record.key);
//! }
//! ```

mod cancel;
mod errors;
mod pipeline;
mod refiner;
mod types;

pub use cancel::{CancelHandle, CancelReason, Deadline, Watchdog};
pub use errors::{PipelineError, PipelineResult};
pub use pipeline::{Pipeline, PipelineInput, RunningPipeline};
pub use refiner::{IterativeRefiner, Model, PassInfo, RefinementPass, RefinerState};
pub use types::{ProgressCallback, RunContext};
