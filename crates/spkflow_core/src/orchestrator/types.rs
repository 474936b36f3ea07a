//! Core types shared by pipelines, the refiner, and procedures.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::cancel::{pending_reason, CancelHandle, CancelReason, Deadline};
use super::errors::{PipelineError, PipelineResult};
use crate::config::Settings;
use crate::logging::{LogConfig, RunLog};
use crate::process::resolve_program;
use crate::temp::TempScope;

/// Progress callback type for reporting procedure progress.
///
/// Arguments: (procedure, percent_complete, message)
pub type ProgressCallback = Box<dyn Fn(&str, u32, &str) + Send + Sync>;

/// Read-only context for one procedure call.
///
/// Carries the settings, the run's diagnostics sink, and the optional
/// cancellation handle and deadline that every pipeline started under this
/// context honours.
pub struct RunContext {
    /// Procedure name, used in logs and errors.
    pub procedure: String,
    /// Toolkit location, scratch root, and procedure defaults.
    pub settings: Arc<Settings>,
    /// Per-run logger.
    pub log: Arc<RunLog>,
    cancel: Option<CancelHandle>,
    deadline: Option<Deadline>,
    progress_callback: Option<ProgressCallback>,
}

impl RunContext {
    /// Create a context. The deadline starts counting now when the
    /// settings configure a timeout.
    pub fn new(procedure: impl Into<String>, settings: Arc<Settings>, log: Arc<RunLog>) -> Self {
        let deadline = settings.toolkit.timeout().map(Deadline::from_now);
        Self {
            procedure: procedure.into(),
            settings,
            log,
            cancel: None,
            deadline,
            progress_callback: None,
        }
    }

    /// Create a context whose run log follows the `[logging]` settings,
    /// writing `<log_dir>/<procedure>.log` when a log folder is configured.
    pub fn from_settings(
        procedure: impl Into<String>,
        settings: Arc<Settings>,
    ) -> PipelineResult<Self> {
        let procedure = procedure.into();
        let config = settings.logging.to_log_config();
        let log = match &settings.logging.log_dir {
            Some(dir) => RunLog::with_file(&procedure, dir, config)
                .map_err(|e| PipelineError::io_error("opening run log", e))?,
            None => RunLog::new(&procedure, config),
        };
        Ok(Self::new(procedure, settings, Arc::new(log)))
    }

    /// Default settings, tracing-only log.
    pub fn with_defaults(procedure: impl Into<String>) -> Self {
        let procedure = procedure.into();
        let log = Arc::new(RunLog::new(&procedure, LogConfig::default()));
        Self::new(procedure, Arc::new(Settings::default()), log)
    }

    pub fn with_cancel_handle(mut self, handle: CancelHandle) -> Self {
        self.cancel = Some(handle);
        self
    }

    /// Replace the deadline with one `after` from now.
    pub fn with_timeout(mut self, after: Duration) -> Self {
        self.deadline = Some(Deadline::from_now(after));
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Report progress to callback (if set).
    pub fn report_progress(&self, percent: u32, message: &str) {
        if let Some(ref callback) = self.progress_callback {
            callback(&self.procedure, percent, message);
        }
        self.log.progress(percent);
    }

    pub fn cancel_handle(&self) -> Option<&CancelHandle> {
        self.cancel.as_ref()
    }

    pub fn deadline(&self) -> Option<&Deadline> {
        self.deadline.as_ref()
    }

    /// Whether a watchdog is needed for pipelines run under this context.
    pub fn is_interruptible(&self) -> bool {
        self.cancel.is_some() || self.deadline.is_some()
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        pending_reason(self.cancel.as_ref(), self.deadline.as_ref())
    }

    /// Fail with `Cancelled` if cancellation was requested or the deadline
    /// passed.
    pub fn check_cancelled(&self) -> PipelineResult<()> {
        match self.cancel_reason() {
            Some(reason) => Err(PipelineError::cancelled(&self.procedure, reason)),
            None => Ok(()),
        }
    }

    /// A fresh scratch scope under the configured temp root.
    pub fn temp_scope(&self, label: &str) -> PipelineResult<TempScope> {
        let scope = match &self.settings.toolkit.temp_root {
            Some(root) => TempScope::new_in(root, label)?,
            None => TempScope::new(label)?,
        };
        Ok(scope)
    }

    /// Resolve a toolkit program name against `[toolkit] bin_dir`.
    pub fn executable(&self, program: &str) -> PathBuf {
        resolve_program(self.settings.toolkit.bin_dir.as_deref(), program)
    }

    /// Number of diagnostic lines kept in failure reports.
    pub fn error_tail(&self) -> usize {
        self.log.config().error_tail
    }
}
