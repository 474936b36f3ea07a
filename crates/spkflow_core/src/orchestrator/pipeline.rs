//! Linear process pipelines.
//!
//! A [`Pipeline`] is an immutable list of [`StageSpec`]s. Running it starts
//! every stage before any data moves: stage `i`'s standard output is handed
//! to stage `i + 1` as its standard input at the OS level, the caller's
//! records are written to the first stage by a dedicated feeder thread, and
//! the last stage's output is decoded lazily on the calling thread. The
//! orchestrator never buffers a stream in memory; stages that need a
//! seekable input get a spool file instead.
//!
//! Once every stage has been reaped the run is *settled*: diagnostics of
//! failed stages are read back, the run's temp scope is removed, and the
//! outcome is reported. A run is settled exactly once, whichever way it
//! ends (end of output, decode error, explicit finish, or drop).

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::process::{ChildStdin, ChildStdout, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use super::cancel::Watchdog;
use super::errors::{PipelineError, PipelineResult};
use super::types::RunContext;
use crate::archive::{
    decode_stream, encode, encode_all, ArchiveReader, FormatError, FormatResult, Record,
};
use crate::logging::RunLog;
use crate::process::{
    DiagnosticsCapture, LaunchedStage, StageFailure, StageInput, StageOutput, StageSpec,
};
use crate::temp::{TempArtifact, TempScope};

/// Reap poll interval while a watchdog may need the stage list.
const REAP_POLL: Duration = Duration::from_millis(5);

/// What the first stage reads.
pub enum PipelineInput {
    /// Nothing; the first stage sees end of input immediately.
    None,
    /// Records shared with the caller, encoded as an archive.
    Records(Arc<[Record]>),
    /// Records produced on demand, encoded as an archive.
    Stream(Box<dyn Iterator<Item = Record> + Send>),
    /// Raw bytes, e.g. an `scp` line or a text table.
    Bytes(Vec<u8>),
}

impl PipelineInput {
    pub fn records(records: Vec<Record>) -> Self {
        PipelineInput::Records(records.into())
    }

    /// Records that are fed to several runs without copying.
    pub fn shared(records: &Arc<[Record]>) -> Self {
        PipelineInput::Records(Arc::clone(records))
    }

    pub fn stream<I>(records: I) -> Self
    where
        I: IntoIterator<Item = Record>,
        I::IntoIter: Send + 'static,
    {
        PipelineInput::Stream(Box::new(records.into_iter()))
    }

    pub fn text(text: impl Into<String>) -> Self {
        PipelineInput::Bytes(text.into().into_bytes())
    }

    pub fn is_none(&self) -> bool {
        matches!(self, PipelineInput::None)
    }

    /// Write everything to `out`. Returns the number of records (or bytes
    /// for raw input) written.
    fn write_to<W: Write>(self, out: &mut W) -> FormatResult<usize> {
        match self {
            PipelineInput::None => Ok(0),
            PipelineInput::Records(records) => encode_all(out, records.iter()),
            PipelineInput::Stream(records) => {
                let mut count = 0;
                for record in records {
                    encode(out, &record)?;
                    count += 1;
                }
                Ok(count)
            }
            PipelineInput::Bytes(bytes) => {
                out.write_all(&bytes)
                    .map_err(|e| FormatError::io("writing input", e))?;
                Ok(bytes.len())
            }
        }
    }
}

impl From<Vec<Record>> for PipelineInput {
    fn from(records: Vec<Record>) -> Self {
        PipelineInput::records(records)
    }
}

impl From<Record> for PipelineInput {
    fn from(record: Record) -> Self {
        PipelineInput::records(vec![record])
    }
}

impl fmt::Debug for PipelineInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineInput::None => write!(f, "None"),
            PipelineInput::Records(r) => write!(f, "Records({})", r.len()),
            PipelineInput::Stream(_) => write!(f, "Stream"),
            PipelineInput::Bytes(b) => write!(f, "Bytes({})", b.len()),
        }
    }
}

/// An ordered, immutable list of stages.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    stages: Vec<StageSpec>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    /// A pipeline of exactly one stage.
    pub fn single(name: impl Into<String>, stage: StageSpec) -> Self {
        Self::new(name).with_stage(stage)
    }

    /// Add a stage (builder pattern).
    pub fn with_stage(mut self, stage: StageSpec) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn add_stage(&mut self, stage: StageSpec) {
        self.stages.push(stage);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(StageSpec::program).collect()
    }

    /// Check that the stages can be wired together and accept `input`.
    pub fn validate(&self, input: &PipelineInput) -> PipelineResult<()> {
        let Some(first) = self.stages.first() else {
            return Err(PipelineError::invalid_pipeline(&self.name, "no stages"));
        };

        let reads_pipe = |spec: &StageSpec| {
            matches!(spec.input(), StageInput::Pipe | StageInput::Spooled)
        };

        if !input.is_none() && !reads_pipe(first) {
            return Err(PipelineError::invalid_input(format!(
                "pipeline '{}' was given input but '{}' does not read it",
                self.name,
                first.program()
            )));
        }

        for pair in self.stages.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            let pipes = *prev.output() == StageOutput::Pipe;
            if pipes != reads_pipe(next) {
                return Err(PipelineError::invalid_pipeline(
                    &self.name,
                    format!(
                        "'{}' and '{}' disagree about the pipe between them",
                        prev.program(),
                        next.program()
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Start every stage and return the running pipeline.
    ///
    /// Any failure while starting up kills what was already started and
    /// releases the run's temp scope before the error is returned.
    pub fn run(&self, ctx: &RunContext, input: PipelineInput) -> PipelineResult<RunningPipeline> {
        self.validate(&input)?;
        ctx.check_cancelled()?;

        let scope = ctx.temp_scope(&self.name)?;
        let stages = Arc::new(Mutex::new(Vec::with_capacity(self.stages.len())));
        let watchdog = if ctx.is_interruptible() {
            let dog = Watchdog::spawn(
                &self.name,
                Arc::clone(&stages),
                ctx.cancel_handle().cloned(),
                ctx.deadline().copied(),
            )
            .map_err(|e| PipelineError::io_error("starting watchdog", e))?;
            Some(dog)
        } else {
            None
        };

        let mut running = RunningPipeline {
            name: self.name.clone(),
            procedure: ctx.procedure.clone(),
            stages,
            reader: None,
            feeder: None,
            watchdog,
            spools: Vec::new(),
            scope: None,
            log: Arc::clone(&ctx.log),
            error_tail: ctx.error_tail(),
            settled: false,
        };

        let launched = running.launch(self, ctx, &scope, input);
        running.scope = Some(scope);
        match launched {
            Ok(()) => Ok(running),
            Err(err) => Err(running.abort(err)),
        }
    }

    /// Run to completion, discarding any output.
    pub fn execute(&self, ctx: &RunContext, input: PipelineInput) -> PipelineResult<()> {
        self.run(ctx, input)?.finish()
    }

    /// Run to completion and decode all output records.
    pub fn collect(&self, ctx: &RunContext, input: PipelineInput) -> PipelineResult<Vec<Record>> {
        self.run(ctx, input)?.collect()
    }

    /// Run to completion and return the output as text.
    pub fn read_text(&self, ctx: &RunContext, input: PipelineInput) -> PipelineResult<String> {
        self.run(ctx, input)?.read_text()
    }
}

/// A started pipeline.
///
/// Iterating yields the last stage's output records as they are decoded.
/// After the last record the run settles; a failure found while settling
/// is yielded as the final item.
pub struct RunningPipeline {
    name: String,
    procedure: String,
    stages: Arc<Mutex<Vec<LaunchedStage>>>,
    reader: Option<ArchiveReader<BufReader<ChildStdout>>>,
    feeder: Option<JoinHandle<FormatResult<usize>>>,
    watchdog: Option<Watchdog>,
    spools: Vec<TempArtifact>,
    scope: Option<TempScope>,
    log: Arc<RunLog>,
    error_tail: usize,
    settled: bool,
}

impl RunningPipeline {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drain remaining output and wait for every stage.
    pub fn finish(mut self) -> PipelineResult<()> {
        if self.settled {
            return Ok(());
        }
        let drained = match self.reader.take() {
            Some(reader) => io::copy(&mut reader.into_inner(), &mut io::sink())
                .map(|_| ())
                .map_err(|e| PipelineError::io_error("draining pipeline output", e)),
            None => Ok(()),
        };
        self.settle(drained.err())
    }

    /// Read all remaining output as (lossy) UTF-8 text.
    pub fn read_text(mut self) -> PipelineResult<String> {
        let mut bytes = Vec::new();
        let read = match self.reader.take() {
            Some(reader) => reader
                .into_inner()
                .read_to_end(&mut bytes)
                .map(|_| ())
                .map_err(|e| PipelineError::io_error("reading pipeline output", e)),
            None => Ok(()),
        };
        self.settle(read.err())?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Decode every remaining record.
    pub fn collect(self) -> PipelineResult<Vec<Record>> {
        Iterator::collect(self)
    }

    fn launch(
        &mut self,
        pipeline: &Pipeline,
        ctx: &RunContext,
        scope: &TempScope,
        input: PipelineInput,
    ) -> PipelineResult<()> {
        let has_input = !input.is_none();
        let mut input = Some(input);
        let mut upstream: Option<ChildStdout> = None;

        for (index, spec) in pipeline.stages.iter().enumerate() {
            ctx.check_cancelled()?;

            let mut feed = false;
            let stdin = match spec.input() {
                StageInput::Pipe => match upstream.take() {
                    Some(out) => Stdio::from(out),
                    None if index == 0 && has_input => {
                        feed = true;
                        Stdio::piped()
                    }
                    None => Stdio::null(),
                },
                StageInput::Spooled => {
                    let spool = scope.acquire(&format!(".spool{}", index))?;
                    let caller = if index == 0 { input.take() } else { None };
                    fill_spool(&spool, upstream.take(), caller)?;
                    let file = File::open(spool.path())
                        .map_err(|e| PipelineError::io_error("opening spool", e))?;
                    self.spools.push(spool);
                    Stdio::from(file)
                }
                StageInput::File(path) => File::open(path)
                    .map(Stdio::from)
                    .map_err(|e| {
                        PipelineError::io_error(format!("opening {}", path.display()), e)
                    })?,
                StageInput::Null => Stdio::null(),
            };

            let stdout = match spec.output() {
                StageOutput::Pipe => Stdio::piped(),
                StageOutput::File(path) => File::create(path)
                    .map(Stdio::from)
                    .map_err(|e| {
                        PipelineError::io_error(format!("creating {}", path.display()), e)
                    })?,
                StageOutput::Null => Stdio::null(),
            };

            let diagnostics = DiagnosticsCapture::create(scope, index)?;
            self.log.command(&spec.command_line());
            self.log.command_json(spec.program(), spec.arguments());

            let (stage, ends) = LaunchedStage::spawn(
                index,
                spec,
                ctx.executable(spec.program()),
                stdin,
                stdout,
                diagnostics,
            )
            .map_err(|source| PipelineError::Spawn {
                pipeline: self.name.clone(),
                program: spec.program().to_string(),
                source,
            })?;
            self.stages.lock().push(stage);

            if feed {
                if let (Some(stdin), Some(records)) = (ends.stdin, input.take()) {
                    self.feeder = Some(spawn_feeder(&self.name, stdin, records)?);
                }
            }
            upstream = ends.stdout;
        }

        self.reader = upstream.map(decode_stream);
        tracing::debug!(
            "Pipeline '{}' started {} stage(s)",
            self.name,
            pipeline.stage_count()
        );
        Ok(())
    }

    /// Kill everything, clean up, and hand back `err`.
    fn abort(&mut self, err: PipelineError) -> PipelineError {
        self.terminate();
        err
    }

    fn terminate(&mut self) {
        self.settled = true;
        self.reader = None;
        {
            let mut stages = self.stages.lock();
            for stage in stages.iter_mut() {
                stage.kill();
            }
            for stage in stages.iter_mut() {
                if let Err(e) = stage.reap() {
                    tracing::warn!("Failed to reap '{}': {}", stage.program, e);
                }
            }
        }
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.join();
        }
        if let Some(dog) = self.watchdog.take() {
            dog.stop();
        }
        if let Err(e) = self.release() {
            self.log.warn(&format!("Cleanup after failure: {}", e));
        }
    }

    /// Wait for all stages and turn the run into a single outcome.
    ///
    /// Precedence: cancellation, then a stage failure (stages killed by a
    /// broken pipe only count when nothing else failed), then `pending`
    /// (an error the caller side already hit), then input feeding, then
    /// cleanup.
    fn settle(&mut self, pending: Option<PipelineError>) -> PipelineResult<()> {
        self.settled = true;
        self.reader = None;

        let reap_error = self.reap_all();

        let fed = match self.feeder.take().map(JoinHandle::join) {
            Some(Ok(result)) => result.map(|_| ()),
            Some(Err(_)) => Err(FormatError::io(
                "feeding input",
                io::Error::other("feeder thread panicked"),
            )),
            None => Ok(()),
        };

        let cancelled = self.watchdog.take().and_then(Watchdog::stop);

        let failure = self.select_failure();
        let cleanup = self.release();

        if let Some(reason) = cancelled {
            self.log.warn(&format!("Pipeline '{}' {}", self.name, reason));
            return Err(PipelineError::cancelled(&self.procedure, reason));
        }
        if let Some(e) = reap_error {
            return Err(PipelineError::io_error("waiting for stages", e));
        }
        match failure {
            Some((failure, false)) => return Err(failure.into()),
            Some((failure, true)) if pending.is_none() => return Err(failure.into()),
            _ => {}
        }
        if let Some(err) = pending {
            return Err(err);
        }
        if let Err(e) = fed {
            if e.is_broken_pipe() {
                self.log
                    .warn(&format!("Pipeline '{}' stopped reading its input early", self.name));
            } else {
                return Err(e.into());
            }
        }
        cleanup?;

        tracing::debug!("Pipeline '{}' completed", self.name);
        Ok(())
    }

    fn reap_all(&mut self) -> Option<io::Error> {
        let mut first_error = None;

        if self.watchdog.is_none() {
            for stage in self.stages.lock().iter_mut() {
                if let Err(e) = stage.reap() {
                    first_error.get_or_insert(e);
                }
            }
            return first_error;
        }

        // The watchdog needs the lock to kill, so never block while holding it.
        let mut done = vec![false; self.stages.lock().len()];
        loop {
            {
                let mut stages = self.stages.lock();
                for (stage, done) in stages.iter_mut().zip(done.iter_mut()) {
                    if *done {
                        continue;
                    }
                    match stage.try_reap() {
                        Ok(Some(_)) => *done = true,
                        Ok(None) => {}
                        Err(e) => {
                            first_error.get_or_insert(e);
                            *done = true;
                        }
                    }
                }
            }
            if done.iter().all(|d| *d) {
                return first_error;
            }
            thread::sleep(REAP_POLL);
        }
    }

    /// Pick the failure to report and log stage diagnostics.
    ///
    /// The flag is true when the chosen failure is only a broken pipe.
    fn select_failure(&self) -> Option<(StageFailure, bool)> {
        let stages = self.stages.lock();
        let failures: Vec<StageFailure> = stages
            .iter()
            .filter_map(|s| s.failure(&self.name, self.error_tail))
            .collect();

        for failure in &failures {
            self.log.stage_output(&failure.program, &failure.diagnostics);
        }
        if !self.log.config().compact {
            for stage in stages.iter().filter(|s| s.outcome().is_some_and(|o| o.success())) {
                let lines = stage.diagnostics().tail(self.error_tail);
                self.log.stage_output(&stage.program, &lines);
            }
        }

        let primary = failures
            .iter()
            .position(|f| !f.outcome.is_broken_pipe());
        match primary {
            Some(i) => failures.into_iter().nth(i).map(|f| (f, false)),
            None => failures.into_iter().next().map(|f| (f, true)),
        }
    }

    /// Remove spools and the scratch scope.
    fn release(&mut self) -> PipelineResult<()> {
        self.spools.clear();
        match self.scope.take() {
            Some(scope) => scope.close().map_err(PipelineError::from),
            None => Ok(()),
        }
    }
}

impl Iterator for RunningPipeline {
    type Item = PipelineResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.settled {
            return None;
        }
        let pending = match self.reader.as_mut().map(ArchiveReader::read_record) {
            Some(Ok(Some(record))) => return Some(Ok(record)),
            Some(Ok(None)) | None => None,
            Some(Err(e)) => Some(PipelineError::from(e)),
        };
        self.settle(pending).err().map(Err)
    }
}

impl Drop for RunningPipeline {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!("Pipeline '{}' dropped before completion", self.name);
            self.terminate();
        }
    }
}

fn spawn_feeder(
    name: &str,
    stdin: ChildStdin,
    input: PipelineInput,
) -> PipelineResult<JoinHandle<FormatResult<usize>>> {
    thread::Builder::new()
        .name(format!("{}-feed", name))
        .spawn(move || {
            let mut writer = BufWriter::new(stdin);
            let written = input.write_to(&mut writer)?;
            writer
                .flush()
                .map_err(|e| FormatError::io("flushing input", e))?;
            Ok(written)
        })
        .map_err(|e| PipelineError::io_error("starting input feeder", e))
}

/// Collect a stage's whole input in `spool`.
fn fill_spool(
    spool: &TempArtifact,
    upstream: Option<ChildStdout>,
    caller: Option<PipelineInput>,
) -> PipelineResult<()> {
    let file = File::create(spool.path())
        .map_err(|e| PipelineError::io_error("creating spool", e))?;
    let mut writer = BufWriter::new(file);

    if let Some(mut out) = upstream {
        io::copy(&mut out, &mut writer)
            .map_err(|e| PipelineError::io_error("spooling stage output", e))?;
    }
    if let Some(input) = caller {
        input.write_to(&mut writer)?;
    }
    writer
        .flush()
        .map_err(|e| PipelineError::io_error("spooling stage output", e))
}
