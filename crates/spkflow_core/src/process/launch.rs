//! Running stage processes and what they leave behind.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};

use thiserror::Error;

use super::stage::StageSpec;
use crate::temp::{ResourceResult, TempArtifact, TempScope};

/// Diagnostics beyond this many trailing bytes are never read back.
const TAIL_WINDOW: u64 = 64 * 1024;

/// Signal delivered to a writer whose reader has exited.
const SIGPIPE: i32 = 13;

/// How a stage process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited with a status code.
    Code(i32),
    /// Terminated by a signal.
    Signal(i32),
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitOutcome::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitOutcome::Signal(signal);
            }
        }
        ExitOutcome::Code(-1)
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitOutcome::Code(0))
    }

    /// Killed because its output pipe closed. Usually a downstream effect
    /// rather than the root cause of a pipeline failure.
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, ExitOutcome::Signal(SIGPIPE))
    }

    /// Exit code, or -1 for signals (the convention for `CommandFailed`).
    pub fn code(&self) -> i32 {
        match self {
            ExitOutcome::Code(c) => *c,
            ExitOutcome::Signal(_) => -1,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Code(c) => write!(f, "exit code {}", c),
            ExitOutcome::Signal(s) => write!(f, "signal {}", s),
        }
    }
}

/// A stage that exited unsuccessfully.
#[derive(Error, Debug, Clone)]
#[error(
    "{program} failed with {outcome} (stage {index} of pipeline '{pipeline}'){}",
    format_tail(.diagnostics)
)]
pub struct StageFailure {
    pub pipeline: String,
    pub index: usize,
    pub program: String,
    pub args: Vec<String>,
    pub outcome: ExitOutcome,
    /// Last lines the program wrote to its diagnostic stream.
    pub diagnostics: Vec<String>,
}

impl StageFailure {
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn format_tail(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!(":\n  {}", lines.join("\n  "))
    }
}

/// The diagnostic stream of one stage, captured to a scoped temp file.
#[derive(Debug)]
pub struct DiagnosticsCapture {
    artifact: TempArtifact,
}

impl DiagnosticsCapture {
    pub fn create(scope: &TempScope, index: usize) -> ResourceResult<Self> {
        Ok(Self {
            artifact: scope.acquire(&format!(".stage{}.log", index))?,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        self.artifact.path()
    }

    /// A writable handle for the child's stderr.
    pub fn stdio(&self) -> io::Result<Stdio> {
        File::create(self.artifact.path()).map(Stdio::from)
    }

    /// Up to `lines` trailing lines. Only the end of the file is read, so
    /// chatty long-running stages cost a bounded amount of memory.
    pub fn tail(&self, lines: usize) -> Vec<String> {
        if lines == 0 {
            return Vec::new();
        }
        match read_tail(self.artifact.path(), TAIL_WINDOW) {
            Ok(text) => {
                let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
                let start = all.len().saturating_sub(lines);
                all[start..].iter().map(|l| l.to_string()).collect()
            }
            Err(e) => vec![format!("<diagnostics unavailable: {}>", e)],
        }
    }
}

fn read_tail(path: &std::path::Path, window: u64) -> io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(window);
    file.seek(SeekFrom::Start(start))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    if start > 0 {
        // Drop the partial first line.
        if let Some(pos) = text.find('\n') {
            text.drain(..=pos);
        }
    }
    Ok(text)
}

/// A started stage process.
#[derive(Debug)]
pub struct LaunchedStage {
    pub index: usize,
    pub program: String,
    pub args: Vec<String>,
    child: Child,
    diagnostics: DiagnosticsCapture,
    outcome: Option<ExitOutcome>,
}

/// Pipe ends handed back by [`LaunchedStage::spawn`].
pub struct StageEndpoints {
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
}

impl LaunchedStage {
    /// Start `spec` as process `executable` with the given stdio bindings.
    pub fn spawn(
        index: usize,
        spec: &StageSpec,
        executable: PathBuf,
        stdin: Stdio,
        stdout: Stdio,
        diagnostics: DiagnosticsCapture,
    ) -> io::Result<(Self, StageEndpoints)> {
        let mut cmd = Command::new(&executable);
        cmd.args(spec.arguments())
            .stdin(stdin)
            .stdout(stdout)
            .stderr(diagnostics.stdio()?);

        tracing::debug!("Spawning stage {}: {:?}", index, cmd);
        let mut child = cmd.spawn()?;

        let endpoints = StageEndpoints {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
        };
        Ok((
            Self {
                index,
                program: spec.program().to_string(),
                args: spec.arguments().to_vec(),
                child,
                diagnostics,
                outcome: None,
            },
            endpoints,
        ))
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn outcome(&self) -> Option<ExitOutcome> {
        self.outcome
    }

    pub fn diagnostics(&self) -> &DiagnosticsCapture {
        &self.diagnostics
    }

    /// Non-blocking reap.
    pub fn try_reap(&mut self) -> io::Result<Option<ExitOutcome>> {
        if self.outcome.is_none() {
            self.outcome = self.child.try_wait()?.map(ExitOutcome::from_status);
        }
        Ok(self.outcome)
    }

    /// Blocking reap.
    pub fn reap(&mut self) -> io::Result<ExitOutcome> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome);
        }
        let outcome = ExitOutcome::from_status(self.child.wait()?);
        self.outcome = Some(outcome);
        Ok(outcome)
    }

    /// Kill the process if it has not been reaped yet.
    pub fn kill(&mut self) {
        if self.outcome.is_none() {
            // Already-exited children report an error here; that is fine.
            let _ = self.child.kill();
        }
    }

    /// Build the failure report for this stage.
    pub fn failure(&self, pipeline: &str, tail_lines: usize) -> Option<StageFailure> {
        let outcome = self.outcome?;
        if outcome.success() {
            return None;
        }
        Some(StageFailure {
            pipeline: pipeline.to_string(),
            index: self.index,
            program: self.program.clone(),
            args: self.args.clone(),
            outcome,
            diagnostics: self.diagnostics.tail(tail_lines),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn failure_display_includes_tail() {
        let failure = StageFailure {
            pipeline: "ubm-init".to_string(),
            index: 1,
            program: "gmm-gselect".to_string(),
            args: vec!["--n=30".to_string()],
            outcome: ExitOutcome::Code(1),
            diagnostics: vec!["ERROR (gmm-gselect) bad model".to_string()],
        };
        let msg = failure.to_string();
        assert!(msg.contains("gmm-gselect failed with exit code 1"));
        assert!(msg.contains("ubm-init"));
        assert!(msg.contains("bad model"));
        assert_eq!(failure.command_line(), "gmm-gselect --n=30");
    }

    #[test]
    fn tail_keeps_last_lines() {
        let root = tempdir().unwrap();
        let scope = TempScope::new_in(root.path(), "diag").unwrap();
        let capture = DiagnosticsCapture::create(&scope, 0).unwrap();
        {
            let mut f = File::create(capture.path()).unwrap();
            for i in 0..50 {
                writeln!(f, "line {}", i).unwrap();
            }
        }

        let tail = capture.tail(3);
        assert_eq!(tail, vec!["line 47", "line 48", "line 49"]);
        assert!(capture.tail(0).is_empty());
    }

    #[test]
    fn tail_window_drops_partial_line() {
        let root = tempdir().unwrap();
        let path = root.path().join("big.log");
        let mut content = String::new();
        for i in 0..100 {
            content.push_str(&format!("message number {}\n", i));
        }
        std::fs::write(&path, &content).unwrap();

        let text = read_tail(&path, 40).unwrap();
        assert!(text.starts_with("message number"));
        assert!(text.ends_with("message number 99\n"));
    }

    #[test]
    fn outcome_display() {
        assert_eq!(ExitOutcome::Code(3).to_string(), "exit code 3");
        assert_eq!(ExitOutcome::Signal(13).to_string(), "signal 13");
        assert!(ExitOutcome::Signal(13).is_broken_pipe());
        assert!(!ExitOutcome::Code(13).is_broken_pipe());
    }

    #[cfg(unix)]
    #[test]
    fn reaps_exit_code() {
        let root = tempdir().unwrap();
        let scope = TempScope::new_in(root.path(), "reap").unwrap();
        let spec = StageSpec::new("sh").args(["-c", "echo oops >&2; exit 4"]);
        let diagnostics = DiagnosticsCapture::create(&scope, 0).unwrap();

        let (mut stage, _ends) = LaunchedStage::spawn(
            0,
            &spec,
            PathBuf::from("sh"),
            Stdio::null(),
            Stdio::null(),
            diagnostics,
        )
        .unwrap();

        assert_eq!(stage.reap().unwrap(), ExitOutcome::Code(4));
        let failure = stage.failure("test", 5).unwrap();
        assert_eq!(failure.diagnostics, vec!["oops"]);
    }
}
