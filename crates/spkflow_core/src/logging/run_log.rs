//! Per-run diagnostics sink.
//!
//! Each procedure call gets its own `RunLog` through its run context.
//! Every line is mirrored into `tracing`; lines at or above the configured
//! level also go to the optional log file and callback. Stage stderr is
//! kept in a bounded tail that is shown when a refinement pass fails.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Local;
use parking_lot::Mutex;

use super::types::{LineKind, LogCallback, LogConfig, LogLevel};

/// Where rendered lines go besides `tracing`.
#[derive(Default)]
struct Sinks {
    file: Option<BufWriter<File>>,
    callback: Option<LogCallback>,
    /// Set after the first failed file write.
    write_failed: bool,
}

impl Sinks {
    /// The callback sees the line even when the file write fails.
    fn emit(&mut self, line: &str) -> io::Result<()> {
        let written = match self.file.as_mut() {
            Some(file) => writeln!(file, "{}", line),
            None => Ok(()),
        };
        if let Some(callback) = self.callback.as_ref() {
            callback(line);
        }
        written
    }

    /// True only for the first failure.
    fn note_failure(&mut self) -> bool {
        !std::mem::replace(&mut self.write_failed, true)
    }
}

/// Diagnostics sink for one procedure run.
pub struct RunLog {
    name: String,
    log_path: Option<PathBuf>,
    config: LogConfig,
    sinks: Mutex<Sinks>,
    /// Most recent stage diagnostics, `program: line`.
    tail: Mutex<VecDeque<String>>,
    /// Last progress value that was written out.
    last_progress: AtomicU32,
}

impl RunLog {
    pub fn new(name: impl Into<String>, config: LogConfig) -> Self {
        Self {
            name: name.into(),
            log_path: None,
            tail: Mutex::new(VecDeque::with_capacity(config.error_tail)),
            config,
            sinks: Mutex::new(Sinks::default()),
            last_progress: AtomicU32::new(0),
        }
    }

    /// A log that also writes `<log_dir>/<name>.log`.
    pub fn with_file(
        name: impl Into<String>,
        log_dir: impl AsRef<Path>,
        config: LogConfig,
    ) -> std::io::Result<Self> {
        let mut log = Self::new(name, config);
        let log_dir = log_dir.as_ref();
        fs::create_dir_all(log_dir)?;

        let log_path = log_dir.join(format!("{}.log", file_stem(&log.name)));
        log.sinks.get_mut().file = Some(BufWriter::new(File::create(&log_path)?));
        log.log_path = Some(log_path);
        Ok(log)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Install or replace the line callback.
    pub fn set_callback(&self, callback: LogCallback) {
        self.sinks.lock().callback = Some(callback);
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        self.line(level, LineKind::Plain, message);
    }

    pub fn info(&self, message: &str) {
        self.line(LogLevel::Info, LineKind::Plain, message);
    }

    pub fn debug(&self, message: &str) {
        self.line(LogLevel::Debug, LineKind::Plain, message);
    }

    pub fn warn(&self, message: &str) {
        self.line(LogLevel::Warn, LineKind::Warning, message);
    }

    pub fn error(&self, message: &str) {
        self.line(LogLevel::Error, LineKind::Error, message);
    }

    pub fn success(&self, message: &str) {
        self.line(LogLevel::Info, LineKind::Success, message);
    }

    /// A stage command line about to run.
    pub fn command(&self, command_line: &str) {
        self.line(LogLevel::Debug, LineKind::Command, command_line);
    }

    /// A stage's argument vector as a JSON array, when enabled.
    pub fn command_json(&self, program: &str, args: &[String]) {
        if !self.config.show_commands_json {
            return;
        }
        let argv: Vec<&str> = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect();
        if let Ok(json) = serde_json::to_string(&argv) {
            self.line(LogLevel::Debug, LineKind::Plain, &json);
        }
    }

    pub fn phase(&self, phase_name: &str) {
        self.line(LogLevel::Info, LineKind::Phase, phase_name);
    }

    /// Start of refinement pass `index` (0-based) of `total`.
    pub fn pass(&self, index: usize, total: usize) {
        let message = format!("pass {}/{}", index + 1, total);
        self.line(LogLevel::Info, LineKind::Pass, &message);
    }

    /// Returns false when compact mode filtered the update out.
    pub fn progress(&self, percent: u32) -> bool {
        if self.config.compact && percent < 100 {
            let step = self.config.progress_step.max(1);
            let last = self.last_progress.load(Ordering::Relaxed);
            if percent / step <= last / step {
                return false;
            }
        }
        self.last_progress.store(percent, Ordering::Relaxed);
        self.info(&format!("Progress: {}%", percent));
        true
    }

    /// Diagnostic lines written by `stage`.
    ///
    /// They always land in the tail; outside compact mode they are also
    /// logged at debug level.
    pub fn stage_output(&self, stage: &str, lines: &[String]) {
        let capacity = self.config.error_tail;
        if capacity > 0 {
            let mut tail = self.tail.lock();
            let skip = lines.len().saturating_sub(capacity);
            for line in &lines[skip..] {
                if tail.len() == capacity {
                    tail.pop_front();
                }
                tail.push_back(format!("{}: {}", stage, line));
            }
        }

        if !self.config.compact {
            for line in lines {
                let message = format!("{}: {}", stage, line);
                self.line(LogLevel::Debug, LineKind::Diagnostic, &message);
            }
        }
    }

    /// Write the tail out under `header`, whatever the configured level.
    pub fn show_tail(&self, header: &str) {
        let tail = self.tail.lock();
        if tail.is_empty() {
            return;
        }
        let mut sinks = self.sinks.lock();
        let result = sinks.emit(&self.stamp(&format!("{} (last {} lines)", header, tail.len())));
        self.check_write(&mut sinks, result);
        for line in tail.iter() {
            tracing::warn!(run = %self.name, "{}", line);
            let result = sinks.emit(&self.stamp(&LineKind::Diagnostic.render(line)));
            self.check_write(&mut sinks, result);
        }
    }

    pub fn clear_tail(&self) {
        self.tail.lock().clear();
    }

    pub fn get_tail(&self) -> Vec<String> {
        self.tail.lock().iter().cloned().collect()
    }

    pub fn flush(&self) {
        let mut sinks = self.sinks.lock();
        if let Some(file) = sinks.file.as_mut() {
            let result = file.flush();
            self.check_write(&mut sinks, result);
        }
    }

    /// Close the log file; later lines still reach tracing and the callback.
    pub fn close(&self) {
        let mut sinks = self.sinks.lock();
        if let Some(mut file) = sinks.file.take() {
            let result = file.flush();
            self.check_write(&mut sinks, result);
        }
    }

    /// Warn once per run about a log file that stopped accepting writes.
    fn check_write(&self, sinks: &mut Sinks, result: io::Result<()>) {
        if let Err(e) = result {
            if sinks.note_failure() {
                tracing::warn!(
                    run = %self.name,
                    path = ?self.log_path,
                    "Run log file write failed, further failures are not reported: {}",
                    e
                );
            }
        }
    }

    fn line(&self, level: LogLevel, kind: LineKind, message: &str) {
        let rendered = kind.render(message);
        match level {
            LogLevel::Trace => tracing::trace!(run = %self.name, "{}", rendered),
            LogLevel::Debug => tracing::debug!(run = %self.name, "{}", rendered),
            LogLevel::Info => tracing::info!(run = %self.name, "{}", rendered),
            LogLevel::Warn => tracing::warn!(run = %self.name, "{}", rendered),
            LogLevel::Error => tracing::error!(run = %self.name, "{}", rendered),
        }
        if level >= self.config.level {
            let stamped = self.stamp(&rendered);
            let mut sinks = self.sinks.lock();
            let result = sinks.emit(&stamped);
            self.check_write(&mut sinks, result);
        }
    }

    fn stamp(&self, line: &str) -> String {
        if self.config.show_timestamps {
            format!("[{}] {}", Local::now().format("%H:%M:%S"), line)
        } else {
            line.to_string()
        }
    }
}

impl Drop for RunLog {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RunLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLog")
            .field("name", &self.name)
            .field("log_path", &self.log_path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Procedure names become file stems; path separators and shell-hostile
/// characters are replaced.
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ' ' => '_',
            _ => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn captured(config: LogConfig) -> (RunLog, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let log = RunLog::new("run", config);
        log.set_callback(Box::new(move |line| sink.lock().push(line.to_string())));
        (log, seen)
    }

    fn plain() -> LogConfig {
        LogConfig {
            show_timestamps: false,
            ..LogConfig::default()
        }
    }

    #[test]
    fn writes_phases_and_passes_to_file() {
        let dir = tempdir().unwrap();
        let log = RunLog::with_file("train_diag_ubm", dir.path(), LogConfig::default()).unwrap();
        let path = log.log_path().unwrap().to_path_buf();
        assert!(path.ends_with("train_diag_ubm.log"));

        log.phase("Diagonal UBM training");
        log.pass(0, 4);
        log.flush();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("== Diagonal UBM training =="));
        assert!(content.contains("-- pass 1/4 --"));
    }

    #[test]
    fn lines_below_level_skip_the_sinks() {
        let (log, seen) = captured(plain());
        log.info("kept");
        log.debug("dropped");
        log.warn("careful");
        assert_eq!(seen.lock().as_slice(), &["kept", "[warn] careful"]);
    }

    #[test]
    fn compact_progress_is_thinned() {
        let log = RunLog::new("run", LogConfig::default());
        assert!(!log.progress(5));
        assert!(!log.progress(15));
        assert!(log.progress(20));
        assert!(!log.progress(25));
        assert!(log.progress(40));
        assert!(log.progress(100));
    }

    #[test]
    fn tail_keeps_the_latest_lines() {
        let config = LogConfig {
            error_tail: 5,
            ..LogConfig::default()
        };
        let log = RunLog::new("run", config);

        let lines: Vec<String> = (0..10).map(|i| format!("LOG {}", i)).collect();
        log.stage_output("gmm-est", &lines[..3]);
        log.stage_output("gmm-est", &lines[3..]);

        let tail = log.get_tail();
        assert_eq!(tail.len(), 5);
        assert_eq!(tail[0], "gmm-est: LOG 5");
        assert_eq!(tail[4], "gmm-est: LOG 9");

        log.clear_tail();
        assert!(log.get_tail().is_empty());
    }

    #[test]
    fn tail_is_shown_even_above_level() {
        let config = LogConfig {
            level: LogLevel::Error,
            ..plain()
        };
        let (log, seen) = captured(config);
        log.stage_output("fgmm-global-est", &["ERROR: no stats".to_string()]);
        assert!(seen.lock().is_empty());

        log.show_tail("Stage diagnostics");
        assert_eq!(
            seen.lock().as_slice(),
            &["Stage diagnostics (last 1 lines)", "  | fgmm-global-est: ERROR: no stats"]
        );
    }

    #[test]
    fn command_json_only_when_enabled() {
        let config = LogConfig {
            level: LogLevel::Debug,
            show_commands_json: true,
            ..plain()
        };
        let (log, seen) = captured(config);
        log.command_json("gmm-gselect", &["--n=30".to_string(), "ark:-".to_string()]);
        assert_eq!(seen.lock().as_slice(), &[r#"["gmm-gselect","--n=30","ark:-"]"#]);

        let (quiet, seen) = captured(LogConfig {
            level: LogLevel::Debug,
            ..plain()
        });
        quiet.command_json("gmm-gselect", &[]);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn failed_file_writes_are_noted_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("readonly.log");
        fs::write(&path, "").unwrap();

        let (log, seen) = captured(plain());
        // A read-only handle with no buffer: every write hits the fd and fails.
        log.sinks.lock().file = Some(BufWriter::with_capacity(0, File::open(&path).unwrap()));

        log.info("first");
        log.info("second");
        log.flush();

        assert!(log.sinks.lock().write_failed);
        assert!(!log.sinks.lock().note_failure());
        assert_eq!(seen.lock().as_slice(), &["first", "second"]);
    }

    #[test]
    fn only_the_first_failure_is_reported() {
        let mut sinks = Sinks::default();
        assert!(sinks.note_failure());
        assert!(!sinks.note_failure());
    }

    #[test]
    fn file_stems_are_safe() {
        assert_eq!(file_stem("train_mono"), "train_mono");
        assert_eq!(file_stem("plda/score"), "plda_score");
        assert_eq!(file_stem("a<b> c"), "a_b__c");
    }
}
