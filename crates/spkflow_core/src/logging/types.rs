//! Log levels, run-log configuration and line kinds.

use serde::{Deserialize, Serialize};

/// Severity of a run-log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    /// Command lines and stage diagnostics of successful stages.
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive understood by `EnvFilter`.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Configuration for a [`RunLog`](super::RunLog).
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Lines below this level reach `tracing` only.
    pub level: LogLevel,
    /// Keep stage diagnostics in the tail buffer without echoing them, and
    /// thin out progress lines to `progress_step` increments.
    pub compact: bool,
    pub progress_step: u32,
    /// Diagnostic lines kept for failure reports.
    pub error_tail: usize,
    pub show_timestamps: bool,
    /// Also log every stage's argument vector as JSON.
    pub show_commands_json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            compact: true,
            progress_step: 20,
            error_tail: 20,
            show_timestamps: true,
            show_commands_json: false,
        }
    }
}

impl LogConfig {
    /// Everything a run produces: every stage's diagnostics and argv.
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            compact: false,
            progress_step: 10,
            error_tail: 50,
            show_commands_json: true,
            ..Self::default()
        }
    }
}

/// Callback receiving every rendered log line.
pub type LogCallback = Box<dyn Fn(&str) + Send + Sync>;

/// How a run-log line is decorated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Plain,
    /// `+ program args…`
    Command,
    /// `== Diagonal UBM training ==`
    Phase,
    /// `-- pass 2/4 --`
    Pass,
    Success,
    Warning,
    Error,
    /// `  | gmm-est: line`
    Diagnostic,
}

impl LineKind {
    pub fn render(self, message: &str) -> String {
        match self {
            LineKind::Plain => message.to_string(),
            LineKind::Command => format!("+ {}", message),
            LineKind::Phase => format!("== {} ==", message),
            LineKind::Pass => format!("-- {} --", message),
            LineKind::Success => format!("[ok] {}", message),
            LineKind::Warning => format!("[warn] {}", message),
            LineKind::Error => format!("[error] {}", message),
            LineKind::Diagnostic => format!("  | {}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_kinds_render() {
        assert_eq!(LineKind::Pass.render("pass 2/4"), "-- pass 2/4 --");
        assert_eq!(LineKind::Command.render("gmm-est a b c"), "+ gmm-est a b c");
        assert_eq!(LineKind::Diagnostic.render("gmm-est: LOG"), "  | gmm-est: LOG");
    }

    #[test]
    fn levels_order_by_severity() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Error > LogLevel::Warn);
        assert_eq!(LogLevel::Warn.as_filter(), "warn");
    }

    #[test]
    fn verbose_shows_everything() {
        let config = LogConfig::verbose();
        assert_eq!(config.level, LogLevel::Debug);
        assert!(!config.compact);
        assert!(config.show_commands_json);
        assert!(config.show_timestamps);
    }
}
