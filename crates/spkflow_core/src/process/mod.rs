//! External program invocations.
//!
//! A [`StageSpec`] describes one program call: the argument vector and
//! where standard input and output are bound. A [`LaunchedStage`] is the
//! running process; its diagnostic stream always goes to a scoped temp file
//! ([`DiagnosticsCapture`]) and is only read back, tail first, when the
//! stage fails or debug logging asks for it.
//!
//! Chaining stages together is the job of
//! [`Pipeline`](crate::orchestrator::Pipeline).

mod launch;
mod stage;

pub use launch::{DiagnosticsCapture, ExitOutcome, LaunchedStage, StageEndpoints, StageFailure};
pub use stage::{StageInput, StageOutput, StageSpec};

use std::path::{Path, PathBuf};

/// Resolve a program name against an optional toolkit directory.
///
/// Names containing a path separator are used as given; bare names are
/// looked up in `bin_dir` when one is configured and on `PATH` otherwise.
pub fn resolve_program(bin_dir: Option<&Path>, program: &str) -> PathBuf {
    let as_path = Path::new(program);
    if as_path.components().count() > 1 {
        return as_path.to_path_buf();
    }
    match bin_dir {
        Some(dir) => dir.join(program),
        None => as_path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_names_use_bin_dir() {
        let dir = Path::new("/opt/kaldi/bin");
        assert_eq!(
            resolve_program(Some(dir), "gmm-gselect"),
            PathBuf::from("/opt/kaldi/bin/gmm-gselect")
        );
        assert_eq!(resolve_program(None, "gmm-gselect"), PathBuf::from("gmm-gselect"));
    }

    #[test]
    fn explicit_paths_are_kept() {
        let dir = Path::new("/opt/kaldi/bin");
        assert_eq!(
            resolve_program(Some(dir), "/usr/bin/cat"),
            PathBuf::from("/usr/bin/cat")
        );
        assert_eq!(
            resolve_program(Some(dir), "./local-tool"),
            PathBuf::from("./local-tool")
        );
    }
}
