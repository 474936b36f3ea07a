//! Scoped temporary files and directories.
//!
//! Every procedure call owns one [`TempScope`]: a uniquely named directory
//! that is removed, with everything still inside it, when the scope is
//! dropped. Individual files are [`TempArtifact`]s; dropping one deletes
//! the file immediately, which is how superseded models are released.
//! Artifacts that outlive the call are either kept explicitly with
//! [`TempArtifact::keep`] or acquired persistent from the start.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::{Builder, TempDir, TempPath};
use thiserror::Error;

/// Failure to create, persist, or remove a temporary resource.
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Failed to create temporary {what} in {}: {source}", root.display())]
    Create {
        what: &'static str,
        root: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to persist {} to {}: {source}", from.display(), to.display())]
    Persist {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to remove temporary {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on temporary {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ResourceError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result type for temp resource operations.
pub type ResourceResult<T> = Result<T, ResourceError>;

/// A per-call temporary directory, removed on drop.
#[derive(Debug)]
pub struct TempScope {
    dir: TempDir,
    root: PathBuf,
    label: String,
}

impl TempScope {
    /// Create a scope under the system temp directory.
    pub fn new(label: &str) -> ResourceResult<Self> {
        Self::new_in(&std::env::temp_dir(), label)
    }

    /// Create a scope under `root`, creating `root` if needed.
    pub fn new_in(root: &Path, label: &str) -> ResourceResult<Self> {
        let create_err = |source| ResourceError::Create {
            what: "directory",
            root: root.to_path_buf(),
            source,
        };
        fs::create_dir_all(root).map_err(create_err)?;

        let label = sanitize_label(label);
        let dir = Builder::new()
            .prefix(&format!("spkflow-{}-", label))
            .tempdir_in(root)
            .map_err(create_err)?;

        tracing::trace!("Created temp scope {}", dir.path().display());
        Ok(Self {
            dir,
            root: root.to_path_buf(),
            label,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// The directory the scope itself lives in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Acquire a uniquely named file inside the scope.
    ///
    /// The file exists (empty) on return and is deleted when the artifact
    /// is dropped, or with the scope at the latest.
    pub fn acquire(&self, suffix: &str) -> ResourceResult<TempArtifact> {
        let path = Builder::new()
            .prefix(&format!("{}-", self.label))
            .suffix(suffix)
            .tempfile_in(self.dir.path())
            .map_err(|source| ResourceError::Create {
                what: "file",
                root: self.dir.path().to_path_buf(),
                source,
            })?
            .into_temp_path();
        Ok(TempArtifact { path })
    }

    /// Acquire a uniquely named file that survives the scope.
    ///
    /// The file is created beside the scope directory rather than inside it
    /// and ownership passes to the caller.
    pub fn acquire_persistent(&self, suffix: &str) -> ResourceResult<PathBuf> {
        let (_file, path) = Builder::new()
            .prefix(&format!("spkflow-{}-", self.label))
            .suffix(suffix)
            .tempfile_in(&self.root)
            .map_err(|source| ResourceError::Create {
                what: "file",
                root: self.root.clone(),
                source,
            })?
            .keep()
            .map_err(|e| ResourceError::Persist {
                from: e.file.path().to_path_buf(),
                to: e.file.path().to_path_buf(),
                source: e.error,
            })?;
        Ok(path)
    }

    /// Remove the scope now, reporting failures instead of ignoring them.
    pub fn close(self) -> ResourceResult<()> {
        let path = self.dir.path().to_path_buf();
        self.dir
            .close()
            .map_err(|source| ResourceError::Remove { path, source })
    }
}

/// A single temporary file with single-owner lifetime.
#[derive(Debug)]
pub struct TempArtifact {
    path: TempPath,
}

impl TempArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_bytes(&self, data: &[u8]) -> ResourceResult<()> {
        fs::write(&self.path, data).map_err(|e| ResourceError::io(&self.path, e))
    }

    pub fn write_text(&self, text: &str) -> ResourceResult<()> {
        self.write_bytes(text.as_bytes())
    }

    pub fn read_text(&self) -> ResourceResult<String> {
        fs::read_to_string(&self.path).map_err(|e| ResourceError::io(&self.path, e))
    }

    pub fn len(&self) -> ResourceResult<u64> {
        fs::metadata(&self.path)
            .map(|m| m.len())
            .map_err(|e| ResourceError::io(&self.path, e))
    }

    pub fn is_empty(&self) -> ResourceResult<bool> {
        self.len().map(|n| n == 0)
    }

    /// Stop managing the file and hand its path to the caller.
    pub fn keep(self) -> ResourceResult<PathBuf> {
        self.path.keep().map_err(|e| ResourceError::Persist {
            from: e.path.to_path_buf(),
            to: e.path.to_path_buf(),
            source: e.error,
        })
    }

    /// Move the file to `dest`, falling back to a copy across filesystems.
    pub fn persist_to(self, dest: &Path) -> ResourceResult<()> {
        match self.path.persist(dest) {
            Ok(()) => Ok(()),
            Err(e) => {
                let from = e.path.to_path_buf();
                fs::copy(&from, dest).map_err(|source| ResourceError::Persist {
                    from: from.clone(),
                    to: dest.to_path_buf(),
                    source,
                })?;
                e.path.close().map_err(|source| ResourceError::Remove { path: from, source })
            }
        }
    }

    /// Delete the file now, reporting failures.
    pub fn release(self) -> ResourceResult<()> {
        let path = self.path.to_path_buf();
        self.path
            .close()
            .map_err(|source| ResourceError::Remove { path, source })
    }
}

impl AsRef<Path> for TempArtifact {
    fn as_ref(&self) -> &Path {
        self.path()
    }
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "run".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entries(dir: &Path) -> Vec<PathBuf> {
        let mut v: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        v.sort();
        v
    }

    #[test]
    fn scope_is_removed_on_drop() {
        let root = tempdir().unwrap();
        let scope = TempScope::new_in(root.path(), "ubm").unwrap();
        let artifact = scope.acquire(".acc").unwrap();
        artifact.write_text("stats").unwrap();
        let scope_path = scope.path().to_path_buf();
        std::mem::forget(artifact);

        assert!(scope_path.exists());
        drop(scope);
        assert!(!scope_path.exists());
        assert!(entries(root.path()).is_empty());
    }

    #[test]
    fn artifact_is_removed_on_drop() {
        let root = tempdir().unwrap();
        let scope = TempScope::new_in(root.path(), "ubm").unwrap();
        let artifact = scope.acquire(".mdl").unwrap();
        let path = artifact.path().to_path_buf();
        assert!(path.exists());
        assert!(path.to_string_lossy().ends_with(".mdl"));

        drop(artifact);
        assert!(!path.exists());
    }

    #[test]
    fn acquisitions_never_collide() {
        let root = tempdir().unwrap();
        let scope = TempScope::new_in(root.path(), "x").unwrap();
        let a = scope.acquire(".tmp").unwrap();
        let b = scope.acquire(".tmp").unwrap();
        assert_ne!(a.path(), b.path());

        let other = TempScope::new_in(root.path(), "x").unwrap();
        assert_ne!(scope.path(), other.path());
    }

    #[test]
    fn kept_artifact_survives_scope() {
        let root = tempdir().unwrap();
        let scope = TempScope::new_in(root.path(), "train").unwrap();
        let artifact = scope.acquire(".mdl").unwrap();
        artifact.write_text("<DiagGMM>").unwrap();

        let dest = root.path().join("final.mdl");
        artifact.persist_to(&dest).unwrap();
        drop(scope);

        assert_eq!(fs::read_to_string(&dest).unwrap(), "<DiagGMM>");
        assert_eq!(entries(root.path()), vec![dest]);
    }

    #[test]
    fn persistent_acquisition_lives_beside_scope() {
        let root = tempdir().unwrap();
        let scope = TempScope::new_in(root.path(), "train").unwrap();
        let path = scope.acquire_persistent(".mdl").unwrap();
        assert_eq!(path.parent(), Some(root.path()));

        scope.close().unwrap();
        assert!(path.exists());
        assert_eq!(entries(root.path()), vec![path]);
    }

    #[test]
    fn release_reports_success() {
        let scope = TempScope::new("release").unwrap();
        let artifact = scope.acquire(".txt").unwrap();
        let path = artifact.path().to_path_buf();
        artifact.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn label_is_sanitized() {
        assert_eq!(sanitize_label("plda/score"), "plda_score");
        assert_eq!(sanitize_label(""), "run");
    }
}
