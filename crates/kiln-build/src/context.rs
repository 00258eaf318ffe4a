//! Build-context `.dockerignore` handling for callers that send the
//! context to a builder themselves.
//!
//! The `kiln` CLI only prints the generated files. A caller that runs the
//! build installs [`SeparateWeights::dockerignore`] with
//! [`install_dockerignore`] before sending the context, and calls
//! [`DockerignoreGuard::restore`] afterwards.
//!
//! [`SeparateWeights::dockerignore`]: crate::SeparateWeights::dockerignore

use std::path::{Path, PathBuf};

pub const DOCKERIGNORE: &str = ".dockerignore";
pub const DOCKERIGNORE_BACKUP: &str = ".dockerignore.kiln.bak";

/// A generated `.dockerignore` in place of the project's own.
///
/// Call [`DockerignoreGuard::restore`] once the build context has been
/// sent to put the original file back.
#[derive(Debug)]
#[must_use = "the project's .dockerignore stays replaced until restore() is called"]
pub struct DockerignoreGuard {
    dir: PathBuf,
    backed_up: bool,
}

/// Writes `contents` as `.dockerignore` in `project_dir`, moving any
/// existing one to `.dockerignore.kiln.bak`.
pub fn install_dockerignore(
    project_dir: &Path,
    contents: &str,
) -> Result<DockerignoreGuard, ContextError> {
    let path = project_dir.join(DOCKERIGNORE);
    let backup = project_dir.join(DOCKERIGNORE_BACKUP);

    if backup.exists() {
        return Err(ContextError::StaleBackup(backup));
    }

    let backed_up = path.exists();
    if backed_up {
        std::fs::rename(&path, &backup).map_err(|e| ContextError::Backup {
            path: path.clone(),
            source: e,
        })?;
    }

    std::fs::write(&path, contents).map_err(|e| ContextError::Write {
        path: path.clone(),
        source: e,
    })?;

    tracing::debug!(path = %path.display(), backed_up, "installed generated .dockerignore");
    Ok(DockerignoreGuard {
        dir: project_dir.to_path_buf(),
        backed_up,
    })
}

impl DockerignoreGuard {
    /// Removes the generated file and restores the original, if any.
    pub fn restore(self) -> Result<(), ContextError> {
        let path = self.dir.join(DOCKERIGNORE);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ContextError::Remove { path, source: e }),
        }

        if self.backed_up {
            let backup = self.dir.join(DOCKERIGNORE_BACKUP);
            std::fs::rename(&backup, &path).map_err(|e| ContextError::Restore {
                path: backup,
                source: e,
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("{0} already exists; a previous build did not finish, restore it by hand")]
    StaleBackup(PathBuf),
    #[error("failed to back up {path}")]
    Backup {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to remove generated {path}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to restore {path}")]
    Restore {
        path: PathBuf,
        source: std::io::Error,
    },
}
