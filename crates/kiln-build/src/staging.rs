//! Per-run scratch directory for files the Dockerfile copies in.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};
use crate::instruction::Instruction;

/// Scratch root, relative to the project directory.
pub const SCRATCH_ROOT: &str = ".kiln/tmp";

/// A uniquely named directory under `<project>/.kiln/tmp`, e.g.
/// `.kiln/tmp/build20240620123456.123456Ab3xYz`.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    relative: PathBuf,
}

/// A file written into the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Staged {
    /// `COPY <scratch>/<file> /tmp/<file>`
    pub copy: Instruction,
    /// Where the file ends up inside the image.
    pub container_path: String,
}

impl ScratchDir {
    /// Creates a fresh scratch directory under `project_dir`.
    pub fn create(project_dir: &Path) -> Result<Self> {
        let root = project_dir.join(SCRATCH_ROOT);
        std::fs::create_dir_all(&root).map_err(|e| BuildError::ScratchCreate {
            path: root.clone(),
            source: e,
        })?;

        let prefix = format!("build{}", chrono::Local::now().format("%Y%m%d%H%M%S%.6f"));
        let path = tempfile::Builder::new()
            .prefix(&prefix)
            .rand_bytes(6)
            .tempdir_in(&root)
            .map_err(|e| BuildError::ScratchCreate {
                path: root.clone(),
                source: e,
            })?
            .keep();

        let relative = path
            .strip_prefix(project_dir)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.clone());

        tracing::debug!(path = %path.display(), "created build scratch directory");
        Ok(Self { path, relative })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scratch path relative to the project directory, as used in `COPY`.
    pub fn relative(&self) -> &Path {
        &self.relative
    }

    /// Writes `contents` to `<scratch>/<filename>` and returns the
    /// instruction that copies it to `/tmp/<filename>`.
    ///
    /// The file is written to a temporary sibling and renamed into place,
    /// so it is either complete or absent.
    pub fn stage(&self, filename: &str, contents: &[u8]) -> Result<Staged> {
        let write_err = |e: std::io::Error| BuildError::StagingWrite {
            filename: filename.to_owned(),
            source: e,
        };

        let target = self.path.join(filename);
        let parent = target.parent().unwrap_or(&self.path);
        std::fs::create_dir_all(parent).map_err(write_err)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(write_err)?;
        tmp.write_all(contents).map_err(write_err)?;
        tmp.persist(&target).map_err(|e| write_err(e.error))?;

        tracing::debug!(path = %target.display(), bytes = contents.len(), "staged build file");

        let container_path = format!("/tmp/{filename}");
        Ok(Staged {
            copy: Instruction::copy(
                slash_path(&self.relative.join(filename)),
                container_path.clone(),
            ),
            container_path,
        })
    }

    /// Removes the scratch directory. Calling it again is a no-op.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "removed build scratch directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BuildError::Cleanup {
                path: self.path.clone(),
                source: e,
            }),
        }
    }
}

/// Path with `/` separators, as Dockerfiles expect.
fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
