//! Model weights discovery, the weights-only build stage, and the
//! weights manifest.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::instruction::{self, Instruction};

/// Files smaller than this are never treated as weights.
pub const SIZE_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Where weights live inside the image.
pub const CONTAINER_ROOT: &str = "/src";

const CODE_EXTENSIONS: &[&str] = &["py", "ipynb", "whl"];
const NON_MODEL_EXTENSIONS: &[&str] = &["txt", "md", "toml", "yaml", "yml", "json", "lock"];

/// Directories the disk walker never descends into.
const SKIPPED_DIRS: &[&str] = &[".git", ".kiln"];

pub const DOCKERIGNORE_HEADER: &str = "# generated by kiln
__pycache__
*.pyc
*.pyo
*.pyd
.Python
env
pip-log.txt
pip-delete-this-directory.txt
.tox
.coverage
.coverage.*
.cache
nosetests.xml
coverage.xml
*.cover
*.log
.git
.mypy_cache
.pytest_cache
.hypothesis
";

#[derive(Debug, thiserror::Error)]
pub enum WeightsError {
    #[error("failed to walk {path}")]
    Walk {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to hash {path}")]
    Hash {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read weights manifest at {path}")]
    ManifestRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse weights manifest at {path}")]
    ManifestParse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write weights manifest at {path}")]
    ManifestWrite {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// What the walker knows about a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub is_dir: bool,
    pub size: u64,
}

pub type Visit<'a> =
    dyn FnMut(&Path, Result<FileInfo, WeightsError>) -> Result<(), WeightsError> + 'a;

/// Walks a tree of project-relative paths.
///
/// Production code uses [`DiskWalker`]; tests supply an in-memory tree.
pub trait FileWalker {
    /// Calls `visit` for `root` and everything below it. An error returned
    /// by `visit` stops the walk and is returned unchanged.
    fn walk(&self, root: &Path, visit: &mut Visit<'_>) -> Result<(), WeightsError>;
}

/// Walks the real filesystem below `base`, in file-name order, yielding
/// paths relative to `base`.
#[derive(Debug, Clone)]
pub struct DiskWalker {
    base: PathBuf,
}

impl DiskWalker {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl FileWalker for DiskWalker {
    fn walk(&self, root: &Path, visit: &mut Visit<'_>) -> Result<(), WeightsError> {
        let walker = WalkDir::new(self.base.join(root))
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0 || !SKIPPED_DIRS.iter().any(|s| e.file_name() == *s)
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e
                        .path()
                        .map(|p| self.relative(p))
                        .unwrap_or_else(|| root.to_path_buf());
                    let source = std::io::Error::from(e);
                    visit(&path.clone(), Err(WeightsError::Walk { path, source }))?;
                    continue;
                }
            };

            let path = self.relative(entry.path());
            let info = entry
                .metadata()
                .map(|m| FileInfo {
                    is_dir: m.is_dir(),
                    size: m.len(),
                })
                .map_err(|e| WeightsError::Walk {
                    path: path.clone(),
                    source: e.into(),
                });
            visit(&path, info)?;
        }
        Ok(())
    }
}

impl DiskWalker {
    fn relative(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.base) {
            Ok(rel) if rel.as_os_str().is_empty() => PathBuf::from("."),
            Ok(rel) => rel.to_path_buf(),
            Err(_) => path.to_path_buf(),
        }
    }
}

/// Finds weight directories and loose weight files under the project root.
///
/// Returns `(dirs, files)` as `/`-separated project-relative paths.
pub fn find_weights(walker: &dyn FileWalker) -> Result<(Vec<String>, Vec<String>), WeightsError> {
    let mut weight_files = Vec::new();
    let mut code_files = Vec::new();

    walker.walk(Path::new("."), &mut |path, info| {
        let info = info?;
        if info.is_dir {
            return Ok(());
        }
        let rel = slash_path(path);
        if has_extension(path, CODE_EXTENSIONS) {
            code_files.push(rel);
        } else if info.size >= SIZE_THRESHOLD && !has_extension(path, NON_MODEL_EXTENSIONS) {
            weight_files.push(rel);
        }
        Ok(())
    })?;

    // Shallowest first, so a parent directory is chosen before its children.
    weight_files.sort_by(|a, b| depth(a).cmp(&depth(b)).then_with(|| a.cmp(b)));

    let mut dirs: Vec<String> = Vec::new();
    let mut files = Vec::new();
    for file in weight_files {
        match file.rsplit_once('/') {
            None => files.push(file),
            Some((dir, _)) => {
                if !dirs.iter().any(|d| is_within(dir, d)) {
                    dirs.push(dir.to_owned());
                }
            }
        }
    }
    dirs.retain(|d| !code_files.iter().any(|c| is_within(c, d)));

    if !dirs.is_empty() || !files.is_empty() {
        tracing::info!(dirs = ?dirs, files = ?files, "found model weights");
    }
    Ok((dirs, files))
}

/// Output of [`split_weights`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightsSplit {
    pub dockerfile: String,
    pub dirs: Vec<String>,
    pub files: Vec<String>,
}

/// Finds weights and renders a `FROM scratch` Dockerfile holding only them.
pub fn split_weights(walker: &dyn FileWalker) -> Result<WeightsSplit, WeightsError> {
    let (dirs, files) = find_weights(walker)?;

    let mut plan = vec![Instruction::syntax(), Instruction::from_image("scratch")];
    plan.extend(
        dirs.iter()
            .chain(&files)
            .map(|p| Instruction::copy(p.clone(), container_path(p))),
    );

    Ok(WeightsSplit {
        dockerfile: instruction::render(&plan),
        dirs,
        files,
    })
}

/// `.dockerignore` contents that keep weights out of the main build context.
pub fn make_dockerignore(dirs: &[String], files: &[String]) -> String {
    let mut contents = String::from(DOCKERIGNORE_HEADER);
    for dir in dirs {
        contents.push_str(&format!("{dir}\n{dir}/**/*\n"));
    }
    for file in files {
        contents.push_str(&format!("{file}\n"));
    }
    contents
}

/// Location of a weights path inside the image.
pub fn container_path(path: &str) -> String {
    let path = path.trim_start_matches("./").trim_end_matches('/');
    format!("{CONTAINER_ROOT}/{path}")
}

/// Hashes every file below `dirs` plus every file in `files`.
pub fn build_manifest(
    walker: &dyn FileWalker,
    base: &Path,
    dirs: &[String],
    files: &[String],
) -> Result<WeightsManifest, WeightsError> {
    let mut manifest = WeightsManifest::new();

    for dir in dirs {
        walker.walk(Path::new(dir), &mut |path, info| {
            if info?.is_dir {
                return Ok(());
            }
            manifest.add_file(base, path)
        })?;
    }
    for file in files {
        manifest.add_file(base, Path::new(file))?;
    }

    Ok(manifest)
}

/// SHA-256 fingerprints of every weight file, keyed by project-relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightsManifest {
    pub files: BTreeMap<String, String>,
}

impl WeightsManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hashes `base/<path>` and records it under `path`. The file is
    /// streamed, never held in memory whole.
    pub fn add_file(&mut self, base: &Path, path: &Path) -> Result<(), WeightsError> {
        let full = base.join(path);
        let hash_err = |e: std::io::Error| WeightsError::Hash {
            path: full.clone(),
            source: e,
        };
        let mut file = std::fs::File::open(&full).map_err(hash_err)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher).map_err(hash_err)?;
        self.files
            .insert(slash_path(path), hex::encode(hasher.finalize()));
        Ok(())
    }

    /// True when both manifests record the same files with the same hashes.
    pub fn matches(&self, other: &Self) -> bool {
        self.files == other.files
    }

    pub fn load(path: &Path) -> Result<Self, WeightsError> {
        let content = std::fs::read_to_string(path).map_err(|e| WeightsError::ManifestRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| WeightsError::ManifestParse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), WeightsError> {
        let write_err = |e: std::io::Error| WeightsError::ManifestWrite {
            path: path.to_path_buf(),
            source: e,
        };
        let content = serde_json::to_string_pretty(self).map_err(|e| write_err(e.into()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        std::fs::write(path, content).map_err(write_err)
    }
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| e.eq_ignore_ascii_case(x)))
}

fn depth(path: &str) -> usize {
    path.matches('/').count()
}

/// True when `path` is `dir` or lies below it.
fn is_within(path: &str, dir: &str) -> bool {
    path == dir
        || path
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn slash_path(path: &Path) -> String {
    let joined = path
        .components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if joined.is_empty() {
        ".".to_owned()
    } else {
        joined
    }
}
