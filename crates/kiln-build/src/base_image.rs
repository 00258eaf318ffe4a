//! Base image resolution.
//!
//! Three mutually exclusive strategies decide where the main stage starts:
//!
//! - [`BaseStrategy::EngineBase`]: a prebuilt kiln base image that already
//!   ships CUDA, Python and torch; only valid for supported combinations.
//! - [`BaseStrategy::AcceleratorBase`]: the NVIDIA CUDA image, with Python
//!   built from source on top.
//! - [`BaseStrategy::Plain`]: `python:<version>-slim`.

use kiln_core::{KilnConfig, accelerator, strip_patch_version};

use crate::error::{BuildError, Result};

/// Repository the engine base images are published under.
pub const ENGINE_BASE_REPOSITORY: &str = "ghcr.io/kiln-build/kiln-base";

/// Python versions engine base images are built for.
const ENGINE_PYTHON_VERSIONS: &[&str] = &["3.8", "3.9", "3.10", "3.11", "3.12"];

/// Torch releases engine base images are built for, with the newest
/// Python each supports.
const ENGINE_TORCH_VERSIONS: &[(&str, &str)] = &[
    ("1.13", "3.11"),
    ("2.0", "3.11"),
    ("2.1", "3.11"),
    ("2.2", "3.12"),
    ("2.3", "3.12"),
];

/// CUDA versions engine base images are built for.
const ENGINE_CUDA_VERSIONS: &[&str] = &["11.6", "11.7", "11.8", "12.1"];

/// apt packages already installed in every engine base image.
pub const ENGINE_BASE_SYSTEM_PACKAGES: &[&str] = &[
    "build-essential",
    "cmake",
    "curl",
    "ffmpeg",
    "g++",
    "gcc",
    "git",
    "libffi-dev",
    "libgl1-mesa-glx",
    "libglib2.0-0",
    "libssl-dev",
    "wget",
    "zip",
    "unzip",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseStrategy {
    EngineBase,
    AcceleratorBase,
    Plain,
}

impl BaseStrategy {
    /// Picks the strategy; the engine base image takes precedence.
    pub fn select(config: &KilnConfig, use_cuda_base_image: bool, use_engine_base_image: bool) -> Self {
        if use_engine_base_image {
            Self::EngineBase
        } else if config.build.gpu && use_cuda_base_image {
            Self::AcceleratorBase
        } else {
            Self::Plain
        }
    }
}

/// A validated engine base image combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineBaseImage {
    pub cuda: Option<String>,
    pub python: String,
    pub torch: Option<String>,
}

impl EngineBaseImage {
    /// Validates a combination of `major.minor` versions.
    pub fn new(cuda: Option<&str>, python: &str, torch: Option<&str>) -> Result<Self> {
        if !is_supported(cuda, python, torch) {
            return Err(BuildError::NoMatchingBaseImage {
                cuda: cuda.map(str::to_owned),
                python: python.to_owned(),
                torch: torch.map(str::to_owned),
            });
        }
        Ok(Self {
            cuda: cuda.map(str::to_owned),
            python: python.to_owned(),
            torch: torch.map(str::to_owned),
        })
    }

    /// Image reference, e.g. `ghcr.io/kiln-build/kiln-base:cuda11.8-python3.10-torch2.0`.
    pub fn name(&self) -> String {
        let mut tag = Vec::with_capacity(3);
        if let Some(cuda) = &self.cuda {
            tag.push(format!("cuda{cuda}"));
        }
        tag.push(format!("python{}", self.python));
        if let Some(torch) = &self.torch {
            tag.push(format!("torch{torch}"));
        }
        format!("{ENGINE_BASE_REPOSITORY}:{}", tag.join("-"))
    }
}

fn is_supported(cuda: Option<&str>, python: &str, torch: Option<&str>) -> bool {
    if !ENGINE_PYTHON_VERSIONS.contains(&python) {
        return false;
    }
    if let Some(cuda) = cuda {
        if !ENGINE_CUDA_VERSIONS.contains(&cuda) {
            return false;
        }
    }
    let Some(torch) = torch else {
        return true;
    };
    let Some((_, max_python)) = ENGINE_TORCH_VERSIONS.iter().find(|(t, _)| *t == torch) else {
        return false;
    };
    if minor_of(python) > minor_of(max_python) {
        return false;
    }
    match cuda {
        Some(cuda) => accelerator::compatible_cuda_versions(torch).contains(&cuda),
        None => true,
    }
}

fn minor_of(version: &str) -> u32 {
    version
        .split_once('.')
        .and_then(|(_, minor)| minor.parse().ok())
        .unwrap_or(0)
}

/// Normalizes `version` to `major.minor`, warning when a patch is dropped.
fn normalized(what: &str, version: &str) -> Result<String> {
    let (stripped, changed) = strip_patch_version(version)?;
    if changed {
        tracing::warn!("Stripping patch version from {what} version {version} to {stripped}");
    }
    Ok(stripped)
}

/// Resolves the base image for `strategy`.
pub fn resolve(config: &KilnConfig, strategy: BaseStrategy) -> Result<String> {
    match strategy {
        BaseStrategy::EngineBase => {
            let python = normalized("Python", &config.build.python_version)?;
            let torch = normalized("torch", &config.torch_version().unwrap_or_default())?;
            let cuda = if config.build.gpu {
                config.resolved_cuda()
            } else {
                None
            };
            let image = EngineBaseImage::new(
                cuda.as_deref(),
                &python,
                Some(torch.as_str()).filter(|t| !t.is_empty()),
            )?;
            Ok(image.name())
        }
        BaseStrategy::AcceleratorBase => Ok(config.cuda_base_image_tag()?),
        BaseStrategy::Plain => Ok(format!("python:{}-slim", config.build.python_version)),
    }
}
