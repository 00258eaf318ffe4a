use serde::{Deserialize, Serialize};

use crate::accelerator;
use crate::platform::Platform;

pub const CONFIG_FILE: &str = "kiln.toml";

/// Packages served from the PyTorch wheel index rather than PyPI.
const TORCH_FAMILY: &[&str] = &["torch", "torchvision", "torchaudio"];

/// kiln.toml configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KilnConfig {
    /// Image name used for tagging, e.g. the weights image
    pub image: Option<String>,
    #[serde(default)]
    pub build: BuildConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Build for an NVIDIA GPU
    #[serde(default)]
    pub gpu: bool,
    /// CUDA version, inferred from the torch pin when omitted
    #[serde(default)]
    pub cuda: Option<String>,
    /// cuDNN major version
    #[serde(default)]
    pub cudnn: Option<String>,
    /// Python version
    #[serde(default = "default_python_version")]
    pub python_version: String,
    /// pip requirement specifiers
    #[serde(default)]
    pub python_packages: Vec<String>,
    /// Additional system packages to install via apt-get
    #[serde(default)]
    pub system_packages: Vec<String>,
    /// Commands run after dependencies are installed, in order
    #[serde(default)]
    pub run: Vec<RunItem>,
    /// Deprecated alias for `run`, appended after it
    #[serde(default)]
    pub pre_install: Vec<String>,
}

/// A single `run` entry. Written either as a plain string or as a table
/// with `command` and `mounts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawRunItem")]
pub struct RunItem {
    pub command: String,
    pub mounts: Vec<RunMount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMount {
    #[serde(rename = "type")]
    pub mount_type: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub target: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRunItem {
    Command(String),
    Full {
        command: String,
        #[serde(default)]
        mounts: Vec<RunMount>,
    },
}

impl From<RawRunItem> for RunItem {
    fn from(raw: RawRunItem) -> Self {
        match raw {
            RawRunItem::Command(command) => Self::new(command),
            RawRunItem::Full { command, mounts } => Self { command, mounts },
        }
    }
}

impl RunItem {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            mounts: Vec::new(),
        }
    }
}

impl RunMount {
    pub fn secret(id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            mount_type: "secret".to_owned(),
            id: id.into(),
            target: target.into(),
        }
    }

    pub fn is_secret(&self) -> bool {
        self.mount_type == "secret"
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            gpu: false,
            cuda: None,
            cudnn: None,
            python_version: default_python_version(),
            python_packages: Vec::new(),
            system_packages: Vec::new(),
            run: Vec::new(),
            pre_install: Vec::new(),
        }
    }
}

impl KilnConfig {
    /// Load from kiln.toml at the given path, or return defaults if not found.
    pub fn load(project_dir: &std::path::Path) -> crate::Result<Self> {
        let config_path = project_dir.join(CONFIG_FILE);
        if config_path.exists() {
            let content =
                std::fs::read_to_string(&config_path).map_err(|e| crate::Error::ConfigLoad {
                    path: config_path.clone(),
                    source: e,
                })?;
            toml::from_str(&content).map_err(|e| crate::Error::ConfigParse {
                path: config_path,
                source: e,
            })
        } else {
            Ok(Self::default())
        }
    }

    /// Pinned torch version, if `python_packages` has `torch==X`.
    pub fn torch_version(&self) -> Option<String> {
        pinned_version(&self.build.python_packages, "torch")
    }

    /// Pinned torchvision version, if `python_packages` has `torchvision==X`.
    pub fn torchvision_version(&self) -> Option<String> {
        pinned_version(&self.build.python_packages, "torchvision")
    }

    /// CUDA version from config, falling back to the newest one the
    /// pinned torch supports.
    pub fn resolved_cuda(&self) -> Option<String> {
        if let Some(cuda) = &self.build.cuda {
            return Some(cuda.clone());
        }
        let torch = self.torch_version()?;
        let cuda = accelerator::latest_cuda_for_torch(&torch)?;
        tracing::debug!(torch = %torch, cuda, "inferred CUDA version from torch pin");
        Some(cuda.to_owned())
    }

    /// NVIDIA base image tag for GPU builds.
    pub fn cuda_base_image_tag(&self) -> crate::Result<String> {
        let cuda = self
            .resolved_cuda()
            .ok_or_else(|| crate::Error::CudaVersionUnresolved {
                torch: self.torch_version(),
            })?;
        let cudnn = self
            .build
            .cudnn
            .as_deref()
            .unwrap_or(accelerator::DEFAULT_CUDNN);
        Ok(format!("nvidia/cuda:{cuda}-cudnn{cudnn}-devel-ubuntu22.04"))
    }

    /// requirements.txt contents for `platform`, minus any specifier in
    /// `exclude`. Empty when nothing is left to install.
    pub fn python_requirements_for_platform(
        &self,
        platform: &Platform,
        exclude: &[String],
    ) -> String {
        let exclude: Vec<String> = exclude.iter().map(|e| normalize_specifier(e)).collect();
        let packages: Vec<&str> = self
            .build
            .python_packages
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .filter(|p| !exclude.contains(&normalize_specifier(p)))
            .collect();

        if packages.is_empty() {
            return String::new();
        }

        let mut lines = Vec::with_capacity(packages.len() + 1);
        let needs_torch_index = packages
            .iter()
            .any(|p| TORCH_FAMILY.contains(&package_name(p).as_str()));
        if needs_torch_index && platform.is_linux() {
            let index = if self.build.gpu {
                self.resolved_cuda()
                    .map(|cuda| accelerator::torch_index_suffix(&cuda))
            } else {
                Some("cpu".to_owned())
            };
            if let Some(index) = index {
                lines.push(format!(
                    "--extra-index-url https://download.pytorch.org/whl/{index}"
                ));
            }
        }
        lines.extend(packages.into_iter().map(str::to_owned));
        lines.join("\n")
    }
}

fn pinned_version(packages: &[String], name: &str) -> Option<String> {
    packages.iter().find_map(|p| {
        let (pkg, version) = p.split_once("==")?;
        (package_name(pkg) == name).then(|| version.trim().to_owned())
    })
}

/// Lowercased distribution name of a requirement specifier.
fn package_name(specifier: &str) -> String {
    specifier
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn normalize_specifier(specifier: &str) -> String {
    specifier.split_whitespace().collect()
}

fn default_python_version() -> String {
    "3.11".to_owned()
}
