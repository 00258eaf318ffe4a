use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid version: {0}")]
    MalformedVersion(String),

    #[error(
        "cannot determine CUDA version{}; set `cuda` in kiln.toml",
        .torch.as_deref().map(|t| format!(" for torch {t}")).unwrap_or_default()
    )]
    CudaVersionUnresolved { torch: Option<String> },
}
