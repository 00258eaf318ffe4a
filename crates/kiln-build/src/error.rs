use std::path::PathBuf;

use crate::weights::WeightsError;

pub type Result<T> = std::result::Result<T, BuildError>;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] kiln_core::Error),

    #[error(
        "no matching base image for CUDA {}, Python {python}, torch {}",
        or_none(.cuda),
        or_none(.torch)
    )]
    NoMatchingBaseImage {
        cuda: Option<String>,
        python: String,
        torch: Option<String>,
    },

    #[error("failed to create build scratch directory {path}")]
    ScratchCreate {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {filename}")]
    StagingWrite {
        filename: String,
        source: std::io::Error,
    },

    #[error(
        "one of the commands in 'run' contains a new line, which won't work; \
         add a separate entry for each command.\n\nThis is the offending line: {command}"
    )]
    MultilineCommand { command: String },

    #[error(transparent)]
    WeightsDiscovery(#[from] WeightsError),

    #[error("failed to clean up {path}")]
    Cleanup {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn or_none(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("(none)")
}
