mod dockerfile;
mod manifest;

/// Extra command run in the deps stage before installing requirements.
pub(crate) const BUILD_STAGE_DEPS_ENV: &str = "KILN_EXPERIMENTAL_BUILD_STAGE_DEPS";

pub use dockerfile::{DockerfileArgs, dockerfile};
pub use manifest::weights_manifest;
