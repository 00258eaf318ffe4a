//! Python requirements for the generated image.

use kiln_core::{KilnConfig, Platform};

/// Computes requirements.txt contents and remembers the last result.
#[derive(Debug, Default)]
pub struct RequirementsResolver {
    last: String,
}

impl RequirementsResolver {
    /// Requirements for `platform` minus the `exclude` specifiers.
    /// Each call replaces the remembered result.
    pub fn resolve(&mut self, config: &KilnConfig, platform: &Platform, exclude: &[String]) -> &str {
        self.last = config.python_requirements_for_platform(platform, exclude);
        if !self.last.trim().is_empty() {
            tracing::debug!("Generated requirements.txt:\n{}", self.last);
        }
        &self.last
    }

    /// The most recently computed requirements.
    pub fn last(&self) -> &str {
        &self.last
    }
}

/// Pins that an engine base image already satisfies.
pub fn engine_base_exclusions(config: &KilnConfig) -> Vec<String> {
    let mut exclude = Vec::new();
    if let Some(torch) = config.torch_version() {
        exclude.push(format!("torch=={torch}"));
    }
    if let Some(torchvision) = config.torchvision_version() {
        exclude.push(format!("torchvision=={torchvision}"));
    }
    exclude
}
