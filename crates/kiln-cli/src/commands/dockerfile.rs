use std::path::{Path, PathBuf};

use kiln_build::generator::{GeneratorOptions, Installer, parse_use_cuda_base_image};
use kiln_build::Generator;
use kiln_core::{KilnConfig, Platform};

use super::BUILD_STAGE_DEPS_ENV;

pub struct DockerfileArgs {
    pub separate_weights: bool,
    pub image: Option<String>,
    pub use_cuda_base_image: String,
    pub use_engine_base_image: bool,
    pub installer: Option<PathBuf>,
}

pub fn dockerfile(args: DockerfileArgs) -> anyhow::Result<()> {
    let project_dir = PathBuf::from(".");
    let config = KilnConfig::load(&project_dir)?;
    let image_name = match args.image.as_deref().or(config.image.as_deref()) {
        Some(name) => name.to_owned(),
        None => default_image_name(&project_dir)?,
    };
    let installer = load_installer(args.installer.as_deref())?;
    tracing::debug!(image = %image_name, installer = %installer.filename, "generating Dockerfile");

    let options = GeneratorOptions {
        use_cuda_base_image: parse_use_cuda_base_image(&args.use_cuda_base_image),
        use_engine_base_image: args.use_engine_base_image,
        build_stage_deps: std::env::var(BUILD_STAGE_DEPS_ENV)
            .ok()
            .filter(|v| !v.is_empty()),
        platform: Platform::host(),
    };

    let mut generator = Generator::new(config, &project_dir, installer, options)?;
    let output = render(&mut generator, args.separate_weights, &image_name);

    let output = finish(output, generator.cleanup())?;

    print!("{output}");
    Ok(())
}

/// Combines the generation result with the cleanup result. A generation
/// error is returned as is; a cleanup error alongside it is only logged.
fn finish(
    output: anyhow::Result<String>,
    cleanup: kiln_build::error::Result<()>,
) -> anyhow::Result<String> {
    match (output, cleanup) {
        (Ok(output), Ok(())) => Ok(output),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup_err)) => {
            tracing::warn!(error = %cleanup_err, "failed to clean up build scratch directory");
            Err(e)
        }
    }
}

fn render(
    generator: &mut Generator,
    separate_weights: bool,
    image_name: &str,
) -> anyhow::Result<String> {
    if !separate_weights {
        return Ok(format!(
            "{}\n",
            generator.generate_dockerfile_without_separate_weights()?
        ));
    }

    let result = generator.generate_model_base_with_separate_weights(image_name)?;
    Ok(format!(
        "=== Weights Dockerfile contents:\n{}\n===\n\
         === Runner Dockerfile contents:\n{}\n===\n\
         === DockerIgnore contents:\n{}===\n",
        result.weights_dockerfile, result.dockerfile, result.dockerignore
    ))
}

fn load_installer(path: Option<&Path>) -> anyhow::Result<Installer> {
    let path = path.ok_or_else(|| {
        anyhow::anyhow!("no installer wheel given; pass --installer or set KILN_INSTALLER_WHEEL")
    })?;
    let bytes = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("failed to read installer wheel {}: {e}", path.display()))?;
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) if name.ends_with(".whl") => Ok(Installer::new(name, bytes)),
        _ => Ok(Installer::wheel(bytes)),
    }
}

/// `kiln-<directory name>`, lowercased.
fn default_image_name(project_dir: &Path) -> anyhow::Result<String> {
    let dir = std::fs::canonicalize(project_dir)?;
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "model".to_owned());
    Ok(format!("kiln-{name}"))
}
