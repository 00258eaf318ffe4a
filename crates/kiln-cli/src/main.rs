mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kiln", about = "Generate Dockerfiles that package ML models for serving")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the Dockerfile for the model in the current directory
    Dockerfile {
        /// Put model weights in their own image
        #[arg(long)]
        separate_weights: bool,
        /// Image name (defaults to `image` in kiln.toml)
        #[arg(long, short = 't')]
        image: Option<String>,
        /// Use the NVIDIA CUDA base image for GPU models: auto, true, or false
        #[arg(long, default_value = "auto")]
        use_cuda_base_image: String,
        /// Use a prebuilt kiln base image with Python, CUDA and torch
        #[arg(long)]
        use_engine_base_image: bool,
        /// Installer wheel copied into the image
        #[arg(long, env = "KILN_INSTALLER_WHEEL")]
        installer: Option<PathBuf>,
    },
    /// Print the fingerprints of the model weights as JSON
    WeightsManifest,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Dockerfile {
            separate_weights,
            image,
            use_cuda_base_image,
            use_engine_base_image,
            installer,
        } => commands::dockerfile(commands::DockerfileArgs {
            separate_weights,
            image,
            use_cuda_base_image,
            use_engine_base_image,
            installer,
        })?,
        Commands::WeightsManifest => commands::weights_manifest()?,
    }

    Ok(())
}
