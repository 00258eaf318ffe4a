//! Dockerfile generation for kiln model images.
//!
//! # Build plan
//!
//! ```text
//! kiln.toml
//!   1. Base image   ── BaseStrategy::select() + base_image::resolve()
//!   2. Deps stage   ── FROM python:<v> AS deps, installer wheel + requirements
//!   3. Main stage   ── env, tini, python (CUDA only), apt, deps copy, run
//!   4. Server       ── WORKDIR /src, EXPOSE 5000, CMD
//!   5. Source       ── COPY . /src
//! ```
//!
//! With the engine base image, step 2 disappears: requirements are
//! installed directly on top of a prebuilt image that already ships
//! Python, CUDA and torch.
//!
//! # Separate weights
//!
//! [`Generator::generate_model_base_with_separate_weights`] moves large
//! weight files into a `FROM scratch` image of their own and copies them
//! in with `COPY --from=weights --link`, so a code change does not
//! invalidate the weights layers. The returned `.dockerignore` keeps them
//! out of the main build context.

pub mod base_image;
pub mod context;
pub mod error;
pub mod generator;
pub mod instruction;
pub mod requirements;
pub mod staging;
pub mod weights;

pub use base_image::BaseStrategy;
pub use error::BuildError;
pub use generator::{Generator, GeneratorOptions, Installer, SeparateWeights};
pub use instruction::Instruction;
pub use weights::{DiskWalker, FileInfo, FileWalker, WeightsManifest};
