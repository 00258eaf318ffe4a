use std::path::{Path, PathBuf};

use kiln_core::{KilnConfig, Platform, RunItem, strip_patch_version};

use crate::base_image::{self, BaseStrategy, ENGINE_BASE_SYSTEM_PACKAGES};
use crate::error::{BuildError, Result};
use crate::instruction::{self, Instruction};
use crate::requirements::{self, RequirementsResolver};
use crate::staging::ScratchDir;
use crate::weights::{self, DiskWalker, FileWalker, WeightsManifest};

/// Wheel filename pip accepts for the embedded installer.
pub const DEFAULT_INSTALLER_FILENAME: &str = "kiln-0.0.1.dev-py3-none-any.whl";

/// Stage alias of the dependency install stage.
pub const DEPS_STAGE: &str = "deps";
/// Stage alias of the weights-only image.
pub const WEIGHTS_STAGE: &str = "weights";

const SERVER_PORT: u16 = 5000;
const APT_CACHE_MOUNT: &str = "--mount=type=cache,target=/var/cache/apt,sharing=locked";
const PIP_CACHE_MOUNT: &str = "--mount=type=cache,target=/root/.cache/pip";
const DEPS_BIND_MOUNT: &str = "--mount=type=bind,from=deps,source=/dep,target=/dep";

/// The Python package that serves the model, installed into every image.
#[derive(Debug, Clone)]
pub struct Installer {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl Installer {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }

    /// Installer wheel under its default filename.
    pub fn wheel(bytes: Vec<u8>) -> Self {
        Self::new(DEFAULT_INSTALLER_FILENAME, bytes)
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    /// Start GPU builds from the NVIDIA CUDA image
    pub use_cuda_base_image: bool,
    /// Start from a prebuilt kiln base image; overrides `use_cuda_base_image`
    pub use_engine_base_image: bool,
    /// Extra command run in the deps stage before installing requirements
    pub build_stage_deps: Option<String>,
    /// Platform requirements are resolved for
    pub platform: Platform,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            use_cuda_base_image: true,
            use_engine_base_image: false,
            build_stage_deps: None,
            platform: Platform::host(),
        }
    }
}

/// `"false"` disables the CUDA base image; anything else (`"auto"`,
/// `"true"`, ...) enables it.
pub fn parse_use_cuda_base_image(value: &str) -> bool {
    value != "false"
}

/// Output of [`Generator::generate_model_base_with_separate_weights`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeparateWeights {
    /// Dockerfile of the `FROM scratch` image holding only the weights
    pub weights_dockerfile: String,
    /// Main Dockerfile, copying weights from the weights image
    pub dockerfile: String,
    /// `.dockerignore` keeping weights out of the main build context
    pub dockerignore: String,
}

/// Generates the Dockerfile for a model project.
///
/// A generator owns a scratch directory under `<dir>/.kiln/tmp` that the
/// Dockerfile `COPY`s staged files from. Call [`Generator::cleanup`] once
/// the build context has been sent.
pub struct Generator {
    config: KilnConfig,
    dir: PathBuf,
    installer: Installer,
    options: GeneratorOptions,
    strategy: BaseStrategy,
    scratch: ScratchDir,
    file_walker: Box<dyn FileWalker>,
    model_dirs: Vec<String>,
    model_files: Vec<String>,
    requirements: RequirementsResolver,
}

impl Generator {
    pub fn new(
        config: KilnConfig,
        dir: impl Into<PathBuf>,
        installer: Installer,
        options: GeneratorOptions,
    ) -> Result<Self> {
        let dir = dir.into();
        let scratch = ScratchDir::create(&dir)?;
        let strategy = BaseStrategy::select(
            &config,
            options.use_cuda_base_image,
            options.use_engine_base_image,
        );
        tracing::debug!(?strategy, dir = %dir.display(), "created Dockerfile generator");

        Ok(Self {
            file_walker: Box::new(DiskWalker::new(dir.clone())),
            config,
            dir,
            installer,
            options,
            strategy,
            scratch,
            model_dirs: Vec::new(),
            model_files: Vec::new(),
            requirements: RequirementsResolver::default(),
        })
    }

    /// Replaces the walker used to find weights.
    pub fn with_file_walker(mut self, walker: impl FileWalker + 'static) -> Self {
        self.file_walker = Box::new(walker);
        self
    }

    pub fn strategy(&self) -> BaseStrategy {
        self.strategy
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Scratch directory relative to the project directory.
    pub fn relative_scratch_dir(&self) -> &Path {
        self.scratch.relative()
    }

    /// requirements.txt contents from the last generation.
    pub fn python_requirements(&self) -> &str {
        self.requirements.last()
    }

    pub fn model_dirs(&self) -> &[String] {
        &self.model_dirs
    }

    pub fn model_files(&self) -> &[String] {
        &self.model_files
    }

    pub fn base_image(&self) -> Result<String> {
        base_image::resolve(&self.config, self.strategy)
    }

    /// Everything up to and including the custom `run` commands.
    pub fn initial_steps(&mut self) -> Result<Vec<Instruction>> {
        let base_image = self.base_image()?;
        match self.strategy {
            BaseStrategy::EngineBase => self.engine_base_steps(base_image),
            BaseStrategy::AcceleratorBase | BaseStrategy::Plain => {
                self.deps_stage_steps(base_image)
            }
        }
    }

    /// The model image without the project source.
    pub fn model_base_instructions(&mut self) -> Result<Vec<Instruction>> {
        let mut steps = self.initial_steps()?;
        steps.extend(server_steps());
        Ok(steps)
    }

    pub fn generate_model_base(&mut self) -> Result<String> {
        Ok(instruction::render(&self.model_base_instructions()?))
    }

    /// Dockerfile that copies weights along with the rest of the project.
    pub fn generate_dockerfile_without_separate_weights(&mut self) -> Result<String> {
        let mut steps = self.model_base_instructions()?;
        steps.push(copy_source());
        Ok(instruction::render(&steps))
    }

    /// Dockerfile that copies weights from a separately built
    /// `<image_name>-weights` image.
    pub fn generate_model_base_with_separate_weights(
        &mut self,
        image_name: &str,
    ) -> Result<SeparateWeights> {
        let split = weights::split_weights(self.file_walker.as_ref())?;
        self.model_dirs = split.dirs;
        self.model_files = split.files;

        let steps = self.separate_weights_instructions(image_name)?;
        Ok(SeparateWeights {
            weights_dockerfile: split.dockerfile,
            dockerfile: instruction::render(&steps),
            dockerignore: weights::make_dockerignore(&self.model_dirs, &self.model_files),
        })
    }

    fn separate_weights_instructions(&mut self, image_name: &str) -> Result<Vec<Instruction>> {
        let initial = self.initial_steps()?;
        let first_from = initial
            .iter()
            .position(Instruction::is_from)
            .unwrap_or(initial.len());
        let (head, tail) = initial.split_at(first_from);

        let mut steps = Vec::with_capacity(initial.len() + self.model_dirs.len() + 6);
        steps.extend_from_slice(head);
        steps.push(Instruction::from_stage(
            format!("{image_name}-weights"),
            WEIGHTS_STAGE,
        ));
        steps.extend_from_slice(tail);
        steps.extend(server_steps());
        for path in self.model_dirs.iter().chain(&self.model_files) {
            let target = weights::container_path(path);
            steps.push(Instruction::copy_from(WEIGHTS_STAGE, target.clone(), target));
        }
        steps.push(copy_source());
        Ok(steps)
    }

    /// Fingerprints every file found by the last separate-weights generation.
    pub fn generate_weights_manifest(&self) -> Result<WeightsManifest> {
        Ok(weights::build_manifest(
            self.file_walker.as_ref(),
            &self.dir,
            &self.model_dirs,
            &self.model_files,
        )?)
    }

    /// Deletes the scratch directory. Safe to call more than once.
    pub fn cleanup(&self) -> Result<()> {
        self.scratch.remove()
    }

    // ── Engine base image ──

    fn engine_base_steps(&mut self, base_image: String) -> Result<Vec<Instruction>> {
        let mut steps = vec![Instruction::syntax(), Instruction::from_image(base_image)];
        steps.extend(self.apt_installs());
        steps.extend(self.pip_installs()?);
        steps.extend(self.run_commands()?);
        Ok(steps)
    }

    /// Installs requirements not already in the engine base image.
    fn pip_installs(&mut self) -> Result<Vec<Instruction>> {
        let exclude = requirements::engine_base_exclusions(&self.config);
        let contents = self
            .requirements
            .resolve(&self.config, &self.options.platform, &exclude)
            .to_owned();
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }

        let staged = self.scratch.stage("requirements.txt", contents.as_bytes())?;
        Ok(vec![
            staged.copy,
            Instruction::run(format!("pip install -r {}", staged.container_path)),
        ])
    }

    // ── Separate deps stage ──

    fn deps_stage_steps(&mut self, base_image: String) -> Result<Vec<Instruction>> {
        let mut steps = vec![Instruction::syntax()];
        steps.extend(self.pip_install_stage()?);
        steps.push(Instruction::from_image(base_image));
        steps.extend(preamble());
        steps.extend(install_tini());
        steps.extend(self.install_python());
        steps.extend(self.apt_installs());
        steps.push(self.copy_pip_packages_from_install_stage()?);
        steps.extend(self.run_commands()?);
        Ok(steps)
    }

    /// `FROM python:<v> AS deps`, installing the installer wheel and all
    /// requirements into `/dep`. Not slim, so wheels can be compiled.
    fn pip_install_stage(&mut self) -> Result<Vec<Instruction>> {
        let mut steps = vec![Instruction::from_stage(
            format!("python:{}", self.config.build.python_version),
            DEPS_STAGE,
        )];
        if let Some(command) = self
            .options
            .build_stage_deps
            .as_deref()
            .filter(|c| !c.trim().is_empty())
        {
            steps.push(Instruction::run(command));
        }
        steps.extend(self.install_installer()?);

        let contents = self
            .requirements
            .resolve(&self.config, &self.options.platform, &[])
            .to_owned();
        if contents.trim().is_empty() {
            return Ok(steps);
        }

        let staged = self.scratch.stage("requirements.txt", contents.as_bytes())?;
        steps.push(staged.copy);
        steps.push(Instruction::run_with_mount(
            PIP_CACHE_MOUNT,
            format!("pip install -t /dep -r {}", staged.container_path),
        ));
        Ok(steps)
    }

    fn install_installer(&self) -> Result<Vec<Instruction>> {
        let staged = self
            .scratch
            .stage(&self.installer.filename, &self.installer.bytes)?;
        Ok(vec![
            staged.copy,
            Instruction::run_with_mount(
                PIP_CACHE_MOUNT,
                format!("pip install -t /dep {}", staged.container_path),
            ),
        ])
    }

    /// Builds the requested Python with pyenv on top of the CUDA image.
    ///
    /// `pyenv install-latest` picks the newest patch release matching
    /// the configured version at build time.
    fn install_python(&self) -> Vec<Instruction> {
        if self.strategy != BaseStrategy::AcceleratorBase {
            return Vec::new();
        }

        let py = &self.config.build.python_version;
        vec![
            Instruction::env("PATH", r#""/root/.pyenv/shims:/root/.pyenv/bin:$PATH""#),
            Instruction::run_with_mount(
                APT_CACHE_MOUNT,
                r"apt-get update -qq && apt-get install -qqy --no-install-recommends \
    make \
    build-essential \
    libssl-dev \
    zlib1g-dev \
    libbz2-dev \
    libreadline-dev \
    libsqlite3-dev \
    wget \
    curl \
    llvm \
    libncurses5-dev \
    libncursesw5-dev \
    xz-utils \
    tk-dev \
    libffi-dev \
    liblzma-dev \
    git \
    ca-certificates \
    && rm -rf /var/lib/apt/lists/*",
            ),
            Instruction::run(format!(
                r#"curl -s -S -L https://raw.githubusercontent.com/pyenv/pyenv-installer/master/bin/pyenv-installer | bash && \
    git clone https://github.com/momo-lab/pyenv-install-latest.git "$(pyenv root)"/plugins/pyenv-install-latest && \
    pyenv install-latest "{py}" && \
    pyenv global $(pyenv install-latest --print "{py}") && \
    pip install "wheel<1""#
            )),
        ]
    }

    fn copy_pip_packages_from_install_stage(&self) -> Result<Instruction> {
        if self.strategy == BaseStrategy::AcceleratorBase {
            // /dep is bind-mounted from the deps stage, never copied.
            return Ok(Instruction::run_with_mount(
                DEPS_BIND_MOUNT,
                r"\
    cp -rf /dep/* $(pyenv prefix)/lib/python*/site-packages; \
    cp -rf /dep/bin/* $(pyenv prefix)/bin; \
    pyenv rehash",
            ));
        }

        let (py, _) = strip_patch_version(&self.config.build.python_version)?;
        Ok(Instruction::copy_from(
            DEPS_STAGE,
            "/dep",
            format!("/usr/local/lib/python{py}/site-packages"),
        ))
    }

    // ── Shared ──

    fn apt_installs(&self) -> Option<Instruction> {
        let packages: Vec<&str> = self
            .config
            .build
            .system_packages
            .iter()
            .map(String::as_str)
            .filter(|p| {
                self.strategy != BaseStrategy::EngineBase
                    || !ENGINE_BASE_SYSTEM_PACKAGES.contains(p)
            })
            .collect();
        if packages.is_empty() {
            return None;
        }

        Some(Instruction::run_with_mount(
            APT_CACHE_MOUNT,
            format!(
                "apt-get update -qq && apt-get install -qqy {} && rm -rf /var/lib/apt/lists/*",
                packages.join(" ")
            ),
        ))
    }

    /// `run` entries followed by legacy `pre_install` commands.
    fn run_commands(&self) -> Result<Vec<Instruction>> {
        let legacy = self
            .config
            .build
            .pre_install
            .iter()
            .map(|command| RunItem::new(command.clone()));

        self.config
            .build
            .run
            .iter()
            .cloned()
            .chain(legacy)
            .map(|run| {
                let command = run.command.trim();
                if command.contains(['\n', '\r']) {
                    return Err(BuildError::MultilineCommand {
                        command: command.to_owned(),
                    });
                }

                let mut mounts = Vec::new();
                for mount in &run.mounts {
                    if mount.is_secret() {
                        mounts.push(format!(
                            "--mount=type=secret,id={},target={}",
                            mount.id, mount.target
                        ));
                    } else {
                        tracing::warn!(
                            mount_type = %mount.mount_type,
                            command,
                            "only secret mounts are supported in run commands; ignoring mount"
                        );
                    }
                }

                Ok(Instruction::Run {
                    mounts,
                    command: command.to_owned(),
                })
            })
            .collect()
    }
}

fn preamble() -> Vec<Instruction> {
    vec![
        Instruction::env("DEBIAN_FRONTEND", "noninteractive"),
        Instruction::env("PYTHONUNBUFFERED", "1"),
        Instruction::env(
            "LD_LIBRARY_PATH",
            "$LD_LIBRARY_PATH:/usr/lib/x86_64-linux-gnu:/usr/local/nvidia/lib64:/usr/local/nvidia/bin",
        ),
        Instruction::env("NVIDIA_DRIVER_CAPABILITIES", "all"),
    ]
}

/// tini as PID 1 for signal handling and zombie reaping.
fn install_tini() -> Vec<Instruction> {
    vec![
        Instruction::run_with_mount(
            APT_CACHE_MOUNT,
            r#"set -eux; \
apt-get update -qq && \
apt-get install -qqy --no-install-recommends curl; \
rm -rf /var/lib/apt/lists/*; \
TINI_VERSION=v0.19.0; \
TINI_ARCH="$(dpkg --print-architecture)"; \
curl -sSL -o /sbin/tini "https://github.com/krallin/tini/releases/download/${TINI_VERSION}/tini-${TINI_ARCH}"; \
chmod +x /sbin/tini"#,
        ),
        Instruction::Entrypoint(vec!["/sbin/tini".to_owned(), "--".to_owned()]),
    ]
}

fn server_steps() -> Vec<Instruction> {
    vec![
        Instruction::Workdir(weights::CONTAINER_ROOT.to_owned()),
        Instruction::Expose(SERVER_PORT),
        Instruction::Cmd(
            ["python", "-m", "kiln.server.http"]
                .map(str::to_owned)
                .to_vec(),
        ),
    ]
}

fn copy_source() -> Instruction {
    Instruction::copy(".", weights::CONTAINER_ROOT)
}
