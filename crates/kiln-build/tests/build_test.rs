use std::path::Path;

use kiln_build::context::{DOCKERIGNORE, DOCKERIGNORE_BACKUP, install_dockerignore};
use kiln_build::generator::{DEFAULT_INSTALLER_FILENAME, GeneratorOptions, Installer};
use kiln_build::weights::{DOCKERIGNORE_HEADER, SIZE_THRESHOLD, Visit, WeightsError};
use kiln_build::{BaseStrategy, BuildError, FileInfo, FileWalker, Generator, Instruction};
use kiln_core::{KilnConfig, Platform, RunItem, RunMount};
use tempfile::TempDir;

fn installer() -> Installer {
    Installer::wheel(b"fake wheel".to_vec())
}

fn options() -> GeneratorOptions {
    GeneratorOptions {
        platform: Platform::linux_amd64(),
        ..Default::default()
    }
}

fn engine_options() -> GeneratorOptions {
    GeneratorOptions {
        use_engine_base_image: true,
        ..options()
    }
}

fn cpu_config() -> KilnConfig {
    let mut config = KilnConfig::default();
    config.build.python_version = "3.11".to_owned();
    config
}

fn gpu_config() -> KilnConfig {
    let mut config = KilnConfig::default();
    config.build.gpu = true;
    config.build.cuda = Some("11.8".to_owned());
    config.build.python_version = "3.10".to_owned();
    config.build.python_packages = vec![
        "torch==2.0.1".to_owned(),
        "torchvision==0.15.2".to_owned(),
        "pandas==2.0.3".to_owned(),
    ];
    config
}

fn generator(config: KilnConfig, dir: &Path, options: GeneratorOptions) -> Generator {
    Generator::new(config, dir, installer(), options).unwrap()
}

/// Relative scratch path as it appears in COPY lines.
fn scratch_prefix(generator: &Generator) -> String {
    generator
        .relative_scratch_dir()
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// In-memory project tree: `(path, is_dir, size)`.
struct FakeWalker(Vec<(&'static str, bool, u64)>);

impl FileWalker for FakeWalker {
    fn walk(&self, root: &Path, visit: &mut Visit<'_>) -> Result<(), WeightsError> {
        let root = root.to_string_lossy().into_owned();
        for (path, is_dir, size) in &self.0 {
            let inside = root == "."
                || *path == root
                || path.starts_with(&format!("{root}/"));
            if inside {
                visit(
                    Path::new(path),
                    Ok(FileInfo {
                        is_dir: *is_dir,
                        size: *size,
                    }),
                )?;
            }
        }
        Ok(())
    }
}

fn weights_walker() -> FakeWalker {
    FakeWalker(vec![
        (".", true, 0),
        ("predict.py", false, 2_000),
        ("weights", true, 0),
        ("weights/model.safetensors", false, SIZE_THRESHOLD * 3),
        ("weights/config.json", false, 512),
        ("a.bin", false, SIZE_THRESHOLD),
    ])
}

fn count_from(steps: &[Instruction]) -> usize {
    steps.iter().filter(|s| s.is_from()).count()
}

// ── Strategy selection ──

#[test]
fn strategy_selected_at_construction() {
    let tmp = TempDir::new().unwrap();

    let engine = generator(gpu_config(), tmp.path(), engine_options());
    let cuda = generator(gpu_config(), tmp.path(), options());
    let plain = generator(
        gpu_config(),
        tmp.path(),
        GeneratorOptions {
            use_cuda_base_image: false,
            ..options()
        },
    );

    assert_eq!(engine.strategy(), BaseStrategy::EngineBase);
    assert_eq!(cuda.strategy(), BaseStrategy::AcceleratorBase);
    assert_eq!(plain.strategy(), BaseStrategy::Plain);
}

// ── Plain strategy ──

#[test]
fn plain_dockerfile_layout() {
    let tmp = TempDir::new().unwrap();
    let mut generator = generator(cpu_config(), tmp.path(), options());

    let output = generator.generate_dockerfile_without_separate_weights().unwrap();
    let scratch = scratch_prefix(&generator);

    let expected = format!(
        "#syntax=docker/dockerfile:1.4\n\
         FROM python:3.11 AS deps\n\
         COPY {scratch}/{DEFAULT_INSTALLER_FILENAME} /tmp/{DEFAULT_INSTALLER_FILENAME}\n\
         RUN --mount=type=cache,target=/root/.cache/pip pip install -t /dep /tmp/{DEFAULT_INSTALLER_FILENAME}\n\
         FROM python:3.11-slim\n\
         ENV DEBIAN_FRONTEND=noninteractive\n\
         ENV PYTHONUNBUFFERED=1\n\
         ENV LD_LIBRARY_PATH=$LD_LIBRARY_PATH:/usr/lib/x86_64-linux-gnu:/usr/local/nvidia/lib64:/usr/local/nvidia/bin\n\
         ENV NVIDIA_DRIVER_CAPABILITIES=all\n"
    );
    assert!(output.starts_with(&expected), "got:\n{output}");
    assert!(output.contains("ENTRYPOINT [\"/sbin/tini\", \"--\"]"));
    assert!(output.ends_with(
        "COPY --from=deps --link /dep /usr/local/lib/python3.11/site-packages\n\
         WORKDIR /src\n\
         EXPOSE 5000\n\
         CMD [\"python\", \"-m\", \"kiln.server.http\"]\n\
         COPY . /src"
    ));
    assert!(!output.contains("pyenv"));
    assert!(!output.contains("\n\n"));

    generator.cleanup().unwrap();
}

#[test]
fn plain_stages_installer_into_scratch() {
    let tmp = TempDir::new().unwrap();
    let mut generator = generator(cpu_config(), tmp.path(), options());

    generator.generate_model_base().unwrap();

    let wheel = std::fs::read(generator.scratch_dir().join(DEFAULT_INSTALLER_FILENAME)).unwrap();
    assert_eq!(wheel, b"fake wheel");
    assert!(!generator.scratch_dir().join("requirements.txt").exists());
}

#[test]
fn deps_stage_installs_full_requirements() {
    let tmp = TempDir::new().unwrap();
    let mut config = cpu_config();
    config.build.python_packages = vec!["torch==2.0.1".to_owned(), "numpy==1.26.4".to_owned()];
    let mut generator = generator(config, tmp.path(), options());

    let output = generator.generate_model_base().unwrap();

    assert!(output.contains(
        "RUN --mount=type=cache,target=/root/.cache/pip pip install -t /dep -r /tmp/requirements.txt"
    ));
    let staged = std::fs::read_to_string(generator.scratch_dir().join("requirements.txt")).unwrap();
    assert_eq!(
        staged,
        "--extra-index-url https://download.pytorch.org/whl/cpu\ntorch==2.0.1\nnumpy==1.26.4"
    );
    assert_eq!(generator.python_requirements(), staged);
}

#[test]
fn build_stage_deps_runs_in_deps_stage() {
    let tmp = TempDir::new().unwrap();
    let mut generator = generator(
        cpu_config(),
        tmp.path(),
        GeneratorOptions {
            build_stage_deps: Some("apt-get install -y libsndfile1".to_owned()),
            ..options()
        },
    );

    let output = generator.generate_model_base().unwrap();

    assert!(output.contains("FROM python:3.11 AS deps\nRUN apt-get install -y libsndfile1\n"));
}

#[test]
fn plain_site_packages_path_uses_major_minor() {
    let tmp = TempDir::new().unwrap();
    let mut config = cpu_config();
    config.build.python_version = "3.10.4".to_owned();
    let mut generator = generator(config, tmp.path(), options());

    let output = generator.generate_model_base().unwrap();

    assert!(output.contains("FROM python:3.10.4-slim\n"));
    assert!(output.contains("/usr/local/lib/python3.10/site-packages"));
}

// ── Accelerator strategy ──

#[test]
fn cuda_dockerfile_builds_python_with_pyenv() {
    let tmp = TempDir::new().unwrap();
    let mut generator = generator(gpu_config(), tmp.path(), options());

    let output = generator.generate_model_base().unwrap();

    assert!(output.contains("FROM nvidia/cuda:11.8-cudnn8-devel-ubuntu22.04\n"));
    assert!(output.contains("ENV PATH=\"/root/.pyenv/shims:/root/.pyenv/bin:$PATH\""));
    assert!(output.contains("pyenv install-latest \"3.10\""));
    assert!(output.contains(
        "RUN --mount=type=bind,from=deps,source=/dep,target=/dep \\\n    cp -rf /dep/* $(pyenv prefix)/lib/python*/site-packages;"
    ));
    assert!(!output.contains("COPY --from=deps"));

    let tini = output.find("/sbin/tini\"").unwrap();
    let pyenv = output.find("pyenv-installer").unwrap();
    assert!(tini < pyenv, "tini must be installed before python");
}

#[test]
fn cuda_deps_stage_uses_gpu_torch_index() {
    let tmp = TempDir::new().unwrap();
    let mut generator = generator(gpu_config(), tmp.path(), options());

    generator.generate_model_base().unwrap();

    assert!(
        generator
            .python_requirements()
            .starts_with("--extra-index-url https://download.pytorch.org/whl/cu118\n")
    );
}

// ── Engine base strategy ──

#[test]
fn engine_dockerfile_layout() {
    let tmp = TempDir::new().unwrap();
    let mut config = gpu_config();
    config.build.system_packages = vec!["ffmpeg".to_owned(), "libsndfile1".to_owned()];
    let mut generator = generator(config, tmp.path(), engine_options());

    let output = generator.generate_dockerfile_without_separate_weights().unwrap();
    let scratch = scratch_prefix(&generator);

    let expected = format!(
        "#syntax=docker/dockerfile:1.4\n\
         FROM ghcr.io/kiln-build/kiln-base:cuda11.8-python3.10-torch2.0\n\
         RUN --mount=type=cache,target=/var/cache/apt,sharing=locked apt-get update -qq && apt-get install -qqy libsndfile1 && rm -rf /var/lib/apt/lists/*\n\
         COPY {scratch}/requirements.txt /tmp/requirements.txt\n\
         RUN pip install -r /tmp/requirements.txt\n\
         WORKDIR /src\n\
         EXPOSE 5000\n\
         CMD [\"python\", \"-m\", \"kiln.server.http\"]\n\
         COPY . /src"
    );
    assert_eq!(output, expected);

    let staged = std::fs::read_to_string(generator.scratch_dir().join("requirements.txt")).unwrap();
    assert_eq!(staged, "pandas==2.0.3");
    assert!(!generator.scratch_dir().join(DEFAULT_INSTALLER_FILENAME).exists());
}

#[test]
fn engine_skips_pip_install_when_base_has_everything() {
    let tmp = TempDir::new().unwrap();
    let mut config = gpu_config();
    config.build.python_packages = vec!["torch==2.0.1".to_owned()];
    let mut generator = generator(config, tmp.path(), engine_options());

    let steps = generator.model_base_instructions().unwrap();

    assert_eq!(count_from(&steps), 1);
    assert!(!steps.iter().any(|s| s.to_string().contains("pip install")));
    assert_eq!(generator.python_requirements(), "");
}

#[test]
fn engine_never_emits_deps_stage_or_tini() {
    let tmp = TempDir::new().unwrap();
    let mut generator = generator(gpu_config(), tmp.path(), engine_options());

    let output = generator.generate_model_base().unwrap();

    assert!(!output.contains(" AS deps"));
    assert!(!output.contains("tini"));
    assert!(!output.contains("pyenv"));
    assert!(!output.contains("ENV "));
}

#[test]
fn engine_unsupported_combination_errors() {
    let tmp = TempDir::new().unwrap();
    let mut config = gpu_config();
    config.build.cuda = Some("11.6".to_owned());
    config.build.python_packages = vec!["torch==2.1.0".to_owned()];
    let mut generator = generator(config, tmp.path(), engine_options());

    let err = generator.generate_model_base().unwrap_err();

    assert!(matches!(err, BuildError::NoMatchingBaseImage { .. }), "got: {err:?}");
}

// ── System packages ──

#[test]
fn no_system_package_install_when_empty() {
    let tmp = TempDir::new().unwrap();
    for options in [options(), engine_options()] {
        let mut generator = generator(cpu_config(), tmp.path(), options);

        let steps = generator.model_base_instructions().unwrap();

        let apt = steps.iter().filter(|s| match s {
            Instruction::Run { command, .. } => {
                command.starts_with("apt-get update -qq && apt-get install -qqy ")
                    && !command.contains("--no-install-recommends")
            }
            _ => false,
        });
        assert_eq!(apt.count(), 0);
        generator.cleanup().unwrap();
    }
}

#[test]
fn system_packages_installed_in_order() {
    let tmp = TempDir::new().unwrap();
    let mut config = cpu_config();
    config.build.system_packages = vec!["libgl1".to_owned(), "ffmpeg".to_owned()];
    let mut generator = generator(config, tmp.path(), options());

    let output = generator.generate_model_base().unwrap();

    assert!(output.contains("apt-get install -qqy libgl1 ffmpeg && rm -rf /var/lib/apt/lists/*"));
}

// ── Run commands ──

#[test]
fn run_commands_follow_dependency_install() {
    let tmp = TempDir::new().unwrap();
    let mut config = cpu_config();
    config.build.run = vec![
        RunItem::new("  echo one  "),
        RunItem {
            command: "cat /run/secrets/hf".to_owned(),
            mounts: vec![RunMount::secret("hf", "/run/secrets/hf")],
        },
    ];
    config.build.pre_install = vec!["pip install cython".to_owned()];
    let mut generator = generator(config, tmp.path(), options());

    let output = generator.generate_model_base().unwrap();

    assert!(output.contains(
        "COPY --from=deps --link /dep /usr/local/lib/python3.11/site-packages\n\
         RUN echo one\n\
         RUN --mount=type=secret,id=hf,target=/run/secrets/hf cat /run/secrets/hf\n\
         RUN pip install cython\n\
         WORKDIR /src"
    ));
}

#[test]
fn non_secret_mounts_produce_no_mount_token() {
    let tmp = TempDir::new().unwrap();
    let mut config = cpu_config();
    config.build.run = vec![RunItem {
        command: "make".to_owned(),
        mounts: vec![RunMount {
            mount_type: "cache".to_owned(),
            id: "c".to_owned(),
            target: "/c".to_owned(),
        }],
    }];
    let mut generator = generator(config, tmp.path(), engine_options());

    let output = generator.generate_model_base().unwrap();

    assert!(output.contains("\nRUN make\n"));
    assert!(!output.contains("type=cache,target=/c"));
}

#[test]
fn multiline_run_command_errors_with_offending_text() {
    let tmp = TempDir::new().unwrap();
    let mut config = cpu_config();
    config.build.run = vec![RunItem::new("\n  echo a\necho b  \n")];
    let mut generator = generator(config, tmp.path(), options());

    let err = generator.generate_model_base().unwrap_err();

    assert!(matches!(err, BuildError::MultilineCommand { .. }));
    assert!(err.to_string().contains("echo a\necho b"), "got: {err}");
    generator.cleanup().unwrap();
    assert!(!generator.scratch_dir().exists());
}

// ── Separate weights ──

#[test]
fn separate_weights_splices_weights_stage() {
    let tmp = TempDir::new().unwrap();
    let mut generator =
        generator(cpu_config(), tmp.path(), options()).with_file_walker(weights_walker());

    let result = generator
        .generate_model_base_with_separate_weights("registry.example.com/acme/model")
        .unwrap();

    assert_eq!(
        result.weights_dockerfile,
        "#syntax=docker/dockerfile:1.4\n\
         FROM scratch\n\
         COPY weights /src/weights\n\
         COPY a.bin /src/a.bin"
    );
    assert_eq!(
        result.dockerignore,
        format!("{DOCKERIGNORE_HEADER}weights\nweights/**/*\na.bin\n")
    );

    let lines: Vec<&str> = result.dockerfile.lines().collect();
    assert_eq!(lines[0], "#syntax=docker/dockerfile:1.4");
    assert_eq!(
        lines[1],
        "FROM registry.example.com/acme/model-weights AS weights"
    );
    assert_eq!(lines[2], "FROM python:3.11 AS deps");
    assert!(result.dockerfile.ends_with(
        "CMD [\"python\", \"-m\", \"kiln.server.http\"]\n\
         COPY --from=weights --link /src/weights /src/weights\n\
         COPY --from=weights --link /src/a.bin /src/a.bin\n\
         COPY . /src"
    ));
    assert_eq!(lines.iter().filter(|l| **l == "COPY . /src").count(), 1);
    assert_eq!(generator.model_dirs(), ["weights"]);
    assert_eq!(generator.model_files(), ["a.bin"]);
}

#[test]
fn separate_weights_with_engine_base_keeps_single_main_from() {
    let tmp = TempDir::new().unwrap();
    let mut generator =
        generator(gpu_config(), tmp.path(), engine_options()).with_file_walker(weights_walker());

    let result = generator
        .generate_model_base_with_separate_weights("model")
        .unwrap();

    let from_lines: Vec<&str> = result
        .dockerfile
        .lines()
        .filter(|l| l.starts_with("FROM "))
        .collect();
    assert_eq!(
        from_lines,
        vec![
            "FROM model-weights AS weights",
            "FROM ghcr.io/kiln-build/kiln-base:cuda11.8-python3.10-torch2.0",
        ]
    );
    assert_eq!(result.dockerfile.lines().last(), Some("COPY . /src"));
}

#[test]
fn separate_weights_without_weights_still_ends_with_source_copy() {
    let tmp = TempDir::new().unwrap();
    let mut generator = generator(cpu_config(), tmp.path(), options())
        .with_file_walker(FakeWalker(vec![("predict.py", false, 100)]));

    let result = generator
        .generate_model_base_with_separate_weights("model")
        .unwrap();

    assert!(!result.dockerfile.contains("--from=weights"));
    assert_eq!(result.dockerfile.lines().last(), Some("COPY . /src"));
    assert_eq!(result.dockerignore, DOCKERIGNORE_HEADER);
}

#[test]
fn separate_weights_propagates_walk_errors() {
    struct BrokenWalker;
    impl FileWalker for BrokenWalker {
        fn walk(&self, root: &Path, visit: &mut Visit<'_>) -> Result<(), WeightsError> {
            visit(
                root,
                Err(WeightsError::Walk {
                    path: root.to_path_buf(),
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                }),
            )
        }
    }

    let tmp = TempDir::new().unwrap();
    let mut generator =
        generator(cpu_config(), tmp.path(), options()).with_file_walker(BrokenWalker);

    let err = generator
        .generate_model_base_with_separate_weights("model")
        .unwrap_err();

    assert!(matches!(
        err,
        BuildError::WeightsDiscovery(WeightsError::Walk { .. })
    ));
}

#[test]
fn separate_weights_on_disk_and_manifest() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path();
    std::fs::create_dir_all(project.join("weights")).unwrap();
    std::fs::write(project.join("predict.py"), "print('hi')").unwrap();
    let big = std::fs::File::create(project.join("weights/model.bin")).unwrap();
    big.set_len(SIZE_THRESHOLD).unwrap();
    std::fs::write(project.join("weights/hello.txt"), "hello").unwrap();

    let mut generator = generator(cpu_config(), project, options());
    let result = generator
        .generate_model_base_with_separate_weights("model")
        .unwrap();

    assert!(result.weights_dockerfile.contains("COPY weights /src/weights"));
    // Scratch files under .kiln are never mistaken for weights.
    assert!(!result.dockerignore.contains(".kiln"));

    let manifest = generator.generate_weights_manifest().unwrap();
    assert_eq!(manifest.files.len(), 2);
    assert_eq!(
        manifest.files["weights/hello.txt"],
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
    assert!(manifest.files.contains_key("weights/model.bin"));

    let path = project.join(".kiln/weights-manifest.json");
    manifest.save(&path).unwrap();
    let loaded = kiln_build::WeightsManifest::load(&path).unwrap();
    assert!(loaded.matches(&manifest));
}

#[test]
fn manifest_empty_before_weights_are_split() {
    let tmp = TempDir::new().unwrap();
    let generator = generator(cpu_config(), tmp.path(), options());

    let manifest = generator.generate_weights_manifest().unwrap();

    assert!(manifest.files.is_empty());
}

// ── Determinism ──

#[test]
fn reruns_differ_only_in_scratch_paths() {
    let tmp = TempDir::new().unwrap();
    let mut config = cpu_config();
    config.build.python_packages = vec!["numpy==1.26.4".to_owned()];

    let mut first = generator(config.clone(), tmp.path(), options());
    let mut second = generator(config, tmp.path(), options());
    assert_ne!(first.scratch_dir(), second.scratch_dir());

    let a = first.generate_dockerfile_without_separate_weights().unwrap();
    let b = second.generate_dockerfile_without_separate_weights().unwrap();

    assert_ne!(a, b);
    assert_eq!(
        a.replace(&scratch_prefix(&first), "<scratch>"),
        b.replace(&scratch_prefix(&second), "<scratch>")
    );
}

// ── Cleanup ──

#[test]
fn cleanup_removes_scratch_and_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let mut generator = generator(cpu_config(), tmp.path(), options());
    generator.generate_model_base().unwrap();
    assert!(generator.scratch_dir().exists());

    generator.cleanup().unwrap();
    assert!(!generator.scratch_dir().exists());
    generator.cleanup().unwrap();
}

#[test]
fn cleanup_without_generation() {
    let tmp = TempDir::new().unwrap();
    let generator = generator(cpu_config(), tmp.path(), options());

    generator.cleanup().unwrap();
    assert!(tmp.path().join(".kiln/tmp").exists());
}

// ── .dockerignore installation ──

#[test]
fn dockerignore_install_and_restore_with_existing_file() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path();
    std::fs::write(project.join(DOCKERIGNORE), "node_modules\n").unwrap();

    let guard = install_dockerignore(project, "weights\n").unwrap();

    assert_eq!(
        std::fs::read_to_string(project.join(DOCKERIGNORE)).unwrap(),
        "weights\n"
    );
    assert_eq!(
        std::fs::read_to_string(project.join(DOCKERIGNORE_BACKUP)).unwrap(),
        "node_modules\n"
    );

    guard.restore().unwrap();

    assert_eq!(
        std::fs::read_to_string(project.join(DOCKERIGNORE)).unwrap(),
        "node_modules\n"
    );
    assert!(!project.join(DOCKERIGNORE_BACKUP).exists());
}

#[test]
fn dockerignore_restore_without_original_removes_file() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path();

    let guard = install_dockerignore(project, "weights\n").unwrap();
    guard.restore().unwrap();

    assert!(!project.join(DOCKERIGNORE).exists());
    assert!(!project.join(DOCKERIGNORE_BACKUP).exists());
}

#[test]
fn generated_dockerignore_swaps_in_for_build_and_back() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path();
    std::fs::write(project.join(DOCKERIGNORE), "*.log\n").unwrap();

    let mut generator =
        generator(cpu_config(), project, options()).with_file_walker(weights_walker());
    let result = generator
        .generate_model_base_with_separate_weights("model")
        .unwrap();

    let guard = install_dockerignore(project, &result.dockerignore).unwrap();
    let installed = std::fs::read_to_string(project.join(DOCKERIGNORE)).unwrap();
    assert!(installed.ends_with("weights\nweights/**/*\na.bin\n"));

    guard.restore().unwrap();
    generator.cleanup().unwrap();

    assert_eq!(
        std::fs::read_to_string(project.join(DOCKERIGNORE)).unwrap(),
        "*.log\n"
    );
    assert!(!project.join(DOCKERIGNORE_BACKUP).exists());
}

#[test]
fn dockerignore_refuses_to_clobber_stale_backup() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path();
    std::fs::write(project.join(DOCKERIGNORE_BACKUP), "old").unwrap();

    let result = install_dockerignore(project, "weights\n");

    assert!(result.is_err());
    let err = result.unwrap_err().to_string();
    assert!(err.contains("already exists"), "got: {err}");
}
