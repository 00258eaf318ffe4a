//! Typed Dockerfile instructions.
//!
//! Plans are assembled as `Vec<Instruction>` and only turned into text by
//! [`render`], so the structure of a plan can be inspected directly.

use std::fmt;

/// BuildKit frontend pragma every generated Dockerfile starts with.
pub const SYNTAX: &str = "docker/dockerfile:1.4";

/// A single Dockerfile instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// `#syntax=<frontend>`
    Syntax(String),
    /// `FROM <image> [AS <alias>]`
    From {
        image: String,
        alias: Option<String>,
    },
    /// `ENV <key>=<value>`
    Env { key: String, value: String },
    /// `RUN [<mount>...] <command>`. The command may carry `\`-continued lines.
    Run {
        mounts: Vec<String>,
        command: String,
    },
    /// `COPY [--from=<stage>] [--link] <src> <dst>`
    Copy {
        from: Option<String>,
        link: bool,
        src: String,
        dst: String,
    },
    /// `WORKDIR <path>`
    Workdir(String),
    /// `EXPOSE <port>`
    Expose(u16),
    /// `ENTRYPOINT [...]`
    Entrypoint(Vec<String>),
    /// `CMD [...]`
    Cmd(Vec<String>),
}

impl Instruction {
    pub fn syntax() -> Self {
        Self::Syntax(SYNTAX.to_owned())
    }

    pub fn from_image(image: impl Into<String>) -> Self {
        Self::From {
            image: image.into(),
            alias: None,
        }
    }

    pub fn from_stage(image: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::From {
            image: image.into(),
            alias: Some(alias.into()),
        }
    }

    pub fn env(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Env {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn run(command: impl Into<String>) -> Self {
        Self::Run {
            mounts: Vec::new(),
            command: command.into(),
        }
    }

    pub fn run_with_mount(mount: impl Into<String>, command: impl Into<String>) -> Self {
        Self::Run {
            mounts: vec![mount.into()],
            command: command.into(),
        }
    }

    pub fn copy(src: impl Into<String>, dst: impl Into<String>) -> Self {
        Self::Copy {
            from: None,
            link: false,
            src: src.into(),
            dst: dst.into(),
        }
    }

    pub fn copy_from(stage: impl Into<String>, src: impl Into<String>, dst: impl Into<String>) -> Self {
        Self::Copy {
            from: Some(stage.into()),
            link: true,
            src: src.into(),
            dst: dst.into(),
        }
    }

    pub fn is_from(&self) -> bool {
        matches!(self, Self::From { .. })
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax(frontend) => write!(f, "#syntax={frontend}"),
            Self::From { image, alias: None } => write!(f, "FROM {image}"),
            Self::From {
                image,
                alias: Some(alias),
            } => write!(f, "FROM {image} AS {alias}"),
            Self::Env { key, value } => write!(f, "ENV {key}={value}"),
            Self::Run { mounts, command } => {
                f.write_str("RUN ")?;
                for mount in mounts {
                    write!(f, "{mount} ")?;
                }
                f.write_str(command)
            }
            Self::Copy {
                from,
                link,
                src,
                dst,
            } => {
                f.write_str("COPY ")?;
                if let Some(stage) = from {
                    write!(f, "--from={stage} ")?;
                }
                if *link {
                    f.write_str("--link ")?;
                }
                write!(f, "{src} {dst}")
            }
            Self::Workdir(path) => write!(f, "WORKDIR {path}"),
            Self::Expose(port) => write!(f, "EXPOSE {port}"),
            Self::Entrypoint(args) => write!(f, "ENTRYPOINT {}", exec_form(args)),
            Self::Cmd(args) => write!(f, "CMD {}", exec_form(args)),
        }
    }
}

/// `["a", "b"]` with each argument JSON-quoted.
fn exec_form(args: &[String]) -> String {
    let quoted: Vec<String> = args
        .iter()
        .map(|a| serde_json::Value::String(a.clone()).to_string())
        .collect();
    format!("[{}]", quoted.join(", "))
}

/// Renders instructions to Dockerfile text with no blank lines.
pub fn render(instructions: &[Instruction]) -> String {
    let chunks: Vec<String> = instructions.iter().map(ToString::to_string).collect();
    join_without_blank_lines(&chunks)
}

/// Splits every chunk into lines, drops blank lines, and joins the rest
/// with `\n`. Chunks that are empty or pure whitespace contribute nothing.
pub fn join_without_blank_lines<S: AsRef<str>>(chunks: &[S]) -> String {
    chunks
        .iter()
        .flat_map(|chunk| chunk.as_ref().split('\n'))
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
