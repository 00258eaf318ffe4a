/// Target platform the Python requirements are resolved for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// The platform this process runs on.
    pub fn host() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn linux_amd64() -> Self {
        Self::new("linux", "x86_64")
    }

    pub fn is_linux(&self) -> bool {
        self.os == "linux"
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::host()
    }
}
