//! Interpreter resolution for the backend service.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Linux
        }
    }

    pub fn is_windows(self) -> bool {
        self == Self::Windows
    }

    /// Services are wrapped in a shell only on Windows, where `npm` is a
    /// `.cmd` script and the venv launcher expects `cmd` semantics.
    pub fn uses_shell(self) -> bool {
        self.is_windows()
    }

    pub fn npm(self) -> &'static str {
        if self.is_windows() {
            "npm.cmd"
        } else {
            "npm"
        }
    }

    pub fn fallback_interpreter(self) -> &'static str {
        if self.is_windows() {
            "python"
        } else {
            "python3"
        }
    }
}

const VENV_DIRS: [&str; 2] = [".venv", "venv"];

/// Virtual-environment interpreter paths under `service_dir`, most preferred
/// first.
pub fn interpreter_candidates(service_dir: &Path, platform: Platform) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for venv in VENV_DIRS {
        let root = service_dir.join(venv);
        if platform.is_windows() {
            out.push(root.join("Scripts").join("python.exe"));
            out.push(root.join("Scripts").join("python3.exe"));
        } else {
            out.push(root.join("bin").join("python3"));
            out.push(root.join("bin").join("python"));
        }
    }
    out
}

/// Returns the first existing venv interpreter, or the bare system
/// interpreter name to be found on `PATH`. Never fails; a bad fallback shows
/// up later as a spawn failure.
pub fn resolve(service_dir: &Path, platform: Platform) -> PathBuf {
    for candidate in interpreter_candidates(service_dir, platform) {
        if candidate.is_file() {
            log::debug!(target: "shell", "using interpreter {}", candidate.display());
            return candidate;
        }
    }
    let fallback = platform.fallback_interpreter();
    log::warn!(
        target: "shell",
        "no virtual environment under {}, falling back to `{fallback}` on PATH",
        service_dir.display()
    );
    PathBuf::from(fallback)
}
