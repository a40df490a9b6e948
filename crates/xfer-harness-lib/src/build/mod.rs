//! Build orchestration for the executables under test
//!
//! Drives an external CMake build: configure, then compile, each as one
//! child process with the build directory as its explicit working directory.
//! The harness's own working directory is never changed.

use crate::config::RunConfig;
use log::{debug, info};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use thiserror::Error;

/// The build-system driver that must be on PATH
pub const BUILD_TOOL: &str = "cmake";

/// Cache marker removed before every configure to force a clean configuration
pub const CACHE_FILE: &str = "CMakeCache.txt";

/// Define that enables the example executables in the native project
pub const EXAMPLES_DEFINE: &str = "-DwithExamples=ON";

pub const SERVER_EXE: &str = "tcp_server";
pub const CLIENT_EXE: &str = "tcp_client";

/// File in the log directory that receives all build output
pub const BUILD_LOG: &str = "build.log";

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Build tool not found on PATH: {0}")]
    BuildToolMissing(String),

    #[error("No build backend found (tried: ninja, make)")]
    NoBuildBackend,

    #[error("Build step '{step}' failed with {status}")]
    BuildFailed { step: String, status: ExitStatus },

    #[error("Expected build artifact missing: {0}")]
    ArtifactMissing(PathBuf),

    #[error("IO error during build at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> BuildError + '_ {
    move |source| BuildError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Locates external tools. Swapped out in tests.
pub trait Toolchain {
    fn locate(&self, tool: &str) -> Option<PathBuf>;
}

/// Looks tools up on the process PATH
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemToolchain;

impl Toolchain for SystemToolchain {
    fn locate(&self, tool: &str) -> Option<PathBuf> {
        which::which(tool).ok()
    }
}

/// Native build backends, in preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Ninja,
    Make,
}

impl Backend {
    pub const PREFERENCE: [Backend; 2] = [Backend::Ninja, Backend::Make];

    /// Executable driving this backend
    pub fn tool(&self) -> &'static str {
        match self {
            Backend::Ninja => "ninja",
            Backend::Make => "make",
        }
    }

    /// CMake generator name
    pub fn generator(&self) -> &'static str {
        match self {
            Backend::Ninja => "Ninja",
            Backend::Make => "Unix Makefiles",
        }
    }

    /// First available backend
    pub fn select(toolchain: &impl Toolchain) -> Result<(Backend, PathBuf), BuildError> {
        Self::PREFERENCE
            .iter()
            .find_map(|backend| toolchain.locate(backend.tool()).map(|path| (*backend, path)))
            .ok_or(BuildError::NoBuildBackend)
    }
}

/// Paths of the two executables under test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executables {
    pub server: PathBuf,
    pub client: PathBuf,
}

impl Executables {
    /// Where a build in `build_dir` places the executables
    pub fn in_build_dir(build_dir: &Path) -> Self {
        let bin = build_dir.join("bin");
        Self {
            server: bin.join(SERVER_EXE),
            client: bin.join(CLIENT_EXE),
        }
    }

    /// Fail unless both executables exist
    pub fn ensure_present(self) -> Result<Self, BuildError> {
        for path in [&self.server, &self.client] {
            if !path.is_file() {
                return Err(BuildError::ArtifactMissing(path.clone()));
            }
        }
        Ok(self)
    }
}

/// Runs configure and compile for the native project
pub struct BuildOrchestrator<T: Toolchain> {
    toolchain: T,
}

impl BuildOrchestrator<SystemToolchain> {
    pub fn new() -> Self {
        Self::with_toolchain(SystemToolchain)
    }
}

impl Default for BuildOrchestrator<SystemToolchain> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Toolchain> BuildOrchestrator<T> {
    pub fn with_toolchain(toolchain: T) -> Self {
        Self { toolchain }
    }

    /// Configure and build, returning the executables.
    ///
    /// Any failure aborts before later steps run.
    pub fn build(&self, config: &RunConfig) -> Result<Executables, BuildError> {
        let cmake = self
            .toolchain
            .locate(BUILD_TOOL)
            .ok_or_else(|| BuildError::BuildToolMissing(BUILD_TOOL.to_string()))?;

        let build_dir = &config.build_dir;
        fs::create_dir_all(build_dir).map_err(io_at(build_dir))?;

        let cache = build_dir.join(CACHE_FILE);
        if cache.exists() {
            debug!("Removing stale build cache {:?}", cache);
            fs::remove_file(&cache).map_err(io_at(&cache))?;
        }

        let (backend, backend_path) = Backend::select(&self.toolchain)?;
        info!(
            "Building in {:?} with {} backend",
            build_dir,
            backend.tool()
        );

        fs::create_dir_all(&config.log_dir).map_err(io_at(&config.log_dir))?;
        let log_path = config.log_dir.join(BUILD_LOG);
        let log = File::create(&log_path).map_err(io_at(&log_path))?;

        let mut configure = Command::new(&cmake);
        configure
            .arg("-G")
            .arg(backend.generator())
            .arg(EXAMPLES_DEFINE)
            .arg(&config.project_dir);
        run_step("configure", configure, build_dir, &log, &log_path)?;

        let compile = Command::new(&backend_path);
        run_step(backend.tool(), compile, build_dir, &log, &log_path)?;

        Executables::in_build_dir(build_dir).ensure_present()
    }
}

fn run_step(
    step: &str,
    mut command: Command,
    cwd: &Path,
    log: &File,
    log_path: &Path,
) -> Result<(), BuildError> {
    debug!("Running build step '{}': {:?}", step, command);

    let stdout = log.try_clone().map_err(io_at(log_path))?;
    let stderr = log.try_clone().map_err(io_at(log_path))?;
    let status = command
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .status()
        .map_err(io_at(cwd))?;

    if status.success() {
        Ok(())
    } else {
        Err(BuildError::BuildFailed {
            step: step.to_string(),
            status,
        })
    }
}
