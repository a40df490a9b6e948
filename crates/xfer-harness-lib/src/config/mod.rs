//! Run configuration for the harness
//!
//! A [`RunConfig`] is resolved exactly once per invocation from three layers,
//! later layers winning:
//!
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. command-line overrides
//!
//! Each layer is a [`PartialConfig`] so the file and the CLI share a shape.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_SOURCE: &str = "/tmp/cio_example_in_data";
pub const DEFAULT_TARGET: &str = "/tmp/out";
pub const DEFAULT_PORT: u16 = 23452;
pub const DEFAULT_COUNT: usize = 100;
pub const DEFAULT_SIZE_MB: u64 = 100;
pub const DEFAULT_BUILD_DIR: &str = ".build";
pub const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Name of the log directory created under the build directory when no
/// explicit log directory is configured.
pub const DEFAULT_LOG_SUBDIR: &str = "logs";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Named behaviour variant of the client/server pair.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Strictly alternating request/response
    Turn,
    /// Concurrent bidirectional streaming
    #[default]
    Duplex,
}

impl TransferMode {
    /// Value passed to the executables' `-m` flag
    pub fn as_arg(&self) -> &'static str {
        match self {
            TransferMode::Turn => "turn",
            TransferMode::Duplex => "duplex",
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

/// One configuration layer. Unset fields fall through to the layer below.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    pub source: Option<PathBuf>,
    pub target: Option<PathBuf>,
    pub port: Option<u16>,
    pub count: Option<usize>,
    pub size_mb: Option<u64>,
    pub project_dir: Option<PathBuf>,
    pub build_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub mode: Option<TransferMode>,
    pub ready_timeout_ms: Option<u64>,
    pub skip_build: Option<bool>,
}

impl PartialConfig {
    /// Load a layer from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Overlay `other` on top of `self`; fields set in `other` win.
    pub fn merge(self, other: PartialConfig) -> PartialConfig {
        PartialConfig {
            source: other.source.or(self.source),
            target: other.target.or(self.target),
            port: other.port.or(self.port),
            count: other.count.or(self.count),
            size_mb: other.size_mb.or(self.size_mb),
            project_dir: other.project_dir.or(self.project_dir),
            build_dir: other.build_dir.or(self.build_dir),
            log_dir: other.log_dir.or(self.log_dir),
            mode: other.mode.or(self.mode),
            ready_timeout_ms: other.ready_timeout_ms.or(self.ready_timeout_ms),
            skip_build: other.skip_build.or(self.skip_build),
        }
    }
}

/// Immutable configuration for a single harness run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Directory holding the generated fixtures (what the client sends)
    pub source: PathBuf,
    /// Directory the server writes received files into
    pub target: PathBuf,
    pub port: u16,
    /// Number of fixture files
    pub count: usize,
    /// Size of each fixture file in MiB
    pub size_mb: u64,
    /// Root of the native project handed to the build system
    pub project_dir: PathBuf,
    /// Absolute build directory
    pub build_dir: PathBuf,
    /// Absolute directory for per-run logs, the pid file and the report
    pub log_dir: PathBuf,
    pub mode: TransferMode,
    /// Readiness probe budget in milliseconds, 0 disables the probe
    pub ready_timeout_ms: u64,
    pub skip_build: bool,
}

impl RunConfig {
    /// Resolve defaults, an optional config file and CLI overrides.
    ///
    /// `cwd` is used as the project directory when none is configured.
    pub fn resolve(
        config_file: Option<&Path>,
        overrides: PartialConfig,
        cwd: &Path,
    ) -> Result<Self, ConfigError> {
        let file_layer = match config_file {
            Some(path) => PartialConfig::from_file(path)?,
            None => PartialConfig::default(),
        };

        Self::from_partial(file_layer.merge(overrides), cwd)
    }

    /// Fill unset fields with defaults and validate.
    pub fn from_partial(partial: PartialConfig, cwd: &Path) -> Result<Self, ConfigError> {
        let project_dir = absolutize(
            cwd,
            &partial.project_dir.unwrap_or_else(|| cwd.to_path_buf()),
        );
        let build_dir = absolutize(
            &project_dir,
            &partial
                .build_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BUILD_DIR)),
        );
        let log_dir = match partial.log_dir {
            Some(dir) => absolutize(cwd, &dir),
            None => build_dir.join(DEFAULT_LOG_SUBDIR),
        };

        let config = RunConfig {
            source: absolutize(
                cwd,
                &partial.source.unwrap_or_else(|| PathBuf::from(DEFAULT_SOURCE)),
            ),
            target: absolutize(
                cwd,
                &partial.target.unwrap_or_else(|| PathBuf::from(DEFAULT_TARGET)),
            ),
            port: partial.port.unwrap_or(DEFAULT_PORT),
            count: partial.count.unwrap_or(DEFAULT_COUNT),
            size_mb: partial.size_mb.unwrap_or(DEFAULT_SIZE_MB),
            project_dir,
            build_dir,
            log_dir,
            mode: partial.mode.unwrap_or_default(),
            ready_timeout_ms: partial.ready_timeout_ms.unwrap_or(DEFAULT_READY_TIMEOUT_MS),
            skip_build: partial.skip_build.unwrap_or(false),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.count == 0 {
            return Err(ConfigError::Invalid("file count must be at least 1".into()));
        }
        if self.size_mb == 0 {
            return Err(ConfigError::Invalid("file size must be at least 1 MB".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".into()));
        }
        if self.source == self.target {
            return Err(ConfigError::Invalid(format!(
                "source and target must differ (both are {})",
                self.source.display()
            )));
        }
        // The target is wiped before each run; it must not contain the fixtures.
        if self.source.starts_with(&self.target) || self.target.starts_with(&self.source) {
            return Err(ConfigError::Invalid(format!(
                "source {} and target {} must not be nested",
                self.source.display(),
                self.target.display()
            )));
        }
        Ok(())
    }

    /// Address the server binds to
    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    /// Address the client connects to
    pub fn connect_addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Expected size of every fixture file in bytes
    pub fn file_size_bytes(&self) -> u64 {
        self.size_mb * 1024 * 1024
    }
}

fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
