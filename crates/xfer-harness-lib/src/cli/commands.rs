use crate::config::{PartialConfig, TransferMode};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// xfer-harness - End-to-end harness for the TCP file-transfer pair
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Optional log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// The subcommand to execute; a bare invocation runs the full pipeline
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Run)
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Build, generate fixtures, run server and client, verify (default)
    Run,

    /// Build the server and client executables only
    Build,

    /// Reconcile the fixture directory only
    Generate,

    /// Compare the source and target directories only
    Verify,
}

/// Options shared by every subcommand. Anything left unset falls back to
/// the config file, then to the built-in defaults.
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// TOML file with harness options
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Path to the initial data folder
    #[arg(short = 'p', long = "path", value_name = "DIR", global = true)]
    pub source: Option<PathBuf>,

    /// Folder the server writes received files into
    #[arg(short = 't', long, value_name = "DIR", global = true)]
    pub target: Option<PathBuf>,

    /// TCP port the server listens on
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Number of files to generate
    #[arg(short, long, global = true)]
    pub count: Option<usize>,

    /// Size of each file in MB
    #[arg(short, long, value_name = "MB", global = true)]
    pub size: Option<u64>,

    /// Root of the native project (default: current directory)
    #[arg(long, value_name = "DIR", global = true)]
    pub project_dir: Option<PathBuf>,

    /// Build directory relative to the project root
    #[arg(short, long, value_name = "DIR", global = true)]
    pub build_dir: Option<PathBuf>,

    /// Directory for process logs, the pid file and the run report
    #[arg(long, value_name = "DIR", global = true)]
    pub log_dir: Option<PathBuf>,

    /// Transfer mode passed to both executables
    #[arg(short, long, value_enum, global = true)]
    pub mode: Option<TransferMode>,

    /// How long to wait for the server to accept connections (0 disables)
    #[arg(long, value_name = "MS", global = true)]
    pub ready_timeout_ms: Option<u64>,

    /// Use previously built executables
    #[arg(long, global = true)]
    pub skip_build: bool,
}

impl From<&ConfigArgs> for PartialConfig {
    fn from(args: &ConfigArgs) -> Self {
        PartialConfig {
            source: args.source.clone(),
            target: args.target.clone(),
            port: args.port,
            count: args.count,
            size_mb: args.size,
            project_dir: args.project_dir.clone(),
            build_dir: args.build_dir.clone(),
            log_dir: args.log_dir.clone(),
            mode: args.mode,
            ready_timeout_ms: args.ready_timeout_ms,
            // A flag can only turn skipping on; leave the file's choice otherwise.
            skip_build: args.skip_build.then_some(true),
        }
    }
}
