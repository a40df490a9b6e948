//! Lifecycle management for the server and client processes
//!
//! Each external process is owned by a [`ProcessHandle`] that walks the state
//! machine `NotStarted -> Running -> Terminating -> Reaped`. The
//! [`ProcessManager`] owns both handles for the whole run and is the only
//! thing allowed to signal or reap them.
//!
//! ## Modules
//!
//! - [`handle`]: one child process plus its exclusively owned log sink
//! - [`manager`]: start, synchronize and tear down the server/client pair
//! - [`pidfile`]: the harness-owned marker used to evict a previous server

pub mod handle;
pub mod manager;
pub mod pidfile;

pub use handle::{LogSink, ProcessHandle};
pub use manager::{Completion, InterruptHandle, LifecycleEvent, ProcessManager};
pub use pidfile::PidFile;

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Which side of the transfer a process plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => f.write_str("server"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// Lifecycle state of a managed process. `Reaped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Terminating,
    Reaped,
}

impl ProcessState {
    /// Whether `self -> to` is a legal single step
    pub fn can_advance_to(self, to: ProcessState) -> bool {
        matches!(
            (self, to),
            (ProcessState::NotStarted, ProcessState::Running)
                | (ProcessState::Running, ProcessState::Terminating)
                | (ProcessState::Terminating, ProcessState::Reaped)
        )
    }
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn {role} executable {program}: {source}")]
    Spawn {
        role: Role,
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("The {0} has already been started")]
    AlreadyStarted(Role),

    #[error("The {0} has not been started")]
    NotStarted(Role),

    #[error("The {0} process has already been reaped")]
    AlreadyReaped(Role),

    #[error("Illegal {role} state transition {from:?} -> {to:?}")]
    IllegalTransition {
        role: Role,
        from: ProcessState,
        to: ProcessState,
    },

    #[error("Refusing to stop the server while the client is still running")]
    ClientStillRunning,

    #[error("Failed to signal {role} (pid {pid}): {source}")]
    Signal {
        role: Role,
        pid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to wait for {role}: {source}")]
    Wait {
        role: Role,
        #[source]
        source: std::io::Error,
    },

    #[error("Log sink error at {path}: {source}")]
    LogSink {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Log sink {0} was already closed")]
    LogSinkClosed(PathBuf),

    #[error("Pid file error at {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Port {addr} is already in use by a process the harness does not own: {source}")]
    PortInUse {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Previous server instance (pid {0}) did not exit")]
    StaleInstance(i32),

    #[error("Server exited before accepting connections ({0})")]
    ServerExitedEarly(String),

    #[error("Server did not accept connections on {addr} within {waited:?}")]
    ServerNotReady { addr: String, waited: Duration },
}

/// Human-readable exit status: `exit code N` or `signal N`
pub fn describe_status(status: &ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {}", code),
        (None, Some(signal)) => format!("signal {}", signal),
        (None, None) => "unknown status".to_string(),
    }
}
