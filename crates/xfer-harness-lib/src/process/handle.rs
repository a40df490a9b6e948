//! A single managed child process

use super::{describe_status, ProcessError, ProcessState, Role};
use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::ffi::OsStr;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

/// Log file receiving a child's stdout and stderr.
///
/// Created fresh (truncated) for every run and closed exactly once.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    file: Option<File>,
}

impl LogSink {
    pub fn create(path: &Path) -> Result<Self, ProcessError> {
        let file = File::create(path).map_err(|source| ProcessError::LogSink {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Handles for the child's stdout and stderr
    fn stdio(&self) -> Result<(Stdio, Stdio), ProcessError> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| ProcessError::LogSinkClosed(self.path.clone()))?;
        let err = |source| ProcessError::LogSink {
            path: self.path.clone(),
            source,
        };
        let out = file.try_clone().map_err(err)?;
        let errs = file.try_clone().map_err(err)?;
        Ok((Stdio::from(out), Stdio::from(errs)))
    }

    /// Flush and release the file. A second call is an error.
    pub fn close(&mut self) -> Result<(), ProcessError> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| ProcessError::LogSinkClosed(self.path.clone()))?;
        file.flush()
            .and_then(|_| file.sync_all())
            .map_err(|source| ProcessError::LogSink {
                path: self.path.clone(),
                source,
            })
    }
}

/// An external process owned by the harness.
///
/// Dropping a handle that has not been reaped kills and reaps the process,
/// so no exit path leaves it running.
#[derive(Debug)]
pub struct ProcessHandle {
    role: Role,
    program: PathBuf,
    child: Child,
    state: ProcessState,
    log: LogSink,
    exit: Option<ExitStatus>,
}

impl ProcessHandle {
    /// Spawn `program` with stdout and stderr redirected to `log_path`.
    ///
    /// Returns as soon as the OS process exists.
    pub fn spawn<I, S>(
        role: Role,
        program: &Path,
        args: I,
        log_path: &Path,
    ) -> Result<Self, ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let log = LogSink::create(log_path)?;
        let (stdout, stderr) = log.stdio()?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        debug!("Spawning {}: {:?}", role, command);

        let child = command.spawn().map_err(|source| ProcessError::Spawn {
            role,
            program: program.to_path_buf(),
            source,
        })?;

        let mut handle = Self {
            role,
            program: program.to_path_buf(),
            child,
            state: ProcessState::NotStarted,
            log,
            exit: None,
        };
        handle.advance(ProcessState::Running)?;
        Ok(handle)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    /// Exit status, once the process has been observed to exit
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    fn advance(&mut self, to: ProcessState) -> Result<(), ProcessError> {
        if !self.state.can_advance_to(to) {
            return Err(ProcessError::IllegalTransition {
                role: self.role,
                from: self.state,
                to,
            });
        }
        debug!("{} {:?} -> {:?}", self.role, self.state, to);
        self.state = to;
        Ok(())
    }

    /// Non-blocking check for exit. Does not change the lifecycle state.
    pub fn try_exited(&mut self) -> Result<Option<ExitStatus>, ProcessError> {
        if self.exit.is_none() {
            self.exit = self
                .child
                .try_wait()
                .map_err(|source| ProcessError::Wait {
                    role: self.role,
                    source,
                })?;
        }
        Ok(self.exit)
    }

    /// Ask the process to shut down gracefully with SIGTERM.
    ///
    /// Returns whether a signal was sent; a process already observed to have
    /// exited is not signaled.
    pub fn terminate(&mut self) -> Result<bool, ProcessError> {
        if self.state == ProcessState::Reaped {
            return Err(ProcessError::AlreadyReaped(self.role));
        }
        self.advance(ProcessState::Terminating)?;

        if self.try_exited()?.is_some() {
            debug!("{} already exited, not signaling", self.role);
            return Ok(false);
        }

        let pid = self.pid();
        match kill(pid, Signal::SIGTERM) {
            Ok(()) => Ok(true),
            Err(nix::Error::ESRCH) => Ok(false),
            Err(source) => Err(ProcessError::Signal {
                role: self.role,
                pid: pid.as_raw(),
                source,
            }),
        }
    }

    /// Block until the process exits, then flush and close its log.
    ///
    /// A process that exits on its own passes through `Terminating` here.
    /// Waiting twice is an error.
    pub fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        match self.state {
            ProcessState::Reaped => return Err(ProcessError::AlreadyReaped(self.role)),
            ProcessState::Running => self.advance(ProcessState::Terminating)?,
            _ => {}
        }

        let status = match self.exit {
            Some(status) => status,
            None => self.child.wait().map_err(|source| ProcessError::Wait {
                role: self.role,
                source,
            })?,
        };
        self.exit = Some(status);
        debug!("{} exited with {}", self.role, describe_status(&status));

        let closed = self.log.close();
        self.advance(ProcessState::Reaped)?;
        closed?;

        Ok(status)
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.state == ProcessState::Reaped {
            return;
        }
        warn!(
            "{} (pid {}) dropped while {:?}; killing it",
            self.role,
            self.child.id(),
            self.state
        );
        let _ = self.child.kill();
        let _ = self.child.wait();
        if self.log.is_open() {
            let _ = self.log.close();
        }
    }
}
