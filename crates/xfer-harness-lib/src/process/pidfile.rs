//! Harness-owned pid marker for the server.
//!
//! The harness writes the server's pid after spawning it and removes the file
//! once the server is reaped. A file still present at the next start names a
//! server the previous run failed to clean up.

use super::ProcessError;
use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const TERM_GRACE: Duration = Duration::from_secs(5);
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Linux truncates command names to this many bytes
const COMM_LEN: usize = 15;

#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn err(&self) -> impl FnOnce(std::io::Error) -> ProcessError + '_ {
        move |source| ProcessError::PidFile {
            path: self.path.clone(),
            source,
        }
    }

    /// Recorded pid, if the file exists and holds one
    pub fn read(&self) -> Result<Option<Pid>, ProcessError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content
                .trim()
                .parse::<i32>()
                .ok()
                .filter(|pid| *pid > 0)
                .map(Pid::from_raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.err()(e)),
        }
    }

    pub fn write(&self, pid: Pid) -> Result<(), ProcessError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(self.err())?;
        }
        fs::write(&self.path, format!("{}\n", pid)).map_err(self.err())
    }

    /// Delete the file; a missing file is fine.
    pub fn remove(&self) -> Result<(), ProcessError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.err()(e)),
        }
    }

    /// Terminate the process named by the file if it is still a live
    /// `expected_name`, then remove the file.
    ///
    /// Returns the pid that was stopped, if any.
    pub fn evict_stale(&self, expected_name: &str) -> Result<Option<Pid>, ProcessError> {
        let Some(pid) = self.read()? else {
            self.remove()?;
            return Ok(None);
        };

        if !is_alive(pid) || !command_matches(pid, expected_name) {
            debug!("Pid file {:?} names no live {}; discarding", self.path, expected_name);
            self.remove()?;
            return Ok(None);
        }

        info!("Stopping previous {} instance (pid {})", expected_name, pid);
        signal_quietly(pid, Signal::SIGTERM);
        if !wait_gone(pid, TERM_GRACE) {
            warn!("Pid {} ignored SIGTERM; sending SIGKILL", pid);
            signal_quietly(pid, Signal::SIGKILL);
            if !wait_gone(pid, KILL_GRACE) {
                return Err(ProcessError::StaleInstance(pid.as_raw()));
            }
        }

        self.remove()?;
        Ok(Some(pid))
    }
}

fn signal_quietly(pid: Pid, signal: Signal) {
    if let Err(e) = kill(pid, signal) {
        debug!("kill({}, {:?}) failed: {}", pid, signal, e);
    }
}

fn wait_gone(pid: Pid, grace: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < grace {
        if !is_alive(pid) {
            return true;
        }
        thread::sleep(POLL_INTERVAL);
    }
    !is_alive(pid)
}

/// A zombie has already exited; only its parent's reaping is outstanding.
fn is_alive(pid: Pid) -> bool {
    kill(pid, None).is_ok() && !is_zombie(pid)
}

fn is_zombie(pid: Pid) -> bool {
    fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            let after_comm = &stat[stat.rfind(')')? + 1..];
            after_comm.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

/// Compare the process's command name. Without `/proc` the pid file is
/// trusted as is.
fn command_matches(pid: Pid, expected_name: &str) -> bool {
    if !Path::new("/proc/self").exists() {
        return true;
    }
    let expected: String = expected_name.chars().take(COMM_LEN).collect();
    fs::read_to_string(format!("/proc/{}/comm", pid))
        .map(|comm| comm.trim_end() == expected)
        .unwrap_or(false)
}
