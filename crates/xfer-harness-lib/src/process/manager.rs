//! Orchestration of the server/client pair
//!
//! Ordering invariant: the server is never signaled before the client has
//! been reaped. An in-flight transfer therefore finishes or fails on its own
//! terms instead of losing its peer halfway through.

use super::{describe_status, PidFile, ProcessError, ProcessHandle, ProcessState, Role};
use crate::build::Executables;
use crate::config::RunConfig;
use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::fs;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

pub const SERVER_LOG: &str = "tcp_server.log";
pub const CLIENT_LOG: &str = "tcp_client.log";
pub const SERVER_PID_FILE: &str = "tcp_server.pid";

const PROBE_INTERVAL: Duration = Duration::from_millis(50);
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// One entry in the manager's lifecycle journal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Spawned { role: Role, pid: i32 },
    Ready { role: Role },
    Signaled { role: Role },
    Exited { role: Role, status: ExitStatus },
    Reaped { role: Role },
}

/// Exit statuses collected by [`ProcessManager::wait_for_completion`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub client: ExitStatus,
    pub server: Option<ExitStatus>,
}

impl Completion {
    pub fn client_succeeded(&self) -> bool {
        self.client.success()
    }
}

/// Pids of still-running children, shared with the interrupt handler.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    live: Arc<Mutex<Vec<(Role, Pid)>>>,
}

impl InterruptHandle {
    fn lock(&self) -> MutexGuard<'_, Vec<(Role, Pid)>> {
        // A poisoned registry still holds valid pids.
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, role: Role, pid: Pid) {
        self.lock().push((role, pid));
    }

    fn unregister(&self, pid: Pid) {
        self.lock().retain(|(_, p)| *p != pid);
    }

    /// Pids currently registered
    pub fn live(&self) -> Vec<(Role, Pid)> {
        self.lock().clone()
    }

    /// Send SIGTERM to every registered child, client first.
    pub fn terminate_all(&self) {
        let mut live = self.live();
        live.sort_by_key(|(role, _)| *role == Role::Server);
        for (role, pid) in live {
            warn!("Interrupted: terminating {} (pid {})", role, pid);
            let _ = kill(pid, Signal::SIGTERM);
        }
    }
}

/// Owns the server and client handles for the duration of a run
#[derive(Debug)]
pub struct ProcessManager {
    log_dir: PathBuf,
    server: Option<ProcessHandle>,
    client: Option<ProcessHandle>,
    pid_file: PidFile,
    journal: Vec<LifecycleEvent>,
    interrupt: InterruptHandle,
}

impl ProcessManager {
    pub fn new(log_dir: &Path) -> Self {
        Self::with_interrupt(log_dir, InterruptHandle::default())
    }

    /// Register spawned children with an interrupt handle created earlier,
    /// e.g. one already installed in a signal handler.
    pub fn with_interrupt(log_dir: &Path, interrupt: InterruptHandle) -> Self {
        Self {
            log_dir: log_dir.to_path_buf(),
            server: None,
            client: None,
            pid_file: PidFile::new(log_dir.join(SERVER_PID_FILE)),
            journal: Vec::new(),
            interrupt,
        }
    }

    pub fn journal(&self) -> &[LifecycleEvent] {
        &self.journal
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn server(&self) -> Option<&ProcessHandle> {
        self.server.as_ref()
    }

    pub fn client(&self) -> Option<&ProcessHandle> {
        self.client.as_ref()
    }

    pub fn pid_file(&self) -> &PidFile {
        &self.pid_file
    }

    fn record(&mut self, event: LifecycleEvent) {
        debug!("lifecycle: {:?}", event);
        self.journal.push(event);
    }

    fn ensure_log_dir(&self) -> Result<(), ProcessError> {
        fs::create_dir_all(&self.log_dir).map_err(|source| ProcessError::LogSink {
            path: self.log_dir.clone(),
            source,
        })
    }

    /// Stop a server instance named by the pid file, if one is still alive.
    ///
    /// [`start_server`](Self::start_server) does this itself; calling it
    /// earlier lets the caller prepare directories the old instance could
    /// still have written to.
    pub fn evict_previous_server(
        &self,
        executables: &Executables,
    ) -> Result<Option<Pid>, ProcessError> {
        let exe_name = executables
            .server
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let evicted = self.pid_file.evict_stale(&exe_name)?;
        if let Some(pid) = evicted {
            info!("Evicted previous server instance (pid {})", pid);
        }
        Ok(evicted)
    }

    /// Launch the server after evicting any instance a previous run left
    /// behind and checking that nothing else holds the port.
    ///
    /// Returns once the process is spawned and, unless the readiness probe is
    /// disabled, accepting connections on the configured port.
    pub fn start_server(
        &mut self,
        config: &RunConfig,
        executables: &Executables,
    ) -> Result<(), ProcessError> {
        if self.server.is_some() {
            return Err(ProcessError::AlreadyStarted(Role::Server));
        }
        self.ensure_log_dir()?;
        self.evict_previous_server(executables)?;
        ensure_port_free(&config.bind_addr())?;

        info!("Starting server on port {}", config.port);
        let handle = ProcessHandle::spawn(
            Role::Server,
            &executables.server,
            server_args(config),
            &self.log_dir.join(SERVER_LOG),
        )?;
        let pid = handle.pid();
        self.interrupt.register(Role::Server, pid);
        self.server = Some(handle);
        self.record(LifecycleEvent::Spawned {
            role: Role::Server,
            pid: pid.as_raw(),
        });

        let readiness = self
            .pid_file
            .write(pid)
            .and_then(|_| self.await_server_ready(config));
        if let Err(e) = readiness {
            warn!("Server failed to start: {}", e);
            self.abort();
            return Err(e);
        }

        Ok(())
    }

    fn await_server_ready(&mut self, config: &RunConfig) -> Result<(), ProcessError> {
        if config.ready_timeout_ms == 0 {
            debug!("Readiness probe disabled");
            return Ok(());
        }
        let addr = config.connect_addr();
        let timeout = Duration::from_millis(config.ready_timeout_ms);
        let server = self
            .server
            .as_mut()
            .ok_or(ProcessError::NotStarted(Role::Server))?;

        wait_until_ready(server, &addr, timeout)?;
        self.record(LifecycleEvent::Ready { role: Role::Server });
        Ok(())
    }

    /// Launch the client. A spawn failure tears the server down before the
    /// error is returned.
    pub fn start_client(
        &mut self,
        config: &RunConfig,
        executables: &Executables,
    ) -> Result<(), ProcessError> {
        if self.client.is_some() {
            return Err(ProcessError::AlreadyStarted(Role::Client));
        }
        let spawned = self.ensure_log_dir().and_then(|_| {
            ProcessHandle::spawn(
                Role::Client,
                &executables.client,
                client_args(config),
                &self.log_dir.join(CLIENT_LOG),
            )
        });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Client failed to start: {}", e);
                self.abort();
                return Err(e);
            }
        };

        info!("Started client (pid {})", handle.pid());
        let pid = handle.pid();
        self.interrupt.register(Role::Client, pid);
        self.client = Some(handle);
        self.record(LifecycleEvent::Spawned {
            role: Role::Client,
            pid: pid.as_raw(),
        });
        Ok(())
    }

    /// Block until the client exits, then stop the server and wait for it.
    ///
    /// A non-zero client exit is reported in the [`Completion`], not as an
    /// error.
    pub fn wait_for_completion(&mut self) -> Result<Completion, ProcessError> {
        let client_status = self.reap(Role::Client)?;
        info!("Client finished with {}", describe_status(&client_status));

        let server_status = if self.server.is_some() {
            let status = self.stop_server()?;
            info!("Server finished with {}", describe_status(&status));
            Some(status)
        } else {
            None
        };

        Ok(Completion {
            client: client_status,
            server: server_status,
        })
    }

    fn slot(&mut self, role: Role) -> &mut Option<ProcessHandle> {
        match role {
            Role::Server => &mut self.server,
            Role::Client => &mut self.client,
        }
    }

    /// Wait for `role` to exit and release its handle.
    fn reap(&mut self, role: Role) -> Result<ExitStatus, ProcessError> {
        let handle = self.slot(role).as_mut().ok_or(ProcessError::NotStarted(role))?;
        let pid = handle.pid();
        let status = handle.wait()?;

        self.slot(role).take();
        self.interrupt.unregister(pid);
        self.record(LifecycleEvent::Exited { role, status });
        self.record(LifecycleEvent::Reaped { role });
        Ok(status)
    }

    fn stop_server(&mut self) -> Result<ExitStatus, ProcessError> {
        if self
            .client
            .as_ref()
            .is_some_and(|c| c.state() != ProcessState::Reaped)
        {
            return Err(ProcessError::ClientStillRunning);
        }

        let server = self
            .server
            .as_mut()
            .ok_or(ProcessError::NotStarted(Role::Server))?;
        if server.terminate()? {
            self.record(LifecycleEvent::Signaled { role: Role::Server });
        }

        let status = self.reap(Role::Server)?;
        self.pid_file.remove()?;
        Ok(status)
    }

    /// Tear down whatever is still running, client first. Errors are logged,
    /// never returned, so this is safe on any failure path.
    pub fn abort(&mut self) {
        for role in [Role::Client, Role::Server] {
            let Some(handle) = self.slot(role).as_mut() else {
                continue;
            };
            if handle.state() == ProcessState::Running {
                match handle.terminate() {
                    Ok(true) => self.record(LifecycleEvent::Signaled { role }),
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Failed to terminate {}: {}", role, e);
                        continue;
                    }
                }
            }
            if let Err(e) = self.reap(role) {
                warn!("Failed to reap {}: {}", role, e);
            }
        }
        // Leftover handles are killed by their own Drop.
        self.client.take();
        self.server.take();
        if let Err(e) = self.pid_file.remove() {
            warn!("{}", e);
        }
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        if self.client.is_some() || self.server.is_some() {
            warn!("Process manager dropped with live processes; tearing down");
            self.abort();
        }
    }
}

/// Directory argument with the trailing separator the executables expect
fn dir_arg(path: &Path) -> OsString {
    let mut arg = path.as_os_str().to_owned();
    if !arg.to_string_lossy().ends_with('/') {
        arg.push("/");
    }
    arg
}

/// `-p <target>/ -a 0.0.0.0:<port> -m <mode>`
pub fn server_args(config: &RunConfig) -> Vec<OsString> {
    vec![
        "-p".into(),
        dir_arg(&config.target),
        "-a".into(),
        config.bind_addr().into(),
        "-m".into(),
        config.mode.as_arg().into(),
    ]
}

/// `-p <source>/ -a 127.0.0.1:<port> -m <mode>`
pub fn client_args(config: &RunConfig) -> Vec<OsString> {
    vec![
        "-p".into(),
        dir_arg(&config.source),
        "-a".into(),
        config.connect_addr().into(),
        "-m".into(),
        config.mode.as_arg().into(),
    ]
}

/// Fail unless `addr` can be bound right now. The listener is dropped at
/// once, leaving the port to the server about to be spawned.
pub fn ensure_port_free(addr: &str) -> Result<(), ProcessError> {
    match TcpListener::bind(addr) {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(source) => Err(ProcessError::PortInUse {
            addr: addr.to_string(),
            source,
        }),
    }
}

/// Poll `addr` until a TCP connect succeeds, the server exits, or `timeout`
/// elapses.
pub fn wait_until_ready(
    server: &mut ProcessHandle,
    addr: &str,
    timeout: Duration,
) -> Result<(), ProcessError> {
    let not_ready = || ProcessError::ServerNotReady {
        addr: addr.to_string(),
        waited: timeout,
    };
    let targets: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|_| not_ready())?
        .collect();

    let start = Instant::now();
    loop {
        if let Some(status) = server.try_exited()? {
            return Err(ProcessError::ServerExitedEarly(describe_status(&status)));
        }
        if targets
            .iter()
            .any(|target| TcpStream::connect_timeout(target, PROBE_CONNECT_TIMEOUT).is_ok())
        {
            // The connect only counts while the spawned server is alive.
            if let Some(status) = server.try_exited()? {
                return Err(ProcessError::ServerExitedEarly(describe_status(&status)));
            }
            debug!("Server accepting on {} after {:?}", addr, start.elapsed());
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(not_ready());
        }
        thread::sleep(PROBE_INTERVAL);
    }
}
