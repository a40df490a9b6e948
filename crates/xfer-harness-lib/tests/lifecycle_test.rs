mod common;

use common::Workspace;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serial_test::serial;
use std::fs;
use std::net::TcpListener;
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};
use xfer_harness_lib::build::Executables;
use xfer_harness_lib::config::PartialConfig;
use xfer_harness_lib::fixtures::FixtureSet;
use xfer_harness_lib::process::{LifecycleEvent, ProcessError, ProcessManager, Role};
use xfer_harness_lib::{Harness, VerificationError};

fn position(journal: &[LifecycleEvent], wanted: impl Fn(&LifecycleEvent) -> bool) -> usize {
    journal
        .iter()
        .position(wanted)
        .unwrap_or_else(|| panic!("event missing from journal: {:?}", journal))
}

#[test]
#[serial]
fn test_successful_duplex_run() {
    let ws = Workspace::new();
    ws.install_server();
    ws.install_client("", 0);

    let outcome = Harness::new(ws.config(3, 1)).run().unwrap();

    assert!(outcome.completion.client_succeeded());
    assert!(outcome.passed(), "{:?}", outcome.verification_error());

    let report = outcome.verification.as_ref().unwrap();
    assert_eq!(report.files.len(), 3);
    for name in FixtureSet::new(3, 1).names() {
        let source = fs::read(ws.source.join(&name)).unwrap();
        let target = fs::read(ws.target.join(&name)).unwrap();
        assert_eq!(source.len(), 1_048_576);
        assert_eq!(source, target, "{} differs", name);
    }

    // Logs, report and pid file bookkeeping
    let server_log = fs::read_to_string(ws.log_dir.join("tcp_server.log")).unwrap();
    assert!(server_log.contains("-a 0.0.0.0:23452 -m duplex"));
    let client_log = fs::read_to_string(ws.log_dir.join("tcp_client.log")).unwrap();
    assert!(client_log.contains(&format!("-p {}/ -a 127.0.0.1:23452", ws.source.display())));
    assert!(outcome.report_path.unwrap().exists());
    assert!(!ws.log_dir.join("tcp_server.pid").exists());
}

#[test]
#[serial]
fn test_server_stopped_only_after_client_exit() {
    let ws = Workspace::new();
    ws.install_server();
    // Keep the client busy for a while so an early teardown would show.
    ws.install_client("sleep 1", 0);

    let outcome = Harness::new(ws.config(1, 1)).run().unwrap();

    let journal = &outcome.journal;
    let client_exit = position(journal, |e| {
        matches!(e, LifecycleEvent::Exited { role: Role::Client, .. })
    });
    let server_signal = position(journal, |e| {
        matches!(e, LifecycleEvent::Signaled { role: Role::Server })
    });
    let server_exit = position(journal, |e| {
        matches!(e, LifecycleEvent::Exited { role: Role::Server, .. })
    });
    assert!(client_exit < server_signal);
    assert!(server_signal < server_exit);

    // The server itself saw the client's completion marker when signaled.
    assert!(ws.mark("server.after_client").exists());
}

#[test]
#[serial]
fn test_missing_target_file_is_named() {
    let ws = Workspace::new();
    ws.install_server();
    ws.install_client(&format!("rm \"{}/1.raw\"", ws.target.display()), 0);

    let outcome = Harness::new(ws.config(3, 1)).run().unwrap();

    assert!(outcome.completion.client_succeeded());
    assert!(!outcome.passed());
    assert_eq!(
        outcome.verification_error(),
        Some(VerificationError::MissingInOutput {
            file: "1.raw".into()
        })
    );
}

#[test]
#[serial]
fn test_corruption_is_localized() {
    let ws = Workspace::new();
    ws.install_server();
    ws.install_client(
        &format!(
            "printf 'X' | dd of=\"{}/2.raw\" bs=1 seek=500000 conv=notrunc 2>/dev/null",
            ws.target.display()
        ),
        0,
    );

    let outcome = Harness::new(ws.config(3, 1)).run().unwrap();

    assert_eq!(
        outcome.verification_error(),
        Some(VerificationError::ContentMismatch {
            file: "2.raw".into(),
            offset: 500_000,
            source_byte: Some(FixtureSet::expected_byte(500_000)),
            target_byte: Some(b'X'),
        })
    );
}

#[test]
#[serial]
fn test_client_failure_is_reported_but_verification_still_runs() {
    let ws = Workspace::new();
    ws.install_server();
    ws.install_client("", 2);

    let outcome = Harness::new(ws.config(2, 1)).run().unwrap();

    assert_eq!(outcome.completion.client.code(), Some(2));
    assert!(outcome.verification_error().is_none());
    assert!(!outcome.passed());
}

#[test]
#[serial]
fn test_stale_target_files_do_not_mask_failures() {
    let ws = Workspace::new();
    ws.install_server();
    ws.install_client(&format!("rm \"{}/0.raw\"", ws.target.display()), 0);

    // A previous run left a perfect copy behind.
    FixtureSet::new(1, 1).reconcile(&ws.target).unwrap();

    let outcome = Harness::new(ws.config(1, 1)).run().unwrap();
    assert_eq!(
        outcome.verification_error(),
        Some(VerificationError::MissingInOutput {
            file: "0.raw".into()
        })
    );
}

#[test]
#[serial]
fn test_client_spawn_failure_tears_down_server() {
    let ws = Workspace::new();
    ws.install_server();
    let config = ws.config(1, 1);
    let executables = Executables {
        server: ws.server_exe(),
        client: ws.temp.path().join("missing").join("tcp_client"),
    };

    let mut manager = ProcessManager::new(&ws.log_dir);
    manager.start_server(&config, &executables).unwrap();
    let server_pid = manager.server().unwrap().pid();

    let result = manager.start_client(&config, &executables);

    assert!(matches!(
        result,
        Err(ProcessError::Spawn {
            role: Role::Client,
            ..
        })
    ));
    assert!(manager.server().is_none());
    assert_eq!(kill(server_pid, None), Err(nix::Error::ESRCH));
    assert!(!ws.log_dir.join("tcp_server.pid").exists());
    assert!(manager.interrupt_handle().live().is_empty());
}

#[test]
#[serial]
fn test_previous_server_instance_is_evicted() {
    let ws = Workspace::new();
    ws.install_server();
    ws.install_client("", 0);
    fs::create_dir_all(&ws.log_dir).unwrap();

    // A server left behind by an earlier, crashed run.
    let mut leftover = Command::new(ws.server_exe())
        .args(["-p", "/nonexistent/", "-a", "0.0.0.0:1", "-m", "duplex"])
        .spawn()
        .unwrap();
    fs::write(ws.log_dir.join("tcp_server.pid"), format!("{}\n", leftover.id())).unwrap();
    // Let the shell install its trap.
    assert!(wait_for(&ws.mark("server.started"), Duration::from_secs(5)));

    let outcome = Harness::new(ws.config(1, 1)).run().unwrap();

    assert!(outcome.passed());
    let status = leftover.wait().unwrap();
    assert_eq!(status.code(), Some(0), "left-over server exits via its TERM trap");
}

/// Holds the server's listening socket from the moment the fake server has
/// started until the client is done, the way a real server would.
fn listen_for_server(ws: &Workspace, port: u16) -> thread::JoinHandle<bool> {
    let started = ws.mark("server.started");
    let done = ws.mark("client.done");
    thread::spawn(move || {
        if !wait_for(&started, Duration::from_secs(5)) {
            return false;
        }
        let Ok(listener) = TcpListener::bind(("127.0.0.1", port)) else {
            return false;
        };
        let finished = wait_for(&done, Duration::from_secs(20));
        drop(listener);
        finished
    })
}

fn wait_for(path: &Path, limit: Duration) -> bool {
    let start = Instant::now();
    while !path.exists() {
        if start.elapsed() > limit {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    true
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
#[serial]
fn test_readiness_probe_waits_for_listener() {
    let ws = Workspace::new();
    ws.install_server();
    ws.install_client("", 0);

    let port = free_port();
    let socket = listen_for_server(&ws, port);
    let config = ws.config_with(PartialConfig {
        count: Some(1),
        size_mb: Some(1),
        port: Some(port),
        ready_timeout_ms: Some(5000),
        ..Default::default()
    });

    let outcome = Harness::new(config).run().unwrap();

    assert!(socket.join().unwrap(), "listener never came up");
    let spawned = position(&outcome.journal, |e| {
        matches!(e, LifecycleEvent::Spawned { role: Role::Server, .. })
    });
    let ready = position(&outcome.journal, |e| {
        *e == LifecycleEvent::Ready { role: Role::Server }
    });
    assert!(spawned < ready);
    assert!(outcome.passed());
}

#[test]
#[serial]
fn test_foreign_listener_blocks_server_start() {
    let ws = Workspace::new();
    ws.install_server_body(&format!(
        "touch \"{}/server.started\"\necho 'bind: address in use' >&2\nexit 1",
        ws.marks.display()
    ));

    // Some other program already owns the port.
    let foreign = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = foreign.local_addr().unwrap().port();
    let config = ws.config_with(PartialConfig {
        port: Some(port),
        ready_timeout_ms: Some(2000),
        ..Default::default()
    });
    let executables = Executables {
        server: ws.server_exe(),
        client: ws.client_exe(),
    };

    let mut manager = ProcessManager::new(&ws.log_dir);
    let result = manager.start_server(&config, &executables);

    assert!(matches!(result, Err(ProcessError::PortInUse { .. })));
    assert!(manager.server().is_none());
    assert!(manager.journal().is_empty());
    assert!(!ws.mark("server.started").exists(), "server must not be spawned");
    assert!(!ws.log_dir.join("tcp_server.pid").exists());
}

#[test]
#[serial]
fn test_server_that_already_exited_is_not_signaled() {
    let ws = Workspace::new();
    ws.install_server_body("echo 'server gone'\nexit 0");
    ws.install_client("sleep 1", 0);

    let outcome = Harness::new(ws.config(1, 1)).run().unwrap();

    assert_eq!(outcome.completion.server.and_then(|s| s.code()), Some(0));
    assert!(!outcome
        .journal
        .contains(&LifecycleEvent::Signaled { role: Role::Server }));
    assert!(outcome
        .journal
        .contains(&LifecycleEvent::Reaped { role: Role::Server }));
}

#[test]
#[serial]
fn test_previous_server_evicted_before_target_is_wiped() {
    let ws = Workspace::new();
    // On TERM, the instance left behind drops a file into the target.
    ws.install_server_body(&format!(
        r#"touch "{marks}/server.started"
trap 'if [ "$2" = "/stale/" ]; then echo stale > "{target}/stale.raw"; fi; exit 0' TERM
while :; do sleep 1 & wait $!; done"#,
        marks = ws.marks.display(),
        target = ws.target.display()
    ));
    ws.install_client("", 0);
    fs::create_dir_all(&ws.log_dir).unwrap();
    fs::create_dir_all(&ws.target).unwrap();

    let mut leftover = Command::new(ws.server_exe())
        .args(["-p", "/stale/", "-a", "0.0.0.0:1", "-m", "duplex"])
        .spawn()
        .unwrap();
    fs::write(ws.log_dir.join("tcp_server.pid"), format!("{}\n", leftover.id())).unwrap();
    assert!(wait_for(&ws.mark("server.started"), Duration::from_secs(5)));

    let outcome = Harness::new(ws.config(1, 1)).run().unwrap();

    assert_eq!(leftover.wait().unwrap().code(), Some(0));
    assert!(outcome.passed());
    assert!(!ws.target.join("stale.raw").exists());
}

#[test]
#[serial]
fn test_readiness_timeout_kills_server() {
    let ws = Workspace::new();
    ws.install_server();
    ws.install_client("", 0);

    // Nothing ever listens on this port.
    let port = free_port();
    let config = ws.config_with(PartialConfig {
        count: Some(1),
        size_mb: Some(1),
        port: Some(port),
        ready_timeout_ms: Some(300),
        ..Default::default()
    });
    let executables = Executables {
        server: ws.server_exe(),
        client: ws.client_exe(),
    };

    let mut manager = ProcessManager::new(&ws.log_dir);
    let result = manager.start_server(&config, &executables);

    assert!(matches!(result, Err(ProcessError::ServerNotReady { .. })));
    assert!(manager.server().is_none());
    assert!(!ws.mark("client.done").exists());
}

#[test]
#[serial]
fn test_server_exiting_early_is_detected() {
    let ws = Workspace::new();
    ws.install_server_body("echo 'bind failed' >&2; exit 1");

    let config = ws.config_with(PartialConfig {
        ready_timeout_ms: Some(5000),
        ..Default::default()
    });
    let executables = Executables {
        server: ws.server_exe(),
        client: ws.client_exe(),
    };

    let mut manager = ProcessManager::new(&ws.log_dir);
    let result = manager.start_server(&config, &executables);

    match result {
        Err(ProcessError::ServerExitedEarly(status)) => assert_eq!(status, "exit code 1"),
        other => panic!("expected early exit, got {:?}", other),
    }
    let log = fs::read_to_string(ws.log_dir.join("tcp_server.log")).unwrap();
    assert!(log.contains("bind failed"));
}

#[test]
#[serial]
fn test_server_cannot_start_twice() {
    let ws = Workspace::new();
    ws.install_server();
    let config = ws.config(1, 1);
    let executables = Executables {
        server: ws.server_exe(),
        client: ws.client_exe(),
    };

    let mut manager = ProcessManager::new(&ws.log_dir);
    manager.start_server(&config, &executables).unwrap();
    assert!(matches!(
        manager.start_server(&config, &executables),
        Err(ProcessError::AlreadyStarted(Role::Server))
    ));

    let pid: Pid = manager.server().unwrap().pid();
    manager.abort();
    assert_eq!(kill(pid, None), Err(nix::Error::ESRCH));
}
