//! Common test utilities for the harness
//!
//! The executables under test are stood in for by small `/bin/sh` scripts
//! written into a scratch build directory, so no native toolchain or real
//! transfer pair is needed.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use xfer_harness_lib::config::{PartialConfig, RunConfig, TransferMode};

/// Write an executable shell script
pub fn write_script(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

/// Scratch layout for one harness run
pub struct Workspace {
    pub temp: TempDir,
    pub source: PathBuf,
    pub target: PathBuf,
    pub build_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Marker files the fake executables drop to prove ordering
    pub marks: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        let marks = root.join("marks");
        fs::create_dir_all(&marks).unwrap();

        Self {
            source: root.join("in"),
            target: root.join("out"),
            build_dir: root.join("build"),
            log_dir: root.join("logs"),
            marks,
            temp,
        }
    }

    pub fn server_exe(&self) -> PathBuf {
        self.build_dir.join("bin").join("tcp_server")
    }

    pub fn client_exe(&self) -> PathBuf {
        self.build_dir.join("bin").join("tcp_client")
    }

    pub fn mark(&self, name: &str) -> PathBuf {
        self.marks.join(name)
    }

    /// Config using prebuilt fakes and no readiness probe
    pub fn config(&self, count: usize, size_mb: u64) -> RunConfig {
        self.config_with(PartialConfig {
            count: Some(count),
            size_mb: Some(size_mb),
            ..Default::default()
        })
    }

    pub fn config_with(&self, partial: PartialConfig) -> RunConfig {
        let base = PartialConfig {
            source: Some(self.source.clone()),
            target: Some(self.target.clone()),
            project_dir: Some(self.temp.path().to_path_buf()),
            build_dir: Some(self.build_dir.clone()),
            log_dir: Some(self.log_dir.clone()),
            mode: Some(TransferMode::Duplex),
            ready_timeout_ms: Some(0),
            skip_build: Some(true),
            port: Some(23452),
            ..Default::default()
        };
        RunConfig::from_partial(base.merge(partial), self.temp.path()).unwrap()
    }

    /// A server that idles until SIGTERM and records whether the client
    /// had already finished when the signal arrived.
    pub fn install_server(&self) {
        self.install_server_body(&format!(
            r#"MARKS="{marks}"
touch "$MARKS/server.started"
echo "server args: $*"
trap 'if [ -f "$MARKS/client.done" ]; then touch "$MARKS/server.after_client"; fi; exit 0' TERM
while :; do sleep 1 & wait $!; done"#,
            marks = self.marks.display()
        ));
    }

    pub fn install_server_body(&self, body: &str) {
        write_script(&self.server_exe(), body);
    }

    /// A client that copies every fixture into the target directory, runs
    /// `after_copy` and exits with `exit_code`.
    pub fn install_client(&self, after_copy: &str, exit_code: i32) {
        self.install_client_body(&format!(
            r#"SRC="$2"
TARGET="{target}"
echo "client args: $*"
cp "$SRC"*.raw "$TARGET/"
{after_copy}
touch "{marks}/client.done"
exit {exit_code}"#,
            target = self.target.display(),
            marks = self.marks.display(),
        ));
    }

    pub fn install_client_body(&self, body: &str) {
        write_script(&self.client_exe(), body);
    }
}
