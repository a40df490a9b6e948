//! The harness driver
//!
//! Runs the steps strictly in sequence:
//! build -> generate fixtures -> evict old server -> wipe target ->
//! start server -> start client -> wait for client -> stop server -> verify.
//!
//! Environment problems (build, fixture IO, spawn) abort the run. The client's
//! exit status and the verification verdict are reported separately in the
//! [`RunOutcome`], since a client can exit 0 and still deliver corrupt data.

use crate::build::{BuildError, BuildOrchestrator, Executables, SystemToolchain, Toolchain};
use crate::config::{ConfigError, RunConfig};
use crate::fixtures::{FixtureError, FixtureSet, ReconcileReport};
use crate::process::{Completion, InterruptHandle, LifecycleEvent, ProcessError, ProcessManager};
use crate::report::{ReportError, RunReport};
use crate::verify::{self, VerificationError, VerificationReport};
use chrono::Utc;
use log::{info, warn};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Fixture error: {0}")]
    Fixture(#[from] FixtureError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Verification failed: {0}")]
    Verification(#[from] VerificationError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    #[error("Failed to prepare target directory {path}: {source}")]
    TargetDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything a finished run observed
#[derive(Debug)]
pub struct RunOutcome {
    pub completion: Completion,
    pub verification: Result<VerificationReport, VerificationError>,
    pub journal: Vec<LifecycleEvent>,
    /// Where the run report went, if it could be written
    pub report_path: Option<PathBuf>,
}

impl RunOutcome {
    /// The first verification failure, if any
    pub fn verification_error(&self) -> Option<VerificationError> {
        match &self.verification {
            Ok(report) => report.first_failure(),
            Err(e) => Some(e.clone()),
        }
    }

    /// Client exited 0 and every file arrived intact
    pub fn passed(&self) -> bool {
        self.completion.client_succeeded() && self.verification_error().is_none()
    }
}

pub struct Harness<T: Toolchain = SystemToolchain> {
    config: RunConfig,
    orchestrator: BuildOrchestrator<T>,
    interrupt: InterruptHandle,
}

impl Harness<SystemToolchain> {
    pub fn new(config: RunConfig) -> Self {
        Self::with_toolchain(config, SystemToolchain)
    }
}

impl<T: Toolchain> Harness<T> {
    pub fn with_toolchain(config: RunConfig, toolchain: T) -> Self {
        Self {
            config,
            orchestrator: BuildOrchestrator::with_toolchain(toolchain),
            interrupt: InterruptHandle::default(),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Handle for terminating children from a signal handler
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Build the executables, or locate prebuilt ones when skipping the build
    pub fn build(&self) -> Result<Executables, HarnessError> {
        if self.config.skip_build {
            info!("Skipping build; using executables in {:?}", self.config.build_dir);
            return Ok(Executables::in_build_dir(&self.config.build_dir).ensure_present()?);
        }
        println!("Building...");
        let executables = self.orchestrator.build(&self.config)?;
        println!("Building... Done");
        Ok(executables)
    }

    /// Reconcile the source directory with the configured fixture set
    pub fn generate(&self) -> Result<ReconcileReport, HarnessError> {
        let set = FixtureSet::new(self.config.count, self.config.size_mb);
        Ok(set.reconcile(&self.config.source)?)
    }

    /// Compare source and target without running anything
    pub fn verify(&self) -> Result<VerificationReport, HarnessError> {
        Ok(verify::verify(&self.config.source, &self.config.target)?)
    }

    /// Empty the target directory so files from an earlier run cannot pass
    /// verification for this one.
    fn prepare_target(&self) -> Result<(), HarnessError> {
        let target = &self.config.target;
        let err = |source| HarnessError::TargetDir {
            path: target.clone(),
            source,
        };
        if target.exists() {
            fs::remove_dir_all(target).map_err(err)?;
        }
        fs::create_dir_all(target).map_err(err)
    }

    /// The full pipeline
    pub fn run(&self) -> Result<RunOutcome, HarnessError> {
        let executables = self.build()?;
        self.generate()?;

        let started_at = Utc::now();
        let mut manager =
            ProcessManager::with_interrupt(&self.config.log_dir, self.interrupt.clone());

        // An old server still running could write into a freshly wiped target.
        manager.evict_previous_server(&executables)?;
        self.prepare_target()?;

        println!("Starting server on port {}...", self.config.port);
        manager.start_server(&self.config, &executables)?;
        println!("Starting server on port {}... Done", self.config.port);

        manager.start_client(&self.config, &executables)?;
        let completion = manager.wait_for_completion()?;
        let journal = manager.journal().to_vec();
        drop(manager);

        let verification = verify::compare_trees(&self.config.source, &self.config.target);

        let report = RunReport::new(&self.config, started_at, &completion, &verification);
        let report_path = match report.write(&self.config.log_dir) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Could not write run report: {}", e);
                None
            }
        };

        Ok(RunOutcome {
            completion,
            verification,
            journal,
            report_path,
        })
    }
}
