pub mod build;
pub mod cli;
pub mod config;
pub mod fixtures;
pub mod harness;
pub mod process;
pub mod report;
pub mod verify;

pub use build::{BuildError, BuildOrchestrator, Executables, SystemToolchain, Toolchain};
pub use config::{ConfigError, RunConfig, TransferMode};
pub use fixtures::{FixtureError, FixtureSet, ReconcileReport};
pub use harness::{Harness, HarnessError, RunOutcome};
pub use process::{InterruptHandle, ProcessError, ProcessHandle, ProcessManager, ProcessState, Role};
pub use verify::{ComparisonResult, VerificationError, VerificationReport};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
