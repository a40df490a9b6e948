use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{error, info};
use std::process::ExitCode;
use xfer_harness_lib::cli::{Cli, Commands};
use xfer_harness_lib::config::PartialConfig;
use xfer_harness_lib::process::describe_status;
use xfer_harness_lib::{Harness, RunConfig, RunOutcome};

/// Exit status after an interrupt, matching a shell's 128 + SIGINT. SIGTERM
/// reaches the same handler and exits with this status too.
const INTERRUPTED_EXIT: i32 = 130;

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logger with specified or default log level
    let env = match cli.log_level {
        Some(ref log_level) => Env::default().filter_or("RUST_LOG", log_level),
        None => Env::default().filter_or("RUST_LOG", "info"),
    };
    env_logger::init_from_env(env);

    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let config = RunConfig::resolve(
        cli.config.config.as_deref(),
        PartialConfig::from(&cli.config),
        &cwd,
    )
    .context("Failed to resolve harness configuration")?;
    info!("Resolved configuration: {:?}", config);

    let harness = Harness::new(config);

    // Terminate any children on Ctrl+C so an interrupted run leaks nothing
    let interrupt = harness.interrupt_handle();
    ctrlc::set_handler(move || {
        interrupt.terminate_all();
        std::process::exit(INTERRUPTED_EXIT);
    })
    .context("Failed to install interrupt handler")?;

    match cli.command() {
        Commands::Run => {
            let outcome = harness.run().context("Harness run aborted")?;
            Ok(print_outcome(&outcome))
        }
        Commands::Build => {
            let exes = harness.build().context("Build failed")?;
            println!("✓ Server: {}", exes.server.display());
            println!("✓ Client: {}", exes.client.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Generate => {
            let report = harness
                .generate()
                .context("Fixture generation failed")?;
            println!(
                "✓ Fixtures ready in '{}' ({} kept, {} removed, {} written)",
                harness.config().source.display(),
                report.kept.len(),
                report.removed.len(),
                report.written.len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Verify => match harness.verify() {
            Ok(report) => {
                println!("✓ {} file(s) verified", report.files.len());
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                error!("{}", e);
                println!("✗ {}", e);
                Ok(ExitCode::FAILURE)
            }
        },
    }
}

/// Report both pass/fail signals separately and pick the exit code
fn print_outcome(outcome: &RunOutcome) -> ExitCode {
    let client = &outcome.completion.client;
    if client.success() {
        println!("✓ Client finished successfully");
    } else {
        println!("✗ Client failed ({})", describe_status(client));
    }

    match outcome.verification_error() {
        None => println!("✓ Output matches input"),
        Some(e) => println!("✗ Verification failed: {}", e),
    }

    if let Some(path) = &outcome.report_path {
        println!("  Report: {}", path.display());
    }

    if outcome.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
