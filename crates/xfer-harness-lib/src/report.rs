//! Per-run summary written next to the process logs

use crate::config::{RunConfig, TransferMode};
use crate::process::{describe_status, Completion};
use crate::verify::{VerificationError, VerificationReport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const REPORT_FILE: &str = "report.toml";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: String,
    pub finished_at: String,
    pub mode: TransferMode,
    pub count: usize,
    pub size_mb: u64,
    pub port: u16,
    pub client: ExitSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ExitSummary>,
    pub verification: VerificationSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitSummary {
    pub success: bool,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationSummary {
    pub passed: bool,
    pub files_checked: usize,
    /// One line per divergent file, in name order
    pub failures: Vec<String>,
}

impl VerificationSummary {
    pub fn from_result(result: &Result<VerificationReport, VerificationError>) -> Self {
        match result {
            Ok(report) => VerificationSummary {
                passed: report.passed(),
                files_checked: report.files.len(),
                failures: report
                    .files
                    .iter()
                    .filter_map(|(name, r)| r.to_error(name))
                    .map(|e| e.to_string())
                    .collect(),
            },
            Err(e) => VerificationSummary {
                passed: false,
                files_checked: 0,
                failures: vec![e.to_string()],
            },
        }
    }
}

impl RunReport {
    pub fn new(
        config: &RunConfig,
        started_at: DateTime<Utc>,
        completion: &Completion,
        verification: &Result<VerificationReport, VerificationError>,
    ) -> Self {
        Self {
            started_at: started_at.to_rfc3339(),
            finished_at: Utc::now().to_rfc3339(),
            mode: config.mode,
            count: config.count,
            size_mb: config.size_mb,
            port: config.port,
            client: ExitSummary {
                success: completion.client.success(),
                status: describe_status(&completion.client),
            },
            server: completion.server.map(|status| ExitSummary {
                success: status.success(),
                status: describe_status(&status),
            }),
            verification: VerificationSummary::from_result(verification),
        }
    }

    /// Write `report.toml` into `dir`, replacing any previous report.
    pub fn write(&self, dir: &Path) -> Result<PathBuf, ReportError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(REPORT_FILE);
        std::fs::write(&path, toml::to_string_pretty(self)?)?;
        Ok(path)
    }
}
