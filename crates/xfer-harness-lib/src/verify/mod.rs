//! Byte-level comparison of the source and target trees
//!
//! Every regular file in the source directory must have a same-named,
//! byte-identical regular file in the target directory. Files are compared
//! on raw bytes, streamed in fixed-size chunks, and the first differing
//! offset is reported so a broken transfer can be located precisely.

use log::{debug, error, info};
use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("{file}: missing in output")]
    MissingInOutput { file: String },

    #[error(
        "{file}: content mismatch at offset {offset} (source {}, target {})",
        fmt_byte(.source_byte),
        fmt_byte(.target_byte)
    )]
    ContentMismatch {
        file: String,
        offset: u64,
        source_byte: Option<u8>,
        target_byte: Option<u8>,
    },

    #[error("IO error reading {path}: {message}")]
    Io { path: PathBuf, message: String },
}

fn fmt_byte(byte: &Option<u8>) -> String {
    match byte {
        Some(b) => format!("0x{:02x}", b),
        None => "EOF".to_string(),
    }
}

fn io_error(path: &Path, e: io::Error) -> VerificationError {
    VerificationError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

/// Per-file outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonResult {
    Match,
    MissingInTarget,
    /// First differing byte. A byte is `None` where that file already ended.
    ContentMismatch {
        offset: u64,
        source_byte: Option<u8>,
        target_byte: Option<u8>,
    },
}

impl ComparisonResult {
    pub fn is_match(&self) -> bool {
        matches!(self, ComparisonResult::Match)
    }

    /// The error describing this outcome, if it is a failure
    pub fn to_error(self, file: &str) -> Option<VerificationError> {
        match self {
            ComparisonResult::Match => None,
            ComparisonResult::MissingInTarget => Some(VerificationError::MissingInOutput {
                file: file.to_string(),
            }),
            ComparisonResult::ContentMismatch {
                offset,
                source_byte,
                target_byte,
            } => Some(VerificationError::ContentMismatch {
                file: file.to_string(),
                offset,
                source_byte,
                target_byte,
            }),
        }
    }
}

/// Results for every source file, in name order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub files: Vec<(String, ComparisonResult)>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.files.iter().all(|(_, r)| r.is_match())
    }

    /// The first divergent file, as an error
    pub fn first_failure(&self) -> Option<VerificationError> {
        self.files
            .iter()
            .find_map(|(name, result)| result.to_error(name))
    }

    pub fn into_result(self) -> Result<Self, VerificationError> {
        match self.first_failure() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

/// Compare every regular file in `source` against `target`.
///
/// IO problems abort; divergences are collected into the report.
pub fn compare_trees(source: &Path, target: &Path) -> Result<VerificationReport, VerificationError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(source).map_err(|e| io_error(source, e))? {
        let entry = entry.map_err(|e| io_error(source, e))?;
        let file_type = entry.file_type().map_err(|e| io_error(&entry.path(), e))?;
        if file_type.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();

    let mut report = VerificationReport::default();
    for name in names {
        let result = compare_file(&source.join(&name), &target.join(&name))?;
        match result {
            ComparisonResult::Match => debug!("{}: ok", name),
            ComparisonResult::MissingInTarget => error!("{}: missing in output", name),
            ComparisonResult::ContentMismatch {
                offset,
                source_byte,
                target_byte,
            } => error!(
                "{}: first difference at offset {} (source {}, target {})",
                name,
                offset,
                fmt_byte(&source_byte),
                fmt_byte(&target_byte)
            ),
        }
        report.files.push((name, result));
    }

    Ok(report)
}

/// Compare both trees and fail on the first divergent file.
pub fn verify(source: &Path, target: &Path) -> Result<VerificationReport, VerificationError> {
    let report = compare_trees(source, target)?.into_result()?;
    info!(
        "Verified {} file(s): {:?} matches {:?}",
        report.files.len(),
        target,
        source
    );
    Ok(report)
}

/// Compare one source file against its counterpart.
pub fn compare_file(source: &Path, target: &Path) -> Result<ComparisonResult, VerificationError> {
    match fs::metadata(target) {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => return Ok(ComparisonResult::MissingInTarget),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(ComparisonResult::MissingInTarget)
        }
        Err(e) => return Err(io_error(target, e)),
    }

    let mut src = File::open(source).map_err(|e| io_error(source, e))?;
    let mut tgt = File::open(target).map_err(|e| io_error(target, e))?;
    let mut src_buf = vec![0u8; CHUNK_SIZE];
    let mut tgt_buf = vec![0u8; CHUNK_SIZE];
    let mut offset = 0u64;

    loop {
        let src_len = fill(&mut src, &mut src_buf).map_err(|e| io_error(source, e))?;
        let tgt_len = fill(&mut tgt, &mut tgt_buf).map_err(|e| io_error(target, e))?;
        let common = src_len.min(tgt_len);

        if let Some(i) = first_difference(&src_buf[..common], &tgt_buf[..common]) {
            return Ok(ComparisonResult::ContentMismatch {
                offset: offset + i as u64,
                source_byte: Some(src_buf[i]),
                target_byte: Some(tgt_buf[i]),
            });
        }

        match src_len.cmp(&tgt_len) {
            Ordering::Equal if src_len == 0 => return Ok(ComparisonResult::Match),
            Ordering::Equal => offset += src_len as u64,
            // One side ended inside this chunk.
            Ordering::Less => {
                return Ok(ComparisonResult::ContentMismatch {
                    offset: offset + common as u64,
                    source_byte: None,
                    target_byte: Some(tgt_buf[common]),
                })
            }
            Ordering::Greater => {
                return Ok(ComparisonResult::ContentMismatch {
                    offset: offset + common as u64,
                    source_byte: Some(src_buf[common]),
                    target_byte: None,
                })
            }
        }
    }
}

/// Index of the first differing byte in two equal-length slices
pub fn first_difference(a: &[u8], b: &[u8]) -> Option<usize> {
    if a == b {
        return None;
    }
    a.iter().zip(b).position(|(x, y)| x != y)
}

/// Read until `buf` is full or EOF, so chunk boundaries line up on both files.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
